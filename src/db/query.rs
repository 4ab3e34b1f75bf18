//! Pagination and filter composition shared by every list endpoint.
//!
//! List handlers take two query extractors: a [`PageQuery`] for `page`/`limit`
//! and a resource specific filter struct. The filter values are folded into a
//! [`Filter`], which renders an `AND`-joined `WHERE` clause with positional
//! bindings, and [`paginate`] runs the count and page queries.

use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, SqlitePool};

/// Page size used when the client does not ask for one
pub const DEFAULT_LIMIT: i64 = 20;
/// Largest page a client can request
pub const MAX_LIMIT: i64 = 100;
/// Highest page number whose offset still fits in an `i64`
pub const MAX_PAGE: i64 = i64::MAX / MAX_LIMIT;

/// `page` / `limit` query parameters
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    /// Page number (1-indexed, defaults to 1)
    pub page: Option<i64>,
    /// Items per page (defaults to 20, max 100)
    pub limit: Option<i64>,
}

impl PageQuery {
    pub fn new(page: i64, limit: i64) -> Self {
        Self {
            page: Some(page),
            limit: Some(limit),
        }
    }

    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).clamp(1, MAX_PAGE)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1) * self.limit()
    }
}

/// Number of pages needed to show `total` items
pub fn total_pages(total: i64, limit: i64) -> i64 {
    if total <= 0 || limit <= 0 {
        0
    } else {
        (total + limit - 1) / limit
    }
}

/// Paginated list envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, total: i64, query: &PageQuery) -> Self {
        let limit = query.limit();
        Self {
            items,
            total,
            page: query.page(),
            limit,
            total_pages: total_pages(total, limit),
        }
    }

    /// Convert the items, keeping the paging metadata
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
            total_pages: self.total_pages,
        }
    }
}

/// Dynamic WHERE clause builder.
///
/// Column names are always `&'static str` from our own code; only values are
/// bound.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<String>,
    bindings: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter scoped to a single organization
    pub fn for_org(organization_id: &str) -> Self {
        Self::new().eq_value("organization_id", organization_id)
    }

    /// `column = value`, skipped when the value is absent or blank
    pub fn eq(self, column: &'static str, value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => self.eq_value(column, v),
            _ => self,
        }
    }

    /// `column = value`, always applied
    pub fn eq_value(mut self, column: &'static str, value: &str) -> Self {
        self.conditions.push(format!("{} = ?", column));
        self.bindings.push(value.to_string());
        self
    }

    /// Boolean column stored as 0/1
    pub fn flag(mut self, column: &'static str, value: Option<bool>) -> Self {
        if let Some(v) = value {
            self.conditions
                .push(format!("{} = {}", column, if v { 1 } else { 0 }));
        }
        self
    }

    /// Case-insensitive substring match over any of the columns
    pub fn search(mut self, columns: &[&'static str], term: Option<&str>) -> Self {
        let term = match term.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return self,
        };
        if columns.is_empty() {
            return self;
        }

        let pattern = format!("%{}%", term.to_lowercase());
        let parts: Vec<String> = columns
            .iter()
            .map(|c| format!("LOWER(COALESCE({}, '')) LIKE ?", c))
            .collect();
        self.conditions.push(format!("({})", parts.join(" OR ")));
        for _ in columns {
            self.bindings.push(pattern.clone());
        }
        self
    }

    /// `column >= value`
    pub fn since(mut self, column: &'static str, value: Option<&str>) -> Self {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            self.conditions.push(format!("{} >= ?", column));
            self.bindings.push(v.trim().to_string());
        }
        self
    }

    /// `column <= value`
    pub fn until(mut self, column: &'static str, value: Option<&str>) -> Self {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            self.conditions.push(format!("{} <= ?", column));
            self.bindings.push(v.trim().to_string());
        }
        self
    }

    pub fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }

    pub fn bindings(&self) -> &[String] {
        &self.bindings
    }
}

/// Run a filtered, paginated `SELECT *` over `table`
pub async fn paginate<T>(
    db: &SqlitePool,
    table: &str,
    filter: &Filter,
    order_by: &str,
    page: &PageQuery,
) -> Result<Paginated<T>, sqlx::Error>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let where_clause = filter.where_clause();

    let count_sql = format!("SELECT COUNT(*) FROM {} {}", table, where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for binding in filter.bindings() {
        count_query = count_query.bind(binding);
    }
    let total = count_query.fetch_one(db).await?;

    let sql = format!(
        "SELECT * FROM {} {} ORDER BY {} LIMIT ? OFFSET ?",
        table, where_clause, order_by
    );
    let mut query_builder = sqlx::query_as::<_, T>(&sql);
    for binding in filter.bindings() {
        query_builder = query_builder.bind(binding);
    }
    let items = query_builder
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(db)
        .await?;

    Ok(Paginated::new(items, total, page))
}

/// Fetch a row by id within an organization
pub async fn find_scoped<T>(
    db: &SqlitePool,
    table: &str,
    organization_id: &str,
    id: &str,
) -> Result<Option<T>, sqlx::Error>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let sql = format!(
        "SELECT * FROM {} WHERE id = ? AND organization_id = ?",
        table
    );
    sqlx::query_as::<_, T>(&sql)
        .bind(id)
        .bind(organization_id)
        .fetch_optional(db)
        .await
}

/// Delete a row by id within an organization, returning whether it existed
pub async fn delete_scoped(
    db: &SqlitePool,
    table: &str,
    organization_id: &str,
    id: &str,
) -> Result<bool, sqlx::Error> {
    let sql = format!("DELETE FROM {} WHERE id = ? AND organization_id = ?", table);
    let result = sqlx::query(&sql)
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}
