//! Organizations (tenants).

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

text_enum! {
    pub enum OrgStatus {
        Active => "active",
        Suspended => "suspended",
    }
}

text_enum! {
    /// Subscription plan
    pub enum Plan {
        Free => "free",
        Starter => "starter",
        Pro => "pro",
        Enterprise => "enterprise",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub plan: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
    /// Optional slug (derived from name if not provided)
    pub slug: Option<String>,
    pub plan: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrganizationRequest {
    pub name: Option<String>,
    pub plan: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrganizationFilter {
    pub status: Option<String>,
    pub plan: Option<String>,
    pub search: Option<String>,
}

impl Organization {
    pub async fn create(
        db: &SqlitePool,
        name: &str,
        slug: &str,
        plan: &str,
    ) -> Result<Organization, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, slug, plan, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'active', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(slug)
        .bind(plan)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        Self::find(db, &id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find(db: &SqlitePool, id: &str) -> Result<Option<Organization>, sqlx::Error> {
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Apply a partial update; unchanged fields keep their stored value
    pub async fn update(
        db: &SqlitePool,
        id: &str,
        name: Option<&str>,
        plan: Option<&str>,
        status: Option<&str>,
    ) -> Result<Option<Organization>, sqlx::Error> {
        let now = crate::utils::now();
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET name = COALESCE(?, name),
                plan = COALESCE(?, plan),
                status = COALESCE(?, status),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(plan)
        .bind(status)
        .bind(&now)
        .bind(id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Self::find(db, id).await
    }

    pub fn is_active(&self) -> bool {
        self.status == OrgStatus::Active.to_string()
    }
}
