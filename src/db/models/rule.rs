//! Business rules: JSON conditions matched against an evaluation context.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};

use crate::db::query::find_scoped;

text_enum! {
    pub enum MatchMode {
        All => "all",
        Any => "any",
    }
}

text_enum! {
    pub enum Operator {
        Eq => "eq",
        Neq => "neq",
        Gt => "gt",
        Gte => "gte",
        Lt => "lt",
        Lte => "lte",
        Contains => "contains",
        In => "in",
    }
}

/// Bounds for `priority`
pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 1000;
pub const DEFAULT_PRIORITY: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    /// Whether the condition holds for `context`. A missing field never matches.
    pub fn matches(&self, context: &Value) -> bool {
        let actual = match lookup(context, &self.field) {
            Some(v) => v,
            None => return false,
        };

        match self.operator {
            Operator::Eq => loosely_equal(actual, &self.value),
            Operator::Neq => !loosely_equal(actual, &self.value),
            Operator::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            Operator::Gte => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            Operator::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            Operator::Lte => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            Operator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                }
                (Value::Array(items), needle) => items.iter().any(|i| loosely_equal(i, needle)),
                _ => false,
            },
            Operator::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| loosely_equal(actual, o)),
                _ => false,
            },
        }
    }
}

/// Resolve a dot path (`user.plan`, `items.0.sku`) inside a JSON value
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Rule {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub severity: String,
    pub conditions: String,
    pub match_mode: String,
    pub priority: i64,
    pub is_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Rule with its conditions decoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleResponse {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub severity: String,
    pub conditions: Vec<Condition>,
    pub match_mode: String,
    pub priority: i64,
    pub is_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Rule> for RuleResponse {
    fn from(r: Rule) -> Self {
        Self {
            conditions: r.condition_list(),
            id: r.id,
            organization_id: r.organization_id,
            name: r.name,
            description: r.description,
            category: r.category,
            severity: r.severity,
            match_mode: r.match_mode,
            priority: r.priority,
            is_enabled: r.is_enabled,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub severity: Option<String>,
    pub conditions: Vec<Condition>,
    pub match_mode: Option<String>,
    pub priority: Option<i64>,
    pub is_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub severity: Option<String>,
    pub conditions: Option<Vec<Condition>>,
    pub match_mode: Option<String>,
    pub priority: Option<i64>,
    pub is_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RuleFilter {
    pub category: Option<String>,
    pub severity: Option<String>,
    pub enabled: Option<bool>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRuleRequest {
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub matched: bool,
    /// Indexes of the conditions that held
    pub matched_conditions: Vec<usize>,
}

/// Validated column values for a rule write
#[derive(Debug)]
pub struct RuleFields<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub category: &'a str,
    pub severity: crate::db::Severity,
    pub conditions: &'a [Condition],
    pub match_mode: MatchMode,
    pub priority: i64,
    pub is_enabled: bool,
}

impl Rule {
    pub fn condition_list(&self) -> Vec<Condition> {
        serde_json::from_str(&self.conditions).unwrap_or_default()
    }

    pub fn match_mode_enum(&self) -> MatchMode {
        self.match_mode.parse().unwrap_or(MatchMode::All)
    }

    /// Evaluate the rule's conditions against `context`
    pub fn evaluate(&self, context: &Value) -> RuleEvaluation {
        let conditions = self.condition_list();
        let matched_conditions: Vec<usize> = conditions
            .iter()
            .enumerate()
            .filter(|(_, c)| c.matches(context))
            .map(|(i, _)| i)
            .collect();

        let matched = self.is_enabled
            && !conditions.is_empty()
            && match self.match_mode_enum() {
                MatchMode::All => matched_conditions.len() == conditions.len(),
                MatchMode::Any => !matched_conditions.is_empty(),
            };

        RuleEvaluation {
            rule_id: self.id.clone(),
            matched,
            matched_conditions,
        }
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        fields: &RuleFields<'_>,
    ) -> Result<Rule, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();
        let conditions =
            serde_json::to_string(fields.conditions).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO rules (id, organization_id, name, description, category, severity, conditions, match_mode, priority, is_enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(fields.name)
        .bind(fields.description)
        .bind(fields.category)
        .bind(fields.severity.to_string())
        .bind(&conditions)
        .bind(fields.match_mode.to_string())
        .bind(fields.priority)
        .bind(fields.is_enabled)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "rules", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Overwrite every editable column of `id`
    pub async fn save(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        fields: &RuleFields<'_>,
    ) -> Result<Option<Rule>, sqlx::Error> {
        let conditions =
            serde_json::to_string(fields.conditions).unwrap_or_else(|_| "[]".to_string());

        let result = sqlx::query(
            r#"
            UPDATE rules
            SET name = ?, description = ?, category = ?, severity = ?, conditions = ?,
                match_mode = ?, priority = ?, is_enabled = ?, updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(fields.name)
        .bind(fields.description)
        .bind(fields.category)
        .bind(fields.severity.to_string())
        .bind(&conditions)
        .bind(fields.match_mode.to_string())
        .bind(fields.priority)
        .bind(fields.is_enabled)
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "rules", organization_id, id).await
    }

    pub async fn toggle(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
    ) -> Result<Option<Rule>, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE rules SET is_enabled = 1 - is_enabled, updated_at = ? WHERE id = ? AND organization_id = ?",
        )
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "rules", organization_id, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization, Severity};
    use serde_json::json;

    fn cond(field: &str, operator: Operator, value: Value) -> Condition {
        Condition {
            field: field.to_string(),
            operator,
            value,
        }
    }

    fn rule(conditions: Vec<Condition>, mode: MatchMode, enabled: bool) -> Rule {
        Rule {
            id: "r1".to_string(),
            organization_id: "o1".to_string(),
            name: "Big spender".to_string(),
            description: None,
            category: "billing".to_string(),
            severity: "medium".to_string(),
            conditions: serde_json::to_string(&conditions).unwrap(),
            match_mode: mode.to_string(),
            priority: 100,
            is_enabled: enabled,
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
            updated_at: "2024-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_lookup_dot_paths() {
        let ctx = json!({"user": {"plan": "pro", "tags": ["a", "b"]}});
        assert_eq!(lookup(&ctx, "user.plan"), Some(&json!("pro")));
        assert_eq!(lookup(&ctx, "user.tags.1"), Some(&json!("b")));
        assert_eq!(lookup(&ctx, "user.missing"), None);
        assert_eq!(lookup(&ctx, "user.plan.deeper"), None);
    }

    #[test]
    fn test_operators() {
        let ctx = json!({"amount": 250, "country": "GH", "email": "Ops@Acme.io", "tags": ["vip"]});

        assert!(cond("amount", Operator::Gt, json!(100)).matches(&ctx));
        assert!(cond("amount", Operator::Gte, json!(250.0)).matches(&ctx));
        assert!(!cond("amount", Operator::Lt, json!(250)).matches(&ctx));
        assert!(cond("amount", Operator::Lte, json!(250)).matches(&ctx));
        assert!(cond("amount", Operator::Eq, json!(250.0)).matches(&ctx));
        assert!(cond("country", Operator::Neq, json!("NG")).matches(&ctx));
        assert!(cond("email", Operator::Contains, json!("acme")).matches(&ctx));
        assert!(cond("tags", Operator::Contains, json!("vip")).matches(&ctx));
        assert!(cond("country", Operator::In, json!(["GH", "KE"])).matches(&ctx));
        assert!(!cond("country", Operator::In, json!("GH")).matches(&ctx));
        assert!(!cond("amount", Operator::Gt, json!("100")).matches(&ctx));
        assert!(!cond("missing", Operator::Neq, json!(1)).matches(&ctx));
    }

    #[test]
    fn test_match_modes() {
        let conditions = vec![
            cond("amount", Operator::Gt, json!(100)),
            cond("country", Operator::Eq, json!("NG")),
        ];
        let ctx = json!({"amount": 500, "country": "GH"});

        let all = rule(conditions.clone(), MatchMode::All, true).evaluate(&ctx);
        assert!(!all.matched);
        assert_eq!(all.matched_conditions, vec![0]);

        let any = rule(conditions.clone(), MatchMode::Any, true).evaluate(&ctx);
        assert!(any.matched);

        let disabled = rule(conditions, MatchMode::Any, false).evaluate(&ctx);
        assert!(!disabled.matched);
        assert_eq!(disabled.matched_conditions, vec![0]);
    }

    #[test]
    fn test_empty_conditions_never_match() {
        assert!(!rule(vec![], MatchMode::All, true).evaluate(&json!({})).matched);
    }

    #[tokio::test]
    async fn test_toggle() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let conditions = vec![cond("amount", Operator::Gt, json!(1))];

        let created = Rule::create(
            &db,
            &org.id,
            &RuleFields {
                name: "r",
                description: None,
                category: "fraud",
                severity: Severity::High,
                conditions: &conditions,
                match_mode: MatchMode::All,
                priority: DEFAULT_PRIORITY,
                is_enabled: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(created.condition_list(), conditions);

        let toggled = Rule::toggle(&db, &org.id, &created.id).await.unwrap().unwrap();
        assert!(!toggled.is_enabled);
        let toggled = Rule::toggle(&db, &org.id, &created.id).await.unwrap().unwrap();
        assert!(toggled.is_enabled);
    }
}
