//! Data retention policies.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::db::query::find_scoped;

text_enum! {
    /// Record kinds a retention policy can prune
    pub enum RetentionResource {
        AuditLogs => "audit_logs",
        DataExports => "data_exports",
        WebhookDeliveries => "webhook_deliveries",
        PipelineRuns => "pipeline_runs",
        SecurityThreats => "security_threats",
    }
}

impl RetentionResource {
    /// DELETE statement for this resource; binds are `(organization_id, cutoff)`.
    ///
    /// Only records in a final state are eligible.
    pub fn delete_sql(&self) -> &'static str {
        match self {
            RetentionResource::AuditLogs => {
                "DELETE FROM audit_logs WHERE organization_id = ? AND created_at < ?"
            }
            RetentionResource::DataExports => {
                "DELETE FROM data_exports WHERE organization_id = ? AND created_at < ? \
                 AND status IN ('completed', 'failed', 'expired')"
            }
            RetentionResource::WebhookDeliveries => {
                "DELETE FROM webhook_deliveries WHERE organization_id = ? AND created_at < ?"
            }
            RetentionResource::PipelineRuns => {
                "DELETE FROM pipeline_runs WHERE organization_id = ? AND created_at < ? \
                 AND status IN ('succeeded', 'failed', 'cancelled')"
            }
            RetentionResource::SecurityThreats => {
                "DELETE FROM security_threats WHERE organization_id = ? AND created_at < ? \
                 AND status IN ('resolved', 'false_positive')"
            }
        }
    }
}

/// Bounds for `retention_days`
pub const MIN_RETENTION_DAYS: i64 = 1;
pub const MAX_RETENTION_DAYS: i64 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RetentionPolicy {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub resource_type: String,
    pub retention_days: i64,
    pub is_active: bool,
    pub last_run_at: Option<String>,
    pub last_run_deleted: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRetentionPolicyRequest {
    pub name: String,
    pub resource_type: String,
    pub retention_days: i64,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRetentionPolicyRequest {
    pub name: Option<String>,
    pub retention_days: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetentionPolicyFilter {
    pub resource_type: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetentionRunResponse {
    pub policy_id: String,
    pub resource_type: String,
    pub cutoff: String,
    pub deleted: u64,
}

impl RetentionPolicy {
    pub fn resource(&self) -> Option<RetentionResource> {
        self.resource_type.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        name: &str,
        resource: RetentionResource,
        retention_days: i64,
        is_active: bool,
    ) -> Result<RetentionPolicy, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO retention_policies (id, organization_id, name, resource_type, retention_days, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(name.trim())
        .bind(resource.to_string())
        .bind(retention_days)
        .bind(is_active)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "retention_policies", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn update(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        req: &UpdateRetentionPolicyRequest,
    ) -> Result<Option<RetentionPolicy>, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE retention_policies
            SET name = COALESCE(?, name),
                retention_days = COALESCE(?, retention_days),
                is_active = COALESCE(?, is_active),
                updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(req.name.as_deref().map(str::trim))
        .bind(req.retention_days)
        .bind(req.is_active)
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "retention_policies", organization_id, id).await
    }

    pub async fn record_run(
        db: &SqlitePool,
        id: &str,
        ran_at: &str,
        deleted: u64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE retention_policies SET last_run_at = ?, last_run_deleted = ? WHERE id = ?",
        )
        .bind(ran_at)
        .bind(deleted as i64)
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn list_active(db: &SqlitePool) -> Result<Vec<RetentionPolicy>, sqlx::Error> {
        sqlx::query_as::<_, RetentionPolicy>(
            "SELECT * FROM retention_policies WHERE is_active = 1 ORDER BY created_at",
        )
        .fetch_all(db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization, TextEnum};

    #[test]
    fn test_every_resource_is_org_scoped() {
        for resource in RetentionResource::all() {
            let sql = resource.delete_sql();
            assert!(sql.starts_with("DELETE FROM"));
            assert!(sql.contains("organization_id = ? AND created_at < ?"));
        }
    }

    #[tokio::test]
    async fn test_duplicate_resource_per_org_conflicts() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();

        let policy = RetentionPolicy::create(
            &db,
            &org.id,
            "Audit logs 90d",
            RetentionResource::AuditLogs,
            90,
            true,
        )
        .await
        .unwrap();
        assert!(policy.is_active);
        assert_eq!(policy.resource(), Some(RetentionResource::AuditLogs));

        let err = RetentionPolicy::create(
            &db,
            &org.id,
            "Again",
            RetentionResource::AuditLogs,
            30,
            true,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("UNIQUE"));
    }

    #[tokio::test]
    async fn test_list_active_skips_disabled() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        RetentionPolicy::create(&db, &org.id, "a", RetentionResource::AuditLogs, 90, true)
            .await
            .unwrap();
        RetentionPolicy::create(&db, &org.id, "b", RetentionResource::PipelineRuns, 30, false)
            .await
            .unwrap();

        let active = RetentionPolicy::list_active(&db).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "a");
    }
}
