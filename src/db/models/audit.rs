//! Audit log models for tracking user actions.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::query::{paginate, Filter, PageQuery, Paginated};

/// Audit log entry for tracking user actions
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: String,
    pub organization_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub details: Option<String>,
    pub created_at: String,
}

/// Query parameters for filtering audit logs
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuditLogQuery {
    /// Filter by action (e.g., "release.publish")
    pub action: Option<String>,
    /// Filter by resource type (e.g., "webhook", "attestation")
    pub resource_type: Option<String>,
    /// Filter by resource ID
    pub resource_id: Option<String>,
    /// Filter by user ID
    pub user_id: Option<String>,
    /// Start date for filtering (ISO 8601)
    pub start_date: Option<String>,
    /// End date for filtering (ISO 8601)
    pub end_date: Option<String>,
}

/// A single audit event before it is written
#[derive(Debug, Clone, Default)]
pub struct AuditEntry<'a> {
    pub organization_id: Option<&'a str>,
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
    pub resource_name: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub ip_address: Option<&'a str>,
    pub details: Option<serde_json::Value>,
}

/// Common audit action types
pub mod actions {
    // Auth actions
    pub const AUTH_LOGIN: &str = "auth.login";
    pub const AUTH_LOGOUT: &str = "auth.logout";

    // Organization and user actions
    pub const ORGANIZATION_CREATE: &str = "organization.create";
    pub const ORGANIZATION_UPDATE: &str = "organization.update";
    pub const USER_CREATE: &str = "user.create";

    // Compliance actions
    pub const ATTESTATION_CREATE: &str = "attestation.create";
    pub const ATTESTATION_UPDATE: &str = "attestation.update";
    pub const ATTESTATION_ATTEST: &str = "attestation.attest";
    pub const ATTESTATION_REJECT: &str = "attestation.reject";
    pub const ATTESTATION_DELETE: &str = "attestation.delete";
    pub const AUDIT_CREATE: &str = "compliance_audit.create";
    pub const AUDIT_UPDATE: &str = "compliance_audit.update";
    pub const AUDIT_DELETE: &str = "compliance_audit.delete";
    pub const EXPORT_REQUEST: &str = "data_export.request";
    pub const EXPORT_STATUS: &str = "data_export.status";
    pub const RETENTION_CREATE: &str = "retention_policy.create";
    pub const RETENTION_UPDATE: &str = "retention_policy.update";
    pub const RETENTION_DELETE: &str = "retention_policy.delete";
    pub const RETENTION_EXECUTE: &str = "retention_policy.execute";

    // Operations actions
    pub const EMAIL_TEMPLATE_CREATE: &str = "email_template.create";
    pub const EMAIL_TEMPLATE_UPDATE: &str = "email_template.update";
    pub const EMAIL_TEMPLATE_DELETE: &str = "email_template.delete";
    pub const FEATURE_FLAG_CREATE: &str = "feature_flag.create";
    pub const FEATURE_FLAG_UPDATE: &str = "feature_flag.update";
    pub const FEATURE_FLAG_DELETE: &str = "feature_flag.delete";
    pub const WEBHOOK_CREATE: &str = "webhook.create";
    pub const WEBHOOK_UPDATE: &str = "webhook.update";
    pub const WEBHOOK_DELETE: &str = "webhook.delete";
    pub const WEBHOOK_ROTATE_SECRET: &str = "webhook.rotate_secret";
    pub const RELEASE_CREATE: &str = "release.create";
    pub const RELEASE_UPDATE: &str = "release.update";
    pub const RELEASE_PUBLISH: &str = "release.publish";
    pub const RELEASE_ARCHIVE: &str = "release.archive";
    pub const RELEASE_DELETE: &str = "release.delete";
    pub const RULE_CREATE: &str = "rule.create";
    pub const RULE_UPDATE: &str = "rule.update";
    pub const RULE_TOGGLE: &str = "rule.toggle";
    pub const RULE_DELETE: &str = "rule.delete";

    // Monitoring actions
    pub const THREAT_REPORT: &str = "security_threat.report";
    pub const THREAT_UPDATE: &str = "security_threat.update";
    pub const THREAT_RESOLVE: &str = "security_threat.resolve";
    pub const THREAT_DELETE: &str = "security_threat.delete";
    pub const HEALTH_SCORE_CALCULATE: &str = "health_score.calculate";
    pub const PIPELINE_CREATE: &str = "pipeline.create";
    pub const PIPELINE_UPDATE: &str = "pipeline.update";
    pub const PIPELINE_PAUSE: &str = "pipeline.pause";
    pub const PIPELINE_RESUME: &str = "pipeline.resume";
    pub const PIPELINE_DELETE: &str = "pipeline.delete";
    pub const PIPELINE_RUN_TRIGGER: &str = "pipeline.run.trigger";
    pub const PIPELINE_RUN_STATUS: &str = "pipeline.run.status";
}

/// Common resource types
pub mod resource_types {
    pub const SESSION: &str = "session";
    pub const ORGANIZATION: &str = "organization";
    pub const USER: &str = "user";
    pub const ATTESTATION: &str = "attestation";
    pub const COMPLIANCE_AUDIT: &str = "compliance_audit";
    pub const DATA_EXPORT: &str = "data_export";
    pub const RETENTION_POLICY: &str = "retention_policy";
    pub const EMAIL_TEMPLATE: &str = "email_template";
    pub const FEATURE_FLAG: &str = "feature_flag";
    pub const WEBHOOK: &str = "webhook";
    pub const RELEASE: &str = "release";
    pub const RULE: &str = "rule";
    pub const SECURITY_THREAT: &str = "security_threat";
    pub const HEALTH_SCORE: &str = "health_score";
    pub const PIPELINE: &str = "pipeline";
    pub const PIPELINE_RUN: &str = "pipeline_run";
}

/// Log an audit event to the database
pub async fn log_audit(db: &SqlitePool, entry: &AuditEntry<'_>) -> Result<(), sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = crate::utils::now();
    let details_json = entry.details.as_ref().map(|d| d.to_string());

    sqlx::query(
        r#"
        INSERT INTO audit_logs (id, organization_id, action, resource_type, resource_id, resource_name, user_id, ip_address, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(entry.organization_id)
    .bind(entry.action)
    .bind(entry.resource_type)
    .bind(entry.resource_id)
    .bind(entry.resource_name)
    .bind(entry.user_id)
    .bind(entry.ip_address)
    .bind(&details_json)
    .bind(&now)
    .execute(db)
    .await?;

    tracing::debug!(
        action = entry.action,
        resource_type = entry.resource_type,
        resource_id = entry.resource_id,
        user_id = entry.user_id,
        "Audit log recorded"
    );

    Ok(())
}

/// List an organization's audit logs with filtering and pagination
pub async fn list_audit_logs(
    db: &SqlitePool,
    organization_id: &str,
    query: &AuditLogQuery,
    page: &PageQuery,
) -> Result<Paginated<AuditLog>, sqlx::Error> {
    let filter = Filter::for_org(organization_id)
        .eq("action", query.action.as_deref())
        .eq("resource_type", query.resource_type.as_deref())
        .eq("resource_id", query.resource_id.as_deref())
        .eq("user_id", query.user_id.as_deref())
        .since("created_at", query.start_date.as_deref())
        .until("created_at", query.end_date.as_deref());

    paginate(db, "audit_logs", &filter, "created_at DESC", page).await
}

/// Distinct values of an audit column within an organization
pub async fn distinct_audit_values(
    db: &SqlitePool,
    organization_id: &str,
    column: AuditColumn,
) -> Result<Vec<String>, sqlx::Error> {
    let column = match column {
        AuditColumn::Action => "action",
        AuditColumn::ResourceType => "resource_type",
    };
    let sql = format!(
        "SELECT DISTINCT {0} FROM audit_logs WHERE organization_id = ? ORDER BY {0}",
        column
    );
    let rows: Vec<(String,)> = sqlx::query_as(&sql)
        .bind(organization_id)
        .fetch_all(db)
        .await?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

#[derive(Debug, Clone, Copy)]
pub enum AuditColumn {
    Action,
    ResourceType,
}
