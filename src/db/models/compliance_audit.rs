//! Compliance audits.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::db::query::find_scoped;

text_enum! {
    pub enum AuditStatus {
        Scheduled => "scheduled",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
}

impl AuditStatus {
    /// Whether an audit may move from `self` to `next`
    pub fn can_transition_to(&self, next: AuditStatus) -> bool {
        matches!(
            (self, next),
            (AuditStatus::Scheduled, AuditStatus::InProgress)
                | (AuditStatus::Scheduled, AuditStatus::Failed)
                | (AuditStatus::InProgress, AuditStatus::Completed)
                | (AuditStatus::InProgress, AuditStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ComplianceAudit {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub framework: String,
    pub auditor: Option<String>,
    pub status: String,
    pub scheduled_for: Option<String>,
    pub completed_at: Option<String>,
    pub findings_count: i64,
    pub score: Option<f64>,
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateComplianceAuditRequest {
    pub name: String,
    pub framework: String,
    pub auditor: Option<String>,
    pub scheduled_for: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateComplianceAuditRequest {
    pub name: Option<String>,
    pub auditor: Option<String>,
    pub scheduled_for: Option<String>,
    pub status: Option<String>,
    pub findings_count: Option<i64>,
    pub score: Option<f64>,
    pub summary: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComplianceAuditFilter {
    pub status: Option<String>,
    pub framework: Option<String>,
    pub search: Option<String>,
}

/// Validated column values for an audit update
#[derive(Debug, Default)]
pub struct AuditChanges<'a> {
    pub name: Option<&'a str>,
    pub auditor: Option<&'a str>,
    pub scheduled_for: Option<String>,
    pub status: Option<AuditStatus>,
    /// Only apply the update while the row is still in this status
    pub expected_status: Option<AuditStatus>,
    pub completed_at: Option<String>,
    pub findings_count: Option<i64>,
    pub score: Option<f64>,
    pub summary: Option<&'a str>,
}

impl ComplianceAudit {
    pub fn status_enum(&self) -> Option<AuditStatus> {
        self.status.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        req: &CreateComplianceAuditRequest,
        scheduled_for: Option<&str>,
    ) -> Result<ComplianceAudit, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO compliance_audits (id, organization_id, name, framework, auditor, status, scheduled_for, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'scheduled', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(req.name.trim())
        .bind(req.framework.trim().to_lowercase())
        .bind(&req.auditor)
        .bind(scheduled_for)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "compliance_audits", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn update(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        changes: &AuditChanges<'_>,
    ) -> Result<Option<ComplianceAudit>, sqlx::Error> {
        let now = crate::utils::now();
        let result = sqlx::query(
            r#"
            UPDATE compliance_audits
            SET name = COALESCE(?, name),
                auditor = COALESCE(?, auditor),
                scheduled_for = COALESCE(?, scheduled_for),
                status = COALESCE(?, status),
                completed_at = COALESCE(?, completed_at),
                findings_count = COALESCE(?, findings_count),
                score = COALESCE(?, score),
                summary = COALESCE(?, summary),
                updated_at = ?
            WHERE id = ? AND organization_id = ? AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(changes.name)
        .bind(changes.auditor)
        .bind(&changes.scheduled_for)
        .bind(changes.status.map(|s| s.to_string()))
        .bind(&changes.completed_at)
        .bind(changes.findings_count)
        .bind(changes.score)
        .bind(changes.summary)
        .bind(&now)
        .bind(id)
        .bind(organization_id)
        .bind(changes.expected_status.map(|s| s.to_string()))
        .bind(changes.expected_status.map(|s| s.to_string()))
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "compliance_audits", organization_id, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    #[test]
    fn test_status_transitions() {
        use AuditStatus::*;
        assert!(Scheduled.can_transition_to(InProgress));
        assert!(Scheduled.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Scheduled.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Scheduled));
    }

    #[tokio::test]
    async fn test_create_and_complete() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();

        let audit = ComplianceAudit::create(
            &db,
            &org.id,
            &CreateComplianceAuditRequest {
                name: "Q1 SOC 2".to_string(),
                framework: "soc2".to_string(),
                auditor: Some("Deloitte".to_string()),
                scheduled_for: None,
            },
            Some("2024-03-01T00:00:00.000Z"),
        )
        .await
        .unwrap();
        assert_eq!(audit.status, "scheduled");
        assert_eq!(audit.findings_count, 0);
        assert!(audit.score.is_none());

        let done = ComplianceAudit::update(
            &db,
            &org.id,
            &audit.id,
            &AuditChanges {
                status: Some(AuditStatus::Completed),
                completed_at: Some("2024-03-10T00:00:00.000Z".to_string()),
                score: Some(92.5),
                findings_count: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(done.status, "completed");
        assert_eq!(done.score, Some(92.5));
        assert_eq!(done.findings_count, 3);
        assert_eq!(done.auditor.as_deref(), Some("Deloitte"));
    }

    #[tokio::test]
    async fn test_status_change_requires_expected_status() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let audit = ComplianceAudit::create(
            &db,
            &org.id,
            &CreateComplianceAuditRequest {
                name: "HIPAA review".to_string(),
                framework: "hipaa".to_string(),
                auditor: None,
                scheduled_for: None,
            },
            None,
        )
        .await
        .unwrap();

        let started = ComplianceAudit::update(
            &db,
            &org.id,
            &audit.id,
            &AuditChanges {
                status: Some(AuditStatus::InProgress),
                expected_status: Some(AuditStatus::Scheduled),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(started.is_some());

        // A writer holding the old `scheduled` read cannot fail the audit
        let stale = ComplianceAudit::update(
            &db,
            &org.id,
            &audit.id,
            &AuditChanges {
                status: Some(AuditStatus::Failed),
                expected_status: Some(AuditStatus::Scheduled),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(stale.is_none());

        let renamed = ComplianceAudit::update(
            &db,
            &org.id,
            &audit.id,
            &AuditChanges {
                name: Some("HIPAA review 2024"),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(renamed.status, "in_progress");
    }
}
