//! Data export requests.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::db::query::find_scoped;

text_enum! {
    pub enum ExportStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Expired => "expired",
    }
}

impl ExportStatus {
    /// Transitions reported by the export worker
    pub fn can_transition_to(&self, next: ExportStatus) -> bool {
        matches!(
            (self, next),
            (ExportStatus::Pending, ExportStatus::Processing)
                | (ExportStatus::Pending, ExportStatus::Failed)
                | (ExportStatus::Processing, ExportStatus::Completed)
                | (ExportStatus::Processing, ExportStatus::Failed)
        )
    }
}

text_enum! {
    pub enum ExportType {
        Users => "users",
        AuditLogs => "audit_logs",
        Compliance => "compliance",
        All => "all",
    }
}

text_enum! {
    pub enum ExportFormat {
        Json => "json",
        Csv => "csv",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DataExport {
    pub id: String,
    pub organization_id: String,
    pub export_type: String,
    pub format: String,
    pub status: String,
    pub requested_by: Option<String>,
    pub file_url: Option<String>,
    pub error_message: Option<String>,
    pub expires_at: String,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateDataExportRequest {
    pub export_type: String,
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateExportStatusRequest {
    pub status: String,
    pub file_url: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DataExportFilter {
    pub status: Option<String>,
    pub export_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub url: String,
    pub expires_at: String,
}

impl DataExport {
    pub fn status_enum(&self) -> Option<ExportStatus> {
        self.status.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        export_type: ExportType,
        format: ExportFormat,
        requested_by: Option<&str>,
        expires_at: &str,
    ) -> Result<DataExport, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO data_exports (id, organization_id, export_type, format, status, requested_by, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(export_type.to_string())
        .bind(format.to_string())
        .bind(requested_by)
        .bind(expires_at)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "data_exports", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Move an export from `from` to `status`. Returns `None` when the export
    /// is missing or no longer in `from`.
    pub async fn set_status(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        from: ExportStatus,
        status: ExportStatus,
        file_url: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<Option<DataExport>, sqlx::Error> {
        let now = crate::utils::now();
        let completed_at = (status == ExportStatus::Completed).then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE data_exports
            SET status = ?, file_url = COALESCE(?, file_url), error_message = COALESCE(?, error_message),
                completed_at = COALESCE(?, completed_at), updated_at = ?
            WHERE id = ? AND organization_id = ? AND status = ?
            "#,
        )
        .bind(status.to_string())
        .bind(file_url)
        .bind(error_message)
        .bind(&completed_at)
        .bind(&now)
        .bind(id)
        .bind(organization_id)
        .bind(from.to_string())
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "data_exports", organization_id, id).await
    }

    /// Mark completed exports past their expiry as expired
    pub async fn expire_due(db: &SqlitePool, now: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE data_exports SET status = 'expired', updated_at = ? WHERE status = 'completed' AND expires_at <= ?",
        )
        .bind(now)
        .bind(now)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }

    pub fn is_expired_at(&self, now: &str) -> bool {
        self.status_enum() == Some(ExportStatus::Expired) || self.expires_at.as_str() <= now
    }
}
