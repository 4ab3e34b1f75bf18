//! Data pipelines and their runs.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::db::query::find_scoped;

text_enum! {
    pub enum PipelineStatus {
        Active => "active",
        Paused => "paused",
    }
}

text_enum! {
    pub enum SourceType {
        Survey => "survey",
        Api => "api",
        Database => "database",
        File => "file",
    }
}

text_enum! {
    pub enum RunStatus {
        Queued => "queued",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether a run may move from `self` to `next`
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::Queued => matches!(next, RunStatus::Running | RunStatus::Cancelled),
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

text_enum! {
    pub enum TriggerType {
        Manual => "manual",
        Schedule => "schedule",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pipeline {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub description: Option<String>,
    pub source_type: String,
    pub source_config: Option<String>,
    pub destination: String,
    pub schedule: Option<String>,
    pub status: String,
    pub next_run_at: Option<String>,
    pub last_run_at: Option<String>,
    pub last_run_status: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePipelineRequest {
    pub name: String,
    pub description: Option<String>,
    pub source_type: String,
    pub source_config: Option<serde_json::Value>,
    pub destination: String,
    pub schedule: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePipelineRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source_type: Option<String>,
    pub source_config: Option<serde_json::Value>,
    pub destination: Option<String>,
    /// An empty string clears the schedule
    pub schedule: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PipelineFilter {
    pub status: Option<String>,
    pub source_type: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    pub organization_id: String,
    pub status: String,
    #[sqlx(rename = "trigger_type")]
    #[serde(rename = "trigger")]
    pub trigger: String,
    pub triggered_by: Option<String>,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunFilter {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRunStatusRequest {
    pub status: String,
    pub records_processed: Option<i64>,
    pub error_message: Option<String>,
}

/// Validated column values for a pipeline write
#[derive(Debug)]
pub struct PipelineFields<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub source_type: SourceType,
    pub source_config: Option<String>,
    pub destination: &'a str,
    pub schedule: Option<&'a str>,
}

impl Pipeline {
    pub fn status_enum(&self) -> Option<PipelineStatus> {
        self.status.parse().ok()
    }

    pub fn is_active(&self) -> bool {
        self.status_enum() == Some(PipelineStatus::Active)
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        fields: &PipelineFields<'_>,
        next_run_at: Option<&str>,
    ) -> Result<Pipeline, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO pipelines (id, organization_id, name, description, source_type, source_config, destination, schedule, status, next_run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(fields.name)
        .bind(fields.description)
        .bind(fields.source_type.to_string())
        .bind(&fields.source_config)
        .bind(fields.destination)
        .bind(fields.schedule)
        .bind(next_run_at)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "pipelines", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Overwrite the editable columns and the derived `next_run_at`
    pub async fn save(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        fields: &PipelineFields<'_>,
        next_run_at: Option<&str>,
    ) -> Result<Option<Pipeline>, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET name = ?, description = ?, source_type = ?, source_config = ?, destination = ?,
                schedule = ?, next_run_at = ?, updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(fields.name)
        .bind(fields.description)
        .bind(fields.source_type.to_string())
        .bind(&fields.source_config)
        .bind(fields.destination)
        .bind(fields.schedule)
        .bind(next_run_at)
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "pipelines", organization_id, id).await
    }

    pub async fn set_status(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        status: PipelineStatus,
        next_run_at: Option<&str>,
    ) -> Result<Option<Pipeline>, sqlx::Error> {
        sqlx::query(
            "UPDATE pipelines SET status = ?, next_run_at = ?, updated_at = ? WHERE id = ? AND organization_id = ?",
        )
        .bind(status.to_string())
        .bind(next_run_at)
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        find_scoped(db, "pipelines", organization_id, id).await
    }

    /// Active pipelines whose next scheduled run is due
    pub async fn list_due(db: &SqlitePool, now: &str) -> Result<Vec<Pipeline>, sqlx::Error> {
        sqlx::query_as::<_, Pipeline>(
            r#"
            SELECT * FROM pipelines
            WHERE status = 'active' AND schedule IS NOT NULL AND next_run_at IS NOT NULL AND next_run_at <= ?
            ORDER BY next_run_at
            "#,
        )
        .bind(now)
        .fetch_all(db)
        .await
    }

    pub async fn set_next_run(
        db: &SqlitePool,
        id: &str,
        next_run_at: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE pipelines SET next_run_at = ? WHERE id = ?")
            .bind(next_run_at)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn record_run(
        db: &SqlitePool,
        id: &str,
        at: &str,
        status: RunStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE pipelines SET last_run_at = ?, last_run_status = ? WHERE id = ?")
            .bind(at)
            .bind(status.to_string())
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}

impl PipelineRun {
    pub fn status_enum(&self) -> Option<RunStatus> {
        self.status.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        pipeline: &Pipeline,
        trigger: TriggerType,
        triggered_by: Option<&str>,
    ) -> Result<PipelineRun, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, pipeline_id, organization_id, status, trigger_type, triggered_by, created_at)
            VALUES (?, ?, ?, 'queued', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&pipeline.id)
        .bind(&pipeline.organization_id)
        .bind(trigger.to_string())
        .bind(triggered_by)
        .bind(crate::utils::now())
        .execute(db)
        .await?;

        find_scoped(db, "pipeline_runs", &pipeline.organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Whether the pipeline has a queued or running run
    pub async fn has_active(db: &SqlitePool, pipeline_id: &str) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pipeline_runs WHERE pipeline_id = ? AND status IN ('queued', 'running')",
        )
        .bind(pipeline_id)
        .fetch_one(db)
        .await?;
        Ok(count > 0)
    }

    /// Move a run from `from` to `status`. Returns `None` when the run is
    /// missing or no longer in `from`.
    pub async fn set_status(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        from: RunStatus,
        status: RunStatus,
        records_processed: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<Option<PipelineRun>, sqlx::Error> {
        let now = crate::utils::now();
        let started_at = (status == RunStatus::Running).then(|| now.clone());
        let finished_at = status.is_terminal().then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = ?,
                records_processed = COALESCE(?, records_processed),
                error_message = COALESCE(?, error_message),
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ? AND organization_id = ? AND status = ?
            "#,
        )
        .bind(status.to_string())
        .bind(records_processed)
        .bind(error_message)
        .bind(&started_at)
        .bind(&finished_at)
        .bind(id)
        .bind(organization_id)
        .bind(from.to_string())
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "pipeline_runs", organization_id, id).await
    }

    /// Failed runs across all organizations since `since`
    pub async fn count_failed_since(db: &SqlitePool, since: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM pipeline_runs WHERE status = 'failed' AND created_at >= ?",
        )
        .bind(since)
        .fetch_one(db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    #[test]
    fn test_run_transitions() {
        use RunStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Queued));
        for terminal in [Succeeded, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Running));
        }
    }

    async fn setup() -> (SqlitePool, Pipeline) {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let pipeline = Pipeline::create(
            &db,
            &org.id,
            &PipelineFields {
                name: "NPS survey sync",
                description: None,
                source_type: SourceType::Survey,
                source_config: None,
                destination: "warehouse.nps",
                schedule: Some("0 0 * * * *"),
            },
            Some("2024-01-01T01:00:00.000Z"),
        )
        .await
        .unwrap();
        (db, pipeline)
    }

    #[tokio::test]
    async fn test_run_lifecycle_timestamps() {
        let (db, pipeline) = setup().await;
        let run = PipelineRun::create(&db, &pipeline, TriggerType::Manual, Some("user-1"))
            .await
            .unwrap();
        assert_eq!(run.status_enum(), Some(RunStatus::Queued));
        assert_eq!(run.trigger, "manual");
        assert!(PipelineRun::has_active(&db, &pipeline.id).await.unwrap());

        let running = PipelineRun::set_status(
            &db,
            &pipeline.organization_id,
            &run.id,
            RunStatus::Queued,
            RunStatus::Running,
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        let done = PipelineRun::set_status(
            &db,
            &pipeline.organization_id,
            &run.id,
            RunStatus::Running,
            RunStatus::Succeeded,
            Some(1200),
            None,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(done.records_processed, 1200);
        assert_eq!(done.started_at, running.started_at);
        assert!(done.finished_at.is_some());
        assert!(!PipelineRun::has_active(&db, &pipeline.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_transition_is_rejected() {
        let (db, pipeline) = setup().await;
        let org_id = &pipeline.organization_id;
        let run = PipelineRun::create(&db, &pipeline, TriggerType::Manual, None)
            .await
            .unwrap();

        let first = PipelineRun::set_status(
            &db,
            org_id,
            &run.id,
            RunStatus::Queued,
            RunStatus::Cancelled,
            None,
            None,
        )
        .await
        .unwrap();
        assert!(first.is_some());

        // A second writer that also read `queued` loses
        let second = PipelineRun::set_status(
            &db,
            org_id,
            &run.id,
            RunStatus::Queued,
            RunStatus::Running,
            None,
            None,
        )
        .await
        .unwrap();
        assert!(second.is_none());

        let stored: PipelineRun = find_scoped(&db, "pipeline_runs", org_id, &run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status_enum(), Some(RunStatus::Cancelled));
        assert!(stored.started_at.is_none());
    }

    #[tokio::test]
    async fn test_one_active_run_per_pipeline() {
        let (db, pipeline) = setup().await;
        let run = PipelineRun::create(&db, &pipeline, TriggerType::Manual, None)
            .await
            .unwrap();

        let err = PipelineRun::create(&db, &pipeline, TriggerType::Schedule, None)
            .await
            .unwrap_err();
        assert!(crate::db::is_unique_violation(&err));

        PipelineRun::set_status(
            &db,
            &pipeline.organization_id,
            &run.id,
            RunStatus::Queued,
            RunStatus::Cancelled,
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap();
        assert!(PipelineRun::create(&db, &pipeline, TriggerType::Schedule, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_list_due_skips_paused() {
        let (db, pipeline) = setup().await;
        let due = Pipeline::list_due(&db, "2024-01-01T02:00:00.000Z").await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(Pipeline::list_due(&db, "2024-01-01T00:30:00.000Z")
            .await
            .unwrap()
            .is_empty());

        Pipeline::set_status(
            &db,
            &pipeline.organization_id,
            &pipeline.id,
            PipelineStatus::Paused,
            None,
        )
        .await
        .unwrap();
        assert!(Pipeline::list_due(&db, "2024-01-01T02:00:00.000Z")
            .await
            .unwrap()
            .is_empty());
    }
}
