//! Cron scheduling for data pipelines.
//!
//! Schedules use the `cron` crate syntax with a leading seconds field
//! (`sec min hour day month weekday [year]`). Every tick, active pipelines
//! whose `next_run_at` has passed get a queued `schedule` run and their
//! `next_run_at` is advanced.

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tokio::time::{interval, Duration};

use crate::api::metrics::record_pipeline_run_queued;
use crate::config::PipelineConfig;
use crate::db::{is_unique_violation, Pipeline, PipelineRun, TriggerType};
use crate::utils::format_timestamp;
use crate::DbPool;

/// Parse a cron expression, returning a readable error
pub fn parse_schedule(expr: &str) -> Result<Schedule, String> {
    Schedule::from_str(expr.trim()).map_err(|e| format!("Invalid cron expression: {}", e))
}

/// Next fire time strictly after `after`
pub fn next_run_after(expr: &str, after: DateTime<Utc>) -> Option<String> {
    let schedule = parse_schedule(expr).ok()?;
    schedule.after(&after).next().map(format_timestamp)
}

/// `next_run_at` for a pipeline: only active, scheduled pipelines have one
pub fn compute_next_run(active: bool, schedule: Option<&str>, now: DateTime<Utc>) -> Option<String> {
    match schedule {
        Some(expr) if active && !expr.trim().is_empty() => next_run_after(expr, now),
        _ => None,
    }
}

/// Queues scheduled pipeline runs
pub struct PipelineScheduler {
    db: DbPool,
}

impl PipelineScheduler {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Queue runs for every due pipeline, returning how many were queued
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = Pipeline::list_due(&self.db, &format_timestamp(now)).await?;
        let mut queued = 0;

        for pipeline in due {
            let next = pipeline
                .schedule
                .as_deref()
                .and_then(|expr| next_run_after(expr, now));

            match PipelineRun::create(&self.db, &pipeline, TriggerType::Schedule, None).await {
                Ok(run) => {
                    record_pipeline_run_queued(TriggerType::Schedule);
                    queued += 1;
                    tracing::info!(
                        pipeline_id = %pipeline.id,
                        run_id = %run.id,
                        next_run_at = ?next,
                        "Queued scheduled pipeline run"
                    );
                }
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(
                        pipeline_id = %pipeline.id,
                        "Skipping scheduled run, pipeline already has an active run"
                    );
                }
                Err(e) => return Err(e.into()),
            }

            Pipeline::set_next_run(&self.db, &pipeline.id, next.as_deref()).await?;
        }

        Ok(queued)
    }
}

/// Spawn the background pipeline scheduler
pub fn spawn_pipeline_scheduler(db: DbPool, config: PipelineConfig) {
    if !config.scheduler_enabled {
        tracing::info!("Pipeline scheduler is disabled");
        return;
    }

    let tick_secs = config.tick_secs.max(1);
    tracing::info!(tick_secs = tick_secs, "Starting pipeline scheduler");

    let scheduler = PipelineScheduler::new(db);

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(tick_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = scheduler.run_tick(Utc::now()).await {
                tracing::error!(error = %e, "Pipeline scheduler tick failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization, PipelineFields, SourceType};
    use crate::utils::parse_timestamp;

    fn at(ts: &str) -> DateTime<Utc> {
        parse_timestamp(ts).unwrap()
    }

    #[test]
    fn test_parse_schedule() {
        assert!(parse_schedule("0 */15 * * * *").is_ok());
        assert!(parse_schedule("0 0 3 * * Mon").is_ok());
        assert!(parse_schedule("not a cron").is_err());
        assert!(parse_schedule("").is_err());
    }

    #[test]
    fn test_next_run_after() {
        assert_eq!(
            next_run_after("0 0 * * * *", at("2024-01-01T10:15:00.000Z")).as_deref(),
            Some("2024-01-01T11:00:00.000Z")
        );
        assert_eq!(
            next_run_after("0 30 2 * * *", at("2024-01-01T10:15:00.000Z")).as_deref(),
            Some("2024-01-02T02:30:00.000Z")
        );
    }

    #[test]
    fn test_compute_next_run() {
        let now = at("2024-01-01T10:15:00.000Z");
        assert!(compute_next_run(true, Some("0 0 * * * *"), now).is_some());
        assert!(compute_next_run(false, Some("0 0 * * * *"), now).is_none());
        assert!(compute_next_run(true, None, now).is_none());
        assert!(compute_next_run(true, Some("  "), now).is_none());
    }

    #[tokio::test]
    async fn test_tick_queues_due_pipelines_once() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let pipeline = Pipeline::create(
            &db,
            &org.id,
            &PipelineFields {
                name: "Hourly sync",
                description: None,
                source_type: SourceType::Api,
                source_config: None,
                destination: "warehouse.events",
                schedule: Some("0 0 * * * *"),
            },
            Some("2024-01-01T11:00:00.000Z"),
        )
        .await
        .unwrap();

        let scheduler = PipelineScheduler::new(db.clone());
        assert_eq!(scheduler.run_tick(at("2024-01-01T10:59:00.000Z")).await.unwrap(), 0);
        assert_eq!(scheduler.run_tick(at("2024-01-01T11:00:05.000Z")).await.unwrap(), 1);

        let reloaded: Pipeline = sqlx::query_as("SELECT * FROM pipelines WHERE id = ?")
            .bind(&pipeline.id)
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(reloaded.next_run_at.as_deref(), Some("2024-01-01T12:00:00.000Z"));

        // The queued run blocks the next slot
        assert_eq!(scheduler.run_tick(at("2024-01-01T12:00:01.000Z")).await.unwrap(), 0);
        let runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_runs WHERE trigger_type = 'schedule'")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(runs, 1);
    }
}
