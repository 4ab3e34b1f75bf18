//! Periodic maintenance.
//!
//! Each cycle:
//! - Executes every active retention policy
//! - Moves attestations past `expires_at` to `expired`
//! - Moves completed exports past `expires_at` to `expired`
//! - Purges expired sessions

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{interval, Duration};

use crate::config::RetentionConfig;
use crate::db::{events, Attestation, DataExport, RetentionPolicy, RetentionRunResponse, Session};
use crate::notifications::WebhookDispatcher;
use crate::utils::format_timestamp;
use crate::DbPool;

/// Delete the policy's expired records and record the run
pub async fn execute_policy(
    db: &DbPool,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<RetentionRunResponse, sqlx::Error> {
    let resource = policy
        .resource()
        .ok_or_else(|| sqlx::Error::Protocol(format!("unknown resource type {}", policy.resource_type)))?;
    let cutoff = format_timestamp(now - ChronoDuration::days(policy.retention_days));

    let deleted = sqlx::query(resource.delete_sql())
        .bind(&policy.organization_id)
        .bind(&cutoff)
        .execute(db)
        .await?
        .rows_affected();

    RetentionPolicy::record_run(db, &policy.id, &format_timestamp(now), deleted).await?;

    tracing::info!(
        policy_id = %policy.id,
        organization_id = %policy.organization_id,
        resource_type = %policy.resource_type,
        cutoff = %cutoff,
        deleted = deleted,
        "Retention policy executed"
    );

    Ok(RetentionRunResponse {
        policy_id: policy.id.clone(),
        resource_type: policy.resource_type.clone(),
        cutoff,
        deleted,
    })
}

/// Statistics from a maintenance cycle
#[derive(Debug, Default)]
pub struct SweepStats {
    pub policies_run: u64,
    pub records_deleted: u64,
    pub attestations_expired: u64,
    pub exports_expired: u64,
    pub sessions_purged: u64,
}

/// Applies retention policies and soft expiry
pub struct MaintenanceSweeper {
    db: DbPool,
    dispatcher: Arc<WebhookDispatcher>,
}

impl MaintenanceSweeper {
    pub fn new(db: DbPool, dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self { db, dispatcher }
    }

    /// Run a single maintenance cycle
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now_str = format_timestamp(now);

        for policy in RetentionPolicy::list_active(&self.db).await? {
            match execute_policy(&self.db, &policy, now).await {
                Ok(run) => {
                    stats.policies_run += 1;
                    stats.records_deleted += run.deleted;
                }
                Err(e) => {
                    tracing::warn!(
                        policy_id = %policy.id,
                        error = %e,
                        "Failed to execute retention policy"
                    );
                }
            }
        }

        let expired = Attestation::expire_due(&self.db, &now_str).await?;
        stats.attestations_expired = expired.len() as u64;
        for attestation in expired {
            self.dispatcher.emit(
                &attestation.organization_id,
                events::ATTESTATION_EXPIRED,
                json!({
                    "attestation_id": attestation.id,
                    "title": attestation.title,
                    "framework": attestation.framework,
                    "expires_at": attestation.expires_at,
                }),
            );
        }

        stats.exports_expired = DataExport::expire_due(&self.db, &now_str).await?;
        stats.sessions_purged = Session::purge_expired(&self.db).await?;

        tracing::info!(
            policies = stats.policies_run,
            deleted = stats.records_deleted,
            attestations_expired = stats.attestations_expired,
            exports_expired = stats.exports_expired,
            sessions_purged = stats.sessions_purged,
            "Maintenance cycle completed"
        );

        Ok(stats)
    }
}

/// Spawn the background maintenance task
pub fn spawn_maintenance_task(
    db: DbPool,
    dispatcher: Arc<WebhookDispatcher>,
    config: RetentionConfig,
) {
    if !config.enabled {
        tracing::info!("Maintenance sweeper is disabled");
        return;
    }

    let interval_secs = config.interval_secs.max(1);
    tracing::info!(interval_secs = interval_secs, "Starting maintenance sweeper");

    let sweeper = MaintenanceSweeper::new(db, dispatcher);

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = sweeper.run_cycle(Utc::now()).await {
                tracing::error!(error = %e, "Maintenance cycle failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::db::{init_memory, log_audit, AuditEntry, Organization, RetentionResource};
    use crate::utils::parse_timestamp;

    async fn insert_audit_at(db: &DbPool, org: &str, created_at: &str) {
        log_audit(
            db,
            &AuditEntry {
                organization_id: Some(org),
                action: "rule.create",
                resource_type: "rule",
                ..Default::default()
            },
        )
        .await
        .unwrap();
        sqlx::query(
            "UPDATE audit_logs SET created_at = ? WHERE id = (SELECT id FROM audit_logs ORDER BY rowid DESC LIMIT 1)",
        )
        .bind(created_at)
        .execute(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_execute_policy_respects_cutoff_and_org() {
        let db = init_memory().await.unwrap();
        let acme = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let globex = Organization::create(&db, "Globex", "globex", "free").await.unwrap();

        insert_audit_at(&db, &acme.id, "2024-01-01T00:00:00.000Z").await;
        insert_audit_at(&db, &acme.id, "2024-03-30T00:00:00.000Z").await;
        insert_audit_at(&db, &globex.id, "2024-01-01T00:00:00.000Z").await;

        let policy = RetentionPolicy::create(
            &db,
            &acme.id,
            "90 days",
            RetentionResource::AuditLogs,
            30,
            true,
        )
        .await
        .unwrap();

        let now = parse_timestamp("2024-04-01T00:00:00.000Z").unwrap();
        let run = execute_policy(&db, &policy, now).await.unwrap();
        assert_eq!(run.deleted, 1);
        assert_eq!(run.cutoff, "2024-03-02T00:00:00.000Z");

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(remaining, 2);

        let reloaded: RetentionPolicy =
            sqlx::query_as("SELECT * FROM retention_policies WHERE id = ?")
                .bind(&policy.id)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(reloaded.last_run_deleted, Some(1));
        assert_eq!(reloaded.last_run_at.as_deref(), Some("2024-04-01T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn test_cycle_runs_active_policies_only() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        insert_audit_at(&db, &org.id, "2020-01-01T00:00:00.000Z").await;
        RetentionPolicy::create(&db, &org.id, "off", RetentionResource::AuditLogs, 1, false)
            .await
            .unwrap();

        let dispatcher = Arc::new(WebhookDispatcher::new(db.clone(), WebhookConfig::default()));
        let sweeper = MaintenanceSweeper::new(db.clone(), dispatcher);
        let stats = sweeper.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(stats.policies_run, 0);
        assert_eq!(stats.records_deleted, 0);
    }
}
