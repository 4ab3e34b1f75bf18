//! Outgoing webhook subscriptions and their delivery log.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::db::query::find_scoped;

use super::common::{parse_string_list, serialize_string_list};

/// Events an organization can subscribe to
pub mod events {
    pub const ATTESTATION_ATTESTED: &str = "attestation.attested";
    pub const ATTESTATION_EXPIRED: &str = "attestation.expired";
    pub const AUDIT_COMPLETED: &str = "audit.completed";
    pub const EXPORT_COMPLETED: &str = "export.completed";
    pub const RELEASE_PUBLISHED: &str = "release.published";
    pub const THREAT_DETECTED: &str = "threat.detected";
    pub const THREAT_RESOLVED: &str = "threat.resolved";
    pub const HEALTH_SCORE_CRITICAL: &str = "health_score.critical";
    pub const PIPELINE_RUN_COMPLETED: &str = "pipeline.run.completed";
    pub const PIPELINE_RUN_FAILED: &str = "pipeline.run.failed";
    pub const WEBHOOK_TEST: &str = "webhook.test";

    /// Subscribes to every event
    pub const WILDCARD: &str = "*";

    pub const ALL: &[&str] = &[
        ATTESTATION_ATTESTED,
        ATTESTATION_EXPIRED,
        AUDIT_COMPLETED,
        EXPORT_COMPLETED,
        RELEASE_PUBLISHED,
        THREAT_DETECTED,
        THREAT_RESOLVED,
        HEALTH_SCORE_CRITICAL,
        PIPELINE_RUN_COMPLETED,
        PIPELINE_RUN_FAILED,
        WEBHOOK_TEST,
    ];

    pub fn is_known(event: &str) -> bool {
        event == WILDCARD || ALL.contains(&event)
    }
}

text_enum! {
    pub enum DeliveryStatus {
        Pending => "pending",
        Success => "success",
        Failed => "failed",
    }
}

/// Generate a webhook signing secret: `whsec_` followed by 64 hex chars
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    format!("whsec_{}", hex::encode(bytes))
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Webhook {
    pub id: String,
    pub organization_id: String,
    pub url: String,
    pub description: Option<String>,
    pub events: String,
    pub secret: String,
    pub is_active: bool,
    pub failure_count: i64,
    pub last_delivery_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Webhook as returned by the API. The secret is only included right after
/// creation or rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub id: String,
    pub organization_id: String,
    pub url: String,
    pub description: Option<String>,
    pub events: Vec<String>,
    pub is_active: bool,
    pub failure_count: i64,
    pub last_delivery_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Webhook> for WebhookResponse {
    fn from(w: Webhook) -> Self {
        Self {
            events: parse_string_list(&w.events),
            id: w.id,
            organization_id: w.organization_id,
            url: w.url,
            description: w.description,
            is_active: w.is_active,
            failure_count: w.failure_count,
            last_delivery_at: w.last_delivery_at,
            secret: None,
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

impl WebhookResponse {
    pub fn with_secret(webhook: Webhook) -> Self {
        let secret = webhook.secret.clone();
        Self {
            secret: Some(secret),
            ..Self::from(webhook)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub url: String,
    pub description: Option<String>,
    pub events: Vec<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWebhookRequest {
    pub url: Option<String>,
    pub description: Option<String>,
    pub events: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookFilter {
    pub is_active: Option<bool>,
    pub search: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveryFilter {
    pub status: Option<String>,
    pub event: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookDelivery {
    pub id: String,
    pub webhook_id: String,
    pub organization_id: String,
    pub event: String,
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub response_status: Option<i64>,
    pub error_message: Option<String>,
    pub delivered_at: Option<String>,
    pub created_at: String,
}

impl Webhook {
    pub fn event_list(&self) -> Vec<String> {
        parse_string_list(&self.events)
    }

    /// Whether this webhook should receive `event`
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.event_list()
            .iter()
            .any(|e| e == events::WILDCARD || e == event)
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        req: &CreateWebhookRequest,
    ) -> Result<Webhook, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO webhooks (id, organization_id, url, description, events, secret, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(req.url.trim())
        .bind(&req.description)
        .bind(serialize_string_list(&req.events))
        .bind(generate_secret())
        .bind(req.is_active.unwrap_or(true))
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "webhooks", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn update(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        req: &UpdateWebhookRequest,
    ) -> Result<Option<Webhook>, sqlx::Error> {
        // Re-enabling a webhook clears its failure streak
        let reset_failures = req.is_active == Some(true);

        let result = sqlx::query(
            r#"
            UPDATE webhooks
            SET url = COALESCE(?, url),
                description = COALESCE(?, description),
                events = COALESCE(?, events),
                is_active = COALESCE(?, is_active),
                failure_count = CASE WHEN ? THEN 0 ELSE failure_count END,
                updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(req.url.as_deref().map(str::trim))
        .bind(&req.description)
        .bind(req.events.as_deref().map(serialize_string_list))
        .bind(req.is_active)
        .bind(reset_failures)
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "webhooks", organization_id, id).await
    }

    pub async fn rotate_secret(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
    ) -> Result<Option<Webhook>, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE webhooks SET secret = ?, updated_at = ? WHERE id = ? AND organization_id = ?",
        )
        .bind(generate_secret())
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "webhooks", organization_id, id).await
    }

    /// Active webhooks of an organization subscribed to `event`
    pub async fn list_subscribed(
        db: &SqlitePool,
        organization_id: &str,
        event: &str,
    ) -> Result<Vec<Webhook>, sqlx::Error> {
        let hooks = sqlx::query_as::<_, Webhook>(
            "SELECT * FROM webhooks WHERE organization_id = ? AND is_active = 1 ORDER BY created_at",
        )
        .bind(organization_id)
        .fetch_all(db)
        .await?;

        Ok(hooks.into_iter().filter(|h| h.subscribes_to(event)).collect())
    }

    /// Reset the failure streak after a successful delivery
    pub async fn record_success(db: &SqlitePool, id: &str, at: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE webhooks SET failure_count = 0, last_delivery_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Bump the failure streak, disabling the webhook once it reaches
    /// `threshold`. Returns the new failure count and whether it was disabled.
    pub async fn record_failure(
        db: &SqlitePool,
        id: &str,
        at: &str,
        threshold: i64,
    ) -> Result<(i64, bool), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhooks
            SET failure_count = failure_count + 1,
                last_delivery_at = ?,
                is_active = CASE WHEN failure_count + 1 >= ? THEN 0 ELSE is_active END
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(threshold)
        .bind(id)
        .execute(db)
        .await?;

        let (count, active): (i64, bool) =
            sqlx::query_as("SELECT failure_count, is_active FROM webhooks WHERE id = ?")
                .bind(id)
                .fetch_one(db)
                .await?;
        Ok((count, !active))
    }
}

/// Outcome of a finished delivery, persisted in one write
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub response_status: Option<i64>,
    pub error_message: Option<String>,
}

impl WebhookDelivery {
    pub fn status_enum(&self) -> Option<DeliveryStatus> {
        self.status.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        id: &str,
        webhook: &Webhook,
        event: &str,
        payload: &str,
    ) -> Result<WebhookDelivery, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (id, webhook_id, organization_id, event, payload, status, attempts, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?)
            "#,
        )
        .bind(id)
        .bind(&webhook.id)
        .bind(&webhook.organization_id)
        .bind(event)
        .bind(payload)
        .bind(crate::utils::now())
        .execute(db)
        .await?;

        find_scoped(db, "webhook_deliveries", &webhook.organization_id, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn finish(
        db: &SqlitePool,
        id: &str,
        outcome: &DeliveryOutcome,
    ) -> Result<(), sqlx::Error> {
        let delivered_at =
            (outcome.status == DeliveryStatus::Success).then(crate::utils::now);

        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = ?, attempts = ?, response_status = ?, error_message = ?, delivered_at = ?
            WHERE id = ?
            "#,
        )
        .bind(outcome.status.to_string())
        .bind(outcome.attempts)
        .bind(outcome.response_status)
        .bind(&outcome.error_message)
        .bind(&delivered_at)
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    #[test]
    fn test_generate_secret_format() {
        let secret = generate_secret();
        assert!(secret.starts_with("whsec_"));
        assert_eq!(secret.len(), "whsec_".len() + 64);
        assert!(secret["whsec_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_known_events() {
        assert!(events::is_known("*"));
        assert!(events::is_known("release.published"));
        assert!(!events::is_known("release.deleted"));
    }

    async fn setup() -> (SqlitePool, Organization) {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        (db, org)
    }

    #[tokio::test]
    async fn test_subscription_matching() {
        let (db, org) = setup().await;
        Webhook::create(
            &db,
            &org.id,
            &CreateWebhookRequest {
                url: "https://hooks.example.com/a".to_string(),
                description: None,
                events: vec!["release.published".to_string()],
                is_active: None,
            },
        )
        .await
        .unwrap();
        Webhook::create(
            &db,
            &org.id,
            &CreateWebhookRequest {
                url: "https://hooks.example.com/b".to_string(),
                description: None,
                events: vec!["*".to_string()],
                is_active: None,
            },
        )
        .await
        .unwrap();

        let release = Webhook::list_subscribed(&db, &org.id, "release.published")
            .await
            .unwrap();
        assert_eq!(release.len(), 2);

        let threat = Webhook::list_subscribed(&db, &org.id, "threat.detected")
            .await
            .unwrap();
        assert_eq!(threat.len(), 1);
        assert!(threat[0].url.ends_with("/b"));
    }

    #[tokio::test]
    async fn test_failure_threshold_disables() {
        let (db, org) = setup().await;
        let hook = Webhook::create(
            &db,
            &org.id,
            &CreateWebhookRequest {
                url: "https://hooks.example.com".to_string(),
                description: None,
                events: vec!["*".to_string()],
                is_active: None,
            },
        )
        .await
        .unwrap();

        let now = crate::utils::now();
        assert_eq!(
            Webhook::record_failure(&db, &hook.id, &now, 2).await.unwrap(),
            (1, false)
        );
        assert_eq!(
            Webhook::record_failure(&db, &hook.id, &now, 2).await.unwrap(),
            (2, true)
        );

        let reenabled = Webhook::update(
            &db,
            &org.id,
            &hook.id,
            &UpdateWebhookRequest {
                url: None,
                description: None,
                events: None,
                is_active: Some(true),
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert!(reenabled.is_active);
        assert_eq!(reenabled.failure_count, 0);
    }

    #[tokio::test]
    async fn test_rotate_secret_changes_secret() {
        let (db, org) = setup().await;
        let hook = Webhook::create(
            &db,
            &org.id,
            &CreateWebhookRequest {
                url: "https://hooks.example.com".to_string(),
                description: None,
                events: vec!["*".to_string()],
                is_active: Some(false),
            },
        )
        .await
        .unwrap();
        assert!(!hook.is_active);

        let rotated = Webhook::rotate_secret(&db, &org.id, &hook.id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(rotated.secret, hook.secret);
        assert!(WebhookResponse::from(rotated.clone()).secret.is_none());
        assert_eq!(
            WebhookResponse::with_secret(rotated.clone()).secret,
            Some(rotated.secret)
        );
    }
}
