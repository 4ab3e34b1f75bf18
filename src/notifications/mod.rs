//! Outbound webhook notifications.
//!
//! Domain events (attestation attested, release published, threat detected, ...)
//! are fanned out to every active webhook of the organization subscribed to the
//! event. Each delivery is a signed JSON POST, retried with exponential backoff
//! and recorded as a single `webhook_deliveries` row.

use futures::future::join_all;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::api::metrics::record_webhook_delivery;
use crate::config::WebhookConfig;
use crate::db::{DeliveryOutcome, DeliveryStatus, Webhook, WebhookDelivery};
use crate::DbPool;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Body POSTed to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope<'a> {
    pub id: &'a str,
    pub event: &'a str,
    pub organization_id: &'a str,
    pub created_at: &'a str,
    pub data: &'a Value,
}

/// Why a single delivery attempt failed
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("endpoint responded with HTTP {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Transport(String),
}

impl DeliveryError {
    fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Transport(e.to_string())
        }
    }
}

fn keyed_mac(secret: &str, timestamp: i64, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Some(mac)
}

/// `sha256=<hex>` HMAC-SHA256 over `"{timestamp}.{body}"`
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let digest = keyed_mac(secret, timestamp, body)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default();
    format!("sha256={}", digest)
}

/// Verify a signature header produced by [`sign_payload`]
pub fn verify_signature(secret: &str, timestamp: i64, body: &[u8], header: &str) -> bool {
    let signature = match header.strip_prefix("sha256=") {
        Some(sig) => sig,
        None => return false,
    };

    let expected = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    match keyed_mac(secret, timestamp, body) {
        // Constant-time comparison
        Some(mac) => mac.verify_slice(&expected).is_ok(),
        None => false,
    }
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// Sends signed webhook deliveries
pub struct WebhookDispatcher {
    db: DbPool,
    http_client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(db: DbPool, config: WebhookConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("tenantdesk-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            db,
            http_client,
            config,
        }
    }

    /// Fire-and-forget: dispatch `event` on a background task
    pub fn emit(self: &Arc<Self>, organization_id: &str, event: &'static str, data: Value) {
        let dispatcher = Arc::clone(self);
        let organization_id = organization_id.to_string();
        tokio::spawn(async move {
            dispatcher.dispatch(&organization_id, event, &data).await;
        });
    }

    /// Deliver `event` to every subscribed webhook of the organization
    pub async fn dispatch(
        &self,
        organization_id: &str,
        event: &str,
        data: &Value,
    ) -> Vec<WebhookDelivery> {
        let webhooks = match Webhook::list_subscribed(&self.db, organization_id, event).await {
            Ok(hooks) => hooks,
            Err(e) => {
                tracing::error!(
                    organization_id = %organization_id,
                    event = %event,
                    error = %e,
                    "Failed to load webhook subscriptions"
                );
                return Vec::new();
            }
        };

        if webhooks.is_empty() {
            tracing::debug!(
                organization_id = %organization_id,
                event = %event,
                "No webhooks subscribed to event"
            );
            return Vec::new();
        }

        let results = join_all(webhooks.iter().map(|hook| self.deliver(hook, event, data))).await;

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(delivery) => Some(delivery),
                Err(e) => {
                    tracing::error!(event = %event, error = %e, "Failed to record webhook delivery");
                    None
                }
            })
            .collect()
    }

    /// Deliver one event to one webhook, retrying on failure
    pub async fn deliver(
        &self,
        webhook: &Webhook,
        event: &str,
        data: &Value,
    ) -> Result<WebhookDelivery, sqlx::Error> {
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let created_at = crate::utils::now();
        let envelope = EventEnvelope {
            id: &delivery_id,
            event,
            organization_id: &webhook.organization_id,
            created_at: &created_at,
            data,
        };
        let body = serde_json::to_vec(&envelope).unwrap_or_default();
        let payload = String::from_utf8_lossy(&body).into_owned();

        WebhookDelivery::create(&self.db, &delivery_id, webhook, event, &payload).await?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error: Option<DeliveryError> = None;
        let mut response_status = None;

        while attempts < max_attempts {
            if attempts > 0 {
                tokio::time::sleep(backoff_delay(self.config.backoff_base_ms, attempts)).await;
            }
            attempts += 1;

            match self.send(webhook, event, &delivery_id, &body).await {
                Ok(status) => {
                    response_status = Some(status as i64);
                    last_error = None;
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        webhook_id = %webhook.id,
                        attempt = attempts,
                        error = %e,
                        "Webhook delivery attempt failed"
                    );
                    response_status = e.status_code().map(i64::from);
                    last_error = Some(e);
                }
            }
        }

        let success = last_error.is_none();
        let outcome = DeliveryOutcome {
            status: if success {
                DeliveryStatus::Success
            } else {
                DeliveryStatus::Failed
            },
            attempts: attempts as i64,
            response_status,
            error_message: last_error.as_ref().map(|e| e.to_string()),
        };
        WebhookDelivery::finish(&self.db, &delivery_id, &outcome).await?;
        record_webhook_delivery(event, success);

        let now = crate::utils::now();
        if success {
            Webhook::record_success(&self.db, &webhook.id, &now).await?;
            tracing::info!(
                webhook_id = %webhook.id,
                event = %event,
                attempts = attempts,
                "Webhook delivered"
            );
        } else {
            let (failures, disabled) = Webhook::record_failure(
                &self.db,
                &webhook.id,
                &now,
                self.config.failure_threshold,
            )
            .await?;
            tracing::warn!(
                webhook_id = %webhook.id,
                event = %event,
                attempts = attempts,
                failures = failures,
                error = ?outcome.error_message,
                "Webhook delivery failed"
            );
            if disabled {
                tracing::warn!(
                    webhook_id = %webhook.id,
                    failures = failures,
                    "Webhook disabled after repeated failures"
                );
            }
        }

        sqlx::query_as::<_, WebhookDelivery>("SELECT * FROM webhook_deliveries WHERE id = ?")
            .bind(&delivery_id)
            .fetch_one(&self.db)
            .await
    }

    async fn send(
        &self,
        webhook: &Webhook,
        event: &str,
        delivery_id: &str,
        body: &[u8],
    ) -> Result<u16, DeliveryError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = sign_payload(&webhook.secret, timestamp, body);

        let response = self
            .http_client
            .post(&webhook.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, event)
            .header(DELIVERY_HEADER, delivery_id)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, CreateWebhookRequest, Organization};
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Router};
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_signature_roundtrip_and_format() {
        let sig = sign_payload("whsec_test", 1_700_000_000, b"{\"a\":1}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify_signature("whsec_test", 1_700_000_000, b"{\"a\":1}", &sig));
        assert!(!verify_signature("whsec_other", 1_700_000_000, b"{\"a\":1}", &sig));
        assert!(!verify_signature("whsec_test", 1_700_000_001, b"{\"a\":1}", &sig));
        assert!(!verify_signature("whsec_test", 1_700_000_000, b"{\"a\":1}", "md5=abc"));
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(500, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(500, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(500, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(0, 5), Duration::from_millis(0));
    }

    #[derive(Default)]
    struct Received {
        requests: Mutex<Vec<(HeaderMap, Vec<u8>)>>,
    }

    /// Local receiver answering every POST with `status`
    async fn spawn_receiver(status: StatusCode) -> (String, Arc<Received>) {
        let received = Arc::new(Received::default());
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(r): State<Arc<Received>>, headers: HeaderMap, body: axum::body::Bytes| async move {
                        r.requests.lock().unwrap().push((headers, body.to_vec()));
                        status
                    },
                ),
            )
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/hook", addr), received)
    }

    fn test_config(max_attempts: u32, failure_threshold: i64) -> WebhookConfig {
        WebhookConfig {
            max_attempts,
            backoff_base_ms: 1,
            timeout_secs: 5,
            failure_threshold,
        }
    }

    async fn webhook(db: &DbPool, url: &str, events: &[&str]) -> Webhook {
        let org = Organization::create(db, "Acme", "acme", "free").await.unwrap();
        Webhook::create(
            db,
            &org.id,
            &CreateWebhookRequest {
                url: url.to_string(),
                description: None,
                events: events.iter().map(|e| e.to_string()).collect(),
                is_active: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_successful_delivery_is_signed() {
        let (url, received) = spawn_receiver(StatusCode::OK).await;
        let db = init_memory().await.unwrap();
        let hook = webhook(&db, &url, &["release.published"]).await;
        let dispatcher = WebhookDispatcher::new(db.clone(), test_config(3, 10));

        let deliveries = dispatcher
            .dispatch(&hook.organization_id, "release.published", &json!({"version": "1.0.0"}))
            .await;
        assert_eq!(deliveries.len(), 1);
        let delivery = &deliveries[0];
        assert_eq!(delivery.status_enum(), Some(DeliveryStatus::Success));
        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.response_status, Some(200));
        assert!(delivery.delivered_at.is_some());

        let requests = received.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(headers[EVENT_HEADER], "release.published");
        assert_eq!(headers[DELIVERY_HEADER], delivery.id.as_str());
        let timestamp: i64 = headers[TIMESTAMP_HEADER].to_str().unwrap().parse().unwrap();
        let signature = headers[SIGNATURE_HEADER].to_str().unwrap();
        assert!(verify_signature(&hook.secret, timestamp, body, signature));

        let envelope: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(envelope["event"], "release.published");
        assert_eq!(envelope["data"]["version"], "1.0.0");
        assert_eq!(envelope["organization_id"], hook.organization_id.as_str());
    }

    #[tokio::test]
    async fn test_failed_delivery_retries_and_disables() {
        let (url, received) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
        let db = init_memory().await.unwrap();
        let hook = webhook(&db, &url, &["*"]).await;
        let dispatcher = WebhookDispatcher::new(db.clone(), test_config(3, 1));

        let delivery = dispatcher
            .deliver(&hook, "threat.detected", &json!({}))
            .await
            .unwrap();
        assert_eq!(delivery.status, "failed");
        assert_eq!(delivery.attempts, 3);
        assert_eq!(delivery.response_status, Some(500));
        assert!(delivery.error_message.unwrap().contains("500"));
        assert_eq!(received.requests.lock().unwrap().len(), 3);

        let reloaded: Webhook = sqlx::query_as("SELECT * FROM webhooks WHERE id = ?")
            .bind(&hook.id)
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(reloaded.failure_count, 1);
        assert!(!reloaded.is_active);

        // Disabled webhooks no longer receive events
        assert!(dispatcher
            .dispatch(&hook.organization_id, "threat.detected", &json!({}))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribed_event_is_skipped() {
        let (url, received) = spawn_receiver(StatusCode::OK).await;
        let db = init_memory().await.unwrap();
        let hook = webhook(&db, &url, &["release.published"]).await;
        let dispatcher = WebhookDispatcher::new(db, test_config(1, 10));

        let deliveries = dispatcher
            .dispatch(&hook.organization_id, "threat.detected", &json!({}))
            .await;
        assert!(deliveries.is_empty());
        assert!(received.requests.lock().unwrap().is_empty());
    }
}
