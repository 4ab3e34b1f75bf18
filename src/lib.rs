pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod notifications;
pub mod utils;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::api::rate_limit::RateLimiter;
use crate::notifications::WebhookDispatcher;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub rate_limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let dispatcher = Arc::new(WebhookDispatcher::new(db.clone(), config.webhooks.clone()));
        Self {
            config,
            db,
            rate_limiter,
            dispatcher,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
