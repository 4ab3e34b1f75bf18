//! Prometheus metrics endpoint and HTTP request tracking middleware.
//!
//! This module provides:
//! - A `/metrics` endpoint that returns Prometheus-formatted metrics
//! - Middleware for tracking HTTP request counts and durations
//! - Helpers for webhook delivery and pipeline run counters

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::db::{RunStatus, TriggerType};
use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const WEBHOOK_DELIVERIES_TOTAL: &str = "webhook_deliveries_total";
pub const PIPELINE_RUNS_QUEUED_TOTAL: &str = "pipeline_runs_queued_total";
pub const PIPELINE_RUNS_FINISHED_TOTAL: &str = "pipeline_runs_finished_total";
pub const ORGANIZATIONS_TOTAL: &str = "organizations_total";
pub const OPEN_THREATS: &str = "security_threats_open";
pub const ACTIVE_WEBHOOKS: &str = "webhooks_active";

/// Install the Prometheus recorder and return a handle for rendering.
///
/// Call once during startup.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "Total number of HTTP requests received"
    );
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        WEBHOOK_DELIVERIES_TOTAL,
        "Webhook deliveries by event and outcome"
    );
    describe_counter!(
        PIPELINE_RUNS_QUEUED_TOTAL,
        "Pipeline runs queued by trigger (manual/schedule)"
    );
    describe_counter!(
        PIPELINE_RUNS_FINISHED_TOTAL,
        "Pipeline runs reaching a terminal status"
    );
    describe_gauge!(ORGANIZATIONS_TOTAL, "Organizations by status");
    describe_gauge!(OPEN_THREATS, "Unresolved security threats by severity");
    describe_gauge!(ACTIVE_WEBHOOKS, "Active webhook endpoints");

    Ok(handle)
}

/// GET /metrics - Prometheus text format, no authentication.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_gauge_metrics(&state).await;

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

async fn update_gauge_metrics(state: &AppState) {
    if let Ok(rows) = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM organizations GROUP BY status",
    )
    .fetch_all(&state.db)
    .await
    {
        for (status, count) in rows {
            gauge!(ORGANIZATIONS_TOTAL, "status" => status).set(count as f64);
        }
    }

    if let Ok(rows) = sqlx::query_as::<_, (String, i64)>(
        "SELECT severity, COUNT(*) FROM security_threats \
         WHERE status NOT IN ('resolved', 'false_positive') GROUP BY severity",
    )
    .fetch_all(&state.db)
    .await
    {
        for (severity, count) in rows {
            gauge!(OPEN_THREATS, "severity" => severity).set(count as f64);
        }
    }

    if let Ok(count) =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM webhooks WHERE is_active = 1")
            .fetch_one(&state.db)
            .await
    {
        gauge!(ACTIVE_WEBHOOKS).set(count as f64);
    }
}

/// Middleware to track HTTP request metrics.
///
/// Records:
/// - `http_requests_total` counter with method, path, and status labels
/// - `http_request_duration_seconds` histogram with method and path labels
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Matched path keeps label cardinality bounded (/api/rules/:id)
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

pub fn record_webhook_delivery(event: &str, success: bool) {
    let outcome = if success { "success" } else { "failed" };
    counter!(WEBHOOK_DELIVERIES_TOTAL, "event" => event.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_pipeline_run_queued(trigger: TriggerType) {
    counter!(PIPELINE_RUNS_QUEUED_TOTAL, "trigger" => trigger.to_string()).increment(1);
}

pub fn record_pipeline_run_finished(status: RunStatus) {
    counter!(PIPELINE_RUNS_FINISHED_TOTAL, "status" => status.to_string()).increment(1);
}
