mod attestations;
pub mod audit;
pub mod auth;
mod compliance_audits;
mod data_exports;
mod email_templates;
pub mod error;
mod feature_flags;
mod gwi;
mod health_scores;
pub mod metrics;
mod organizations;
mod pipelines;
pub mod rate_limit;
mod releases;
mod retention_policies;
mod rules;
mod threats;
pub mod validation;
mod webhooks;


use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Login/logout share the stricter auth tier
    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_auth,
        ))
        .route("/me", get(auth::me));

    // GWI portal, platform admins only
    let gwi_routes = Router::new()
        .route("/organizations", get(gwi::list_organizations))
        .route("/organizations", post(gwi::create_organization))
        .route("/organizations/:id", get(gwi::get_organization))
        .route("/organizations/:id", put(gwi::update_organization))
        .route("/organizations/:id/users", post(gwi::create_organization_user))
        .route("/health-scores", get(gwi::list_health_scores))
        .route("/overview", get(gwi::overview));

    let api_routes = Router::new()
        // Tenancy
        .route("/organization", get(organizations::get_organization))
        .route("/users", get(organizations::list_users))
        .route("/users", post(organizations::create_user))
        // Audit log
        .route("/audit-logs", get(audit::list_logs))
        .route("/audit-logs/actions", get(audit::list_action_types))
        .route("/audit-logs/resource-types", get(audit::list_resource_types))
        // Attestations
        .route("/attestations", get(attestations::list_attestations))
        .route("/attestations", post(attestations::create_attestation))
        .route("/attestations/:id", get(attestations::get_attestation))
        .route("/attestations/:id", put(attestations::update_attestation))
        .route("/attestations/:id", delete(attestations::delete_attestation))
        .route("/attestations/:id/attest", post(attestations::attest))
        .route("/attestations/:id/reject", post(attestations::reject))
        // Compliance audits
        .route("/compliance-audits", get(compliance_audits::list_audits))
        .route("/compliance-audits", post(compliance_audits::create_audit))
        .route("/compliance-audits/:id", get(compliance_audits::get_audit))
        .route("/compliance-audits/:id", put(compliance_audits::update_audit))
        .route("/compliance-audits/:id", delete(compliance_audits::delete_audit))
        // Data exports
        .route("/data-exports", get(data_exports::list_exports))
        .route("/data-exports", post(data_exports::create_export))
        .route("/data-exports/:id", get(data_exports::get_export))
        .route("/data-exports/:id/status", put(data_exports::update_export_status))
        .route("/data-exports/:id/download", get(data_exports::download_export))
        // Retention policies
        .route("/retention-policies", get(retention_policies::list_policies))
        .route("/retention-policies", post(retention_policies::create_policy))
        .route("/retention-policies/:id", get(retention_policies::get_policy))
        .route("/retention-policies/:id", put(retention_policies::update_policy))
        .route("/retention-policies/:id", delete(retention_policies::delete_policy))
        .route("/retention-policies/:id/execute", post(retention_policies::execute))
        // Email templates
        .route("/email-templates", get(email_templates::list_templates))
        .route("/email-templates", post(email_templates::create_template))
        .route("/email-templates/:id", get(email_templates::get_template))
        .route("/email-templates/:id", put(email_templates::update_template))
        .route("/email-templates/:id", delete(email_templates::delete_template))
        .route("/email-templates/:id/preview", post(email_templates::preview_template))
        // Feature flags (evaluate takes the flag key in the :id slot)
        .route("/feature-flags", get(feature_flags::list_flags))
        .route("/feature-flags", post(feature_flags::create_flag))
        .route("/feature-flags/:id", get(feature_flags::get_flag))
        .route("/feature-flags/:id", put(feature_flags::update_flag))
        .route("/feature-flags/:id", delete(feature_flags::delete_flag))
        .route("/feature-flags/:id/evaluate", get(feature_flags::evaluate_flag))
        // Outbound webhooks
        .route("/webhooks", get(webhooks::list_webhooks))
        .route("/webhooks", post(webhooks::create_webhook))
        .route("/webhooks/:id", get(webhooks::get_webhook))
        .route("/webhooks/:id", put(webhooks::update_webhook))
        .route("/webhooks/:id", delete(webhooks::delete_webhook))
        .route("/webhooks/:id/rotate-secret", post(webhooks::rotate_secret))
        .route("/webhooks/:id/test", post(webhooks::test_webhook))
        .route("/webhooks/:id/deliveries", get(webhooks::list_deliveries))
        // Releases
        .route("/releases", get(releases::list_releases))
        .route("/releases", post(releases::create_release))
        .route("/releases/:id", get(releases::get_release))
        .route("/releases/:id", put(releases::update_release))
        .route("/releases/:id", delete(releases::delete_release))
        .route("/releases/:id/publish", post(releases::publish_release))
        .route("/releases/:id/archive", post(releases::archive_release))
        // Rules
        .route("/rules", get(rules::list_rules))
        .route("/rules", post(rules::create_rule))
        .route("/rules/:id", get(rules::get_rule))
        .route("/rules/:id", put(rules::update_rule))
        .route("/rules/:id", delete(rules::delete_rule))
        .route("/rules/:id/toggle", post(rules::toggle_rule))
        .route("/rules/:id/evaluate", post(rules::evaluate_rule))
        // Security threats
        .route("/threats", get(threats::list_threats))
        .route("/threats", post(threats::create_threat))
        .route("/threats/summary", get(threats::threat_summary))
        .route("/threats/:id", get(threats::get_threat))
        .route("/threats/:id", put(threats::update_threat))
        .route("/threats/:id", delete(threats::delete_threat))
        .route("/threats/:id/resolve", post(threats::resolve_threat))
        // Customer health
        .route("/health-scores", get(health_scores::list_health_scores))
        .route("/health-scores", post(health_scores::calculate_health_score))
        .route("/health-scores/latest", get(health_scores::latest_health_score))
        // Pipelines
        .route("/pipelines", get(pipelines::list_pipelines))
        .route("/pipelines", post(pipelines::create_pipeline))
        .route("/pipelines/:id", get(pipelines::get_pipeline))
        .route("/pipelines/:id", put(pipelines::update_pipeline))
        .route("/pipelines/:id", delete(pipelines::delete_pipeline))
        .route("/pipelines/:id/pause", post(pipelines::pause_pipeline))
        .route("/pipelines/:id/resume", post(pipelines::resume_pipeline))
        .route("/pipelines/:id/runs", post(pipelines::trigger_run))
        .route("/pipelines/:id/runs", get(pipelines::list_runs))
        .route("/pipelines/runs/:run_id", get(pipelines::get_run))
        .route("/pipelines/runs/:run_id/status", put(pipelines::update_run_status))
        // Platform portal
        .nest("/gwi", gwi_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_api,
        ));

    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api/auth", auth_routes)
        .nest("/api", api_routes)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static(auth::ORGANIZATION_HEADER),
        ])
}

async fn health_check() -> &'static str {
    "OK"
}
