//! Audit log API endpoints and helpers.

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, State},
    http::request::Parts,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::db::query::{PageQuery, Paginated};
use crate::db::{
    distinct_audit_values, list_audit_logs, log_audit, AuditColumn, AuditEntry, AuditLog,
    AuditLogQuery, OrgRole,
};
use crate::AppState;

use super::auth::OrgContext;
use super::error::ApiError;
use super::rate_limit::client_ip;
use super::validation::{Json, Query};

/// Client IP address, resolved from proxy headers or the socket
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        Ok(ClientIp(client_ip(&parts.headers, peer).to_string()))
    }
}

/// Record an audit event for the caller's organization.
///
/// Failures are logged and never fail the request.
pub async fn audit_log(
    state: &AppState,
    ctx: &OrgContext,
    action: &str,
    resource_type: &str,
    resource_id: Option<&str>,
    resource_name: Option<&str>,
    details: Option<serde_json::Value>,
) {
    record(
        state,
        &AuditEntry {
            organization_id: Some(&ctx.organization_id),
            action,
            resource_type,
            resource_id,
            resource_name,
            user_id: Some(ctx.user_id()),
            ip_address: Some(&ctx.ip_address),
            details,
        },
    )
    .await;
}

/// Record a prepared audit entry, logging instead of failing
pub async fn record(state: &AppState, entry: &AuditEntry<'_>) {
    if let Err(e) = log_audit(&state.db, entry).await {
        tracing::warn!(
            action = entry.action,
            resource_type = entry.resource_type,
            error = %e,
            "Failed to create audit log entry"
        );
    }
}

/// List audit logs with filtering and pagination
///
/// Query parameters:
/// - action: Filter by action (e.g., "release.publish")
/// - resource_type: Filter by resource type (e.g., "webhook")
/// - resource_id: Filter by specific resource ID
/// - user_id: Filter by user ID
/// - start_date / end_date: RFC 3339 bounds on `created_at`
/// - page, limit: pagination
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<Paginated<AuditLog>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    let result = list_audit_logs(&state.db, &ctx.organization_id, &query, &page).await?;
    Ok(Json(result))
}

/// Distinct actions for filtering UIs
pub async fn list_action_types(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
) -> Result<Json<Vec<String>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    let actions =
        distinct_audit_values(&state.db, &ctx.organization_id, AuditColumn::Action).await?;
    Ok(Json(actions))
}

/// Distinct resource types for filtering UIs
pub async fn list_resource_types(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
) -> Result<Json<Vec<String>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    let types =
        distinct_audit_values(&state.db, &ctx.organization_id, AuditColumn::ResourceType).await?;
    Ok(Json(types))
}
