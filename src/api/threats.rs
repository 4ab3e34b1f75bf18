//! Security threat endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, events, resource_types, CreateThreatRequest, NewThreat, OrgRole, ResolveThreatRequest,
    SecurityThreat, Severity, ThreatFilter, ThreatStatus, ThreatSummary, ThreatType,
    UpdateThreatRequest,
};
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{
    Json, Query, choice_field, timestamp_field, validate_required, MAX_NAME_LENGTH,
};

const TABLE: &str = "security_threats";

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<SecurityThreat, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Security threat not found"))
}

fn emit_resolved(state: &AppState, threat: &SecurityThreat) {
    state.dispatcher.emit(
        &threat.organization_id,
        events::THREAT_RESOLVED,
        json!({
            "threat_id": threat.id,
            "title": threat.title,
            "severity": threat.severity,
            "status": threat.status,
            "resolution": threat.resolution,
            "resolved_at": threat.resolved_at,
        }),
    );
}

/// GET /api/threats
pub async fn list_threats(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<ThreatFilter>,
) -> Result<Json<Paginated<SecurityThreat>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("severity", filter.severity.as_deref())
        .eq("status", filter.status.as_deref())
        .eq("threat_type", filter.threat_type.as_deref())
        .search(&["title", "description", "source_ip"], filter.search.as_deref());
    let threats = paginate(&state.db, TABLE, &where_, "detected_at DESC", &page).await?;
    Ok(Json(threats))
}

/// GET /api/threats/summary
pub async fn threat_summary(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
) -> Result<Json<ThreatSummary>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    let summary = SecurityThreat::summary(&state.db, Some(&ctx.organization_id)).await?;
    Ok(Json(summary))
}

/// GET /api/threats/:id
pub async fn get_threat(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<SecurityThreat>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?))
}

/// POST /api/threats
pub async fn create_threat(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateThreatRequest>,
) -> Result<(StatusCode, Json<SecurityThreat>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_required(&req.title, "Title", MAX_NAME_LENGTH) {
        errors.add("title", e);
    }
    let threat_type: Option<ThreatType> =
        choice_field(&mut errors, "threat_type", Some(&req.threat_type));
    let severity: Option<Severity> = choice_field(&mut errors, "severity", Some(&req.severity));
    let source_ip = req.source_ip.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if let Some(ip) = source_ip {
        if ip.parse::<IpAddr>().is_err() {
            errors.add("source_ip", "Source IP must be an IPv4 or IPv6 address");
        }
    }
    let detected_at = timestamp_field(&mut errors, "detected_at", req.detected_at.as_deref());
    errors.finish()?;
    let (threat_type, severity) = match (threat_type, severity) {
        (Some(t), Some(s)) => (t, s),
        _ => return Err(ApiError::bad_request("Threat type and severity are required")),
    };

    let detected_at = detected_at.unwrap_or_else(crate::utils::now);
    let threat = SecurityThreat::create(
        &state.db,
        &ctx.organization_id,
        &NewThreat {
            title: req.title.trim(),
            description: req.description.as_deref(),
            threat_type,
            severity,
            source_ip,
            detected_at: &detected_at,
        },
    )
    .await?;

    audit_log(
        &state,
        &ctx,
        actions::THREAT_REPORT,
        resource_types::SECURITY_THREAT,
        Some(&threat.id),
        Some(&threat.title),
        Some(json!({ "severity": threat.severity, "threat_type": threat.threat_type })),
    )
    .await;
    tracing::warn!(
        organization_id = %ctx.organization_id,
        threat_id = %threat.id,
        severity = %threat.severity,
        threat_type = %threat.threat_type,
        "Security threat reported"
    );

    state.dispatcher.emit(
        &ctx.organization_id,
        events::THREAT_DETECTED,
        json!({
            "threat_id": threat.id,
            "title": threat.title,
            "threat_type": threat.threat_type,
            "severity": threat.severity,
            "source_ip": threat.source_ip,
            "detected_at": threat.detected_at,
        }),
    );

    Ok((StatusCode::CREATED, Json(threat)))
}

/// PUT /api/threats/:id
pub async fn update_threat(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateThreatRequest>,
) -> Result<Json<SecurityThreat>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(title) = &req.title {
        if let Err(e) = validate_required(title, "Title", MAX_NAME_LENGTH) {
            errors.add("title", e);
        }
    }
    let severity: Option<Severity> = choice_field(&mut errors, "severity", req.severity.as_deref());
    let status: Option<ThreatStatus> = choice_field(&mut errors, "status", req.status.as_deref());
    errors.finish()?;

    let current = load(&state, &ctx, &id).await?;
    let was_closed = current.status_enum().is_some_and(|s| s.is_closed());
    if was_closed && status.is_some_and(|s| s.is_closed()) {
        return Err(ApiError::conflict("Threat is already closed"));
    }

    let threat = SecurityThreat::update(
        &state.db,
        &ctx.organization_id,
        &id,
        req.title.as_deref().map(str::trim),
        req.description.as_deref(),
        severity,
        status,
    )
    .await?
    .ok_or_else(|| ApiError::not_found("Security threat not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::THREAT_UPDATE,
        resource_types::SECURITY_THREAT,
        Some(&threat.id),
        Some(&threat.title),
        status.map(|s| json!({ "status": s })),
    )
    .await;

    if !was_closed && status.is_some_and(|s| s.is_closed()) {
        emit_resolved(&state, &threat);
    }

    Ok(Json(threat))
}

/// POST /api/threats/:id/resolve
pub async fn resolve_threat(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<ResolveThreatRequest>,
) -> Result<Json<SecurityThreat>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let current = load(&state, &ctx, &id).await?;
    if current.status_enum().is_some_and(|s| s.is_closed()) {
        return Err(ApiError::conflict(format!(
            "Threat is already closed (status: {})",
            current.status
        )));
    }

    let status = if req.false_positive {
        ThreatStatus::FalsePositive
    } else {
        ThreatStatus::Resolved
    };
    let threat = SecurityThreat::resolve(
        &state.db,
        &ctx.organization_id,
        &id,
        status,
        req.resolution.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::not_found("Security threat not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::THREAT_RESOLVE,
        resource_types::SECURITY_THREAT,
        Some(&threat.id),
        Some(&threat.title),
        Some(json!({ "status": status })),
    )
    .await;

    emit_resolved(&state, &threat);

    Ok(Json(threat))
}

/// DELETE /api/threats/:id
pub async fn delete_threat(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let threat = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::THREAT_DELETE,
        resource_types::SECURITY_THREAT,
        Some(&threat.id),
        Some(&threat.title),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}
