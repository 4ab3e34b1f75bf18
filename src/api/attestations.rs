//! Compliance attestation endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, events, resource_types, AttestRequest, Attestation, AttestationFilter,
    AttestationStatus, CreateAttestationRequest, Framework, OrgRole, RejectRequest,
    UpdateAttestationRequest, DEFAULT_VALIDITY_DAYS,
};
use crate::utils::format_timestamp;
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{
    Json, Query, choice_field, timestamp_field, validate_required, MAX_NAME_LENGTH,
};

const TABLE: &str = "attestations";

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<Attestation, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Attestation not found"))
}

/// GET /api/attestations
pub async fn list_attestations(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<AttestationFilter>,
) -> Result<Json<Paginated<Attestation>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("status", filter.status.as_deref())
        .eq("framework", filter.framework.as_deref())
        .search(&["title", "description"], filter.search.as_deref());
    let page = paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(page))
}

/// GET /api/attestations/:id
pub async fn get_attestation(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<Attestation>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?))
}

/// POST /api/attestations
pub async fn create_attestation(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateAttestationRequest>,
) -> Result<(StatusCode, Json<Attestation>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_required(&req.title, "Title", MAX_NAME_LENGTH) {
        errors.add("title", e);
    }
    choice_field::<Framework>(&mut errors, "framework", Some(&req.framework));
    let expires_at = timestamp_field(&mut errors, "expires_at", req.expires_at.as_deref());
    errors.finish()?;

    let attestation =
        Attestation::create(&state.db, &ctx.organization_id, &req, expires_at.as_deref()).await?;

    audit_log(
        &state,
        &ctx,
        actions::ATTESTATION_CREATE,
        resource_types::ATTESTATION,
        Some(&attestation.id),
        Some(&attestation.title),
        Some(json!({ "framework": attestation.framework })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(attestation)))
}

/// PUT /api/attestations/:id
pub async fn update_attestation(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateAttestationRequest>,
) -> Result<Json<Attestation>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(title) = &req.title {
        if let Err(e) = validate_required(title, "Title", MAX_NAME_LENGTH) {
            errors.add("title", e);
        }
    }
    choice_field::<Framework>(&mut errors, "framework", req.framework.as_deref());
    let expires_at = timestamp_field(&mut errors, "expires_at", req.expires_at.as_deref());
    errors.finish()?;

    let attestation = Attestation::update(
        &state.db,
        &ctx.organization_id,
        &id,
        &req,
        expires_at.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::not_found("Attestation not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::ATTESTATION_UPDATE,
        resource_types::ATTESTATION,
        Some(&attestation.id),
        Some(&attestation.title),
        None,
    )
    .await;

    Ok(Json(attestation))
}

/// DELETE /api/attestations/:id
pub async fn delete_attestation(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let attestation = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::ATTESTATION_DELETE,
        resource_types::ATTESTATION,
        Some(&attestation.id),
        Some(&attestation.title),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/attestations/:id/attest
pub async fn attest(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<AttestRequest>,
) -> Result<Json<Attestation>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    let expires_at = timestamp_field(&mut errors, "expires_at", req.expires_at.as_deref());
    errors.finish()?;

    let current = load(&state, &ctx, &id).await?;
    if current.status_enum() == Some(AttestationStatus::Attested) {
        return Err(ApiError::conflict("Attestation is already attested"));
    }

    let now = Utc::now();
    let attested_at = format_timestamp(now);
    let expires_at = expires_at
        .unwrap_or_else(|| format_timestamp(now + Duration::days(DEFAULT_VALIDITY_DAYS)));
    if expires_at <= attested_at {
        return Err(ApiError::validation_field(
            "expires_at",
            "Expiry must be in the future",
        ));
    }

    let attestation = Attestation::attest(
        &state.db,
        &ctx.organization_id,
        &id,
        ctx.user_id(),
        &attested_at,
        &expires_at,
        req.notes.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::not_found("Attestation not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::ATTESTATION_ATTEST,
        resource_types::ATTESTATION,
        Some(&attestation.id),
        Some(&attestation.title),
        Some(json!({ "expires_at": attestation.expires_at })),
    )
    .await;

    state.dispatcher.emit(
        &ctx.organization_id,
        events::ATTESTATION_ATTESTED,
        json!({
            "attestation_id": attestation.id,
            "title": attestation.title,
            "framework": attestation.framework,
            "attested_by": attestation.attested_by,
            "expires_at": attestation.expires_at,
        }),
    );

    Ok(Json(attestation))
}

/// POST /api/attestations/:id/reject
pub async fn reject(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<Attestation>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let current = load(&state, &ctx, &id).await?;
    if current.status_enum() == Some(AttestationStatus::Rejected) {
        return Err(ApiError::conflict("Attestation is already rejected"));
    }

    let attestation = Attestation::reject(&state.db, &ctx.organization_id, &id, req.notes.as_deref())
        .await?
        .ok_or_else(|| ApiError::not_found("Attestation not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::ATTESTATION_REJECT,
        resource_types::ATTESTATION,
        Some(&attestation.id),
        Some(&attestation.title),
        None,
    )
    .await;

    Ok(Json(attestation))
}
