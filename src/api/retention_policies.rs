//! Data retention policy endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, resource_types, CreateRetentionPolicyRequest, OrgRole, RetentionPolicy,
    RetentionPolicyFilter, RetentionResource, RetentionRunResponse, UpdateRetentionPolicyRequest,
    MAX_RETENTION_DAYS, MIN_RETENTION_DAYS,
};
use crate::engine::execute_policy;
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{unique_conflict, ApiError, ValidationErrorBuilder};
use super::validation::{
    Json, Query, choice_field, validate_range, validate_required, MAX_NAME_LENGTH,
};

const TABLE: &str = "retention_policies";

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<RetentionPolicy, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Retention policy not found"))
}

fn check_days(errors: &mut ValidationErrorBuilder, days: i64) {
    if let Err(e) = validate_range(days, MIN_RETENTION_DAYS, MAX_RETENTION_DAYS, "Retention days")
    {
        errors.add("retention_days", e);
    }
}

/// GET /api/retention-policies
pub async fn list_policies(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<RetentionPolicyFilter>,
) -> Result<Json<Paginated<RetentionPolicy>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("resource_type", filter.resource_type.as_deref())
        .flag("is_active", filter.is_active);
    let policies = paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(policies))
}

/// GET /api/retention-policies/:id
pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<RetentionPolicy>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?))
}

/// POST /api/retention-policies
pub async fn create_policy(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateRetentionPolicyRequest>,
) -> Result<(StatusCode, Json<RetentionPolicy>), ApiError> {
    ctx.require(OrgRole::Admin)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_required(&req.name, "Name", MAX_NAME_LENGTH) {
        errors.add("name", e);
    }
    let resource: Option<RetentionResource> =
        choice_field(&mut errors, "resource_type", Some(&req.resource_type));
    check_days(&mut errors, req.retention_days);
    errors.finish()?;
    let resource = resource
        .ok_or_else(|| ApiError::validation_field("resource_type", "Resource type is required"))?;

    let policy = RetentionPolicy::create(
        &state.db,
        &ctx.organization_id,
        &req.name,
        resource,
        req.retention_days,
        req.is_active.unwrap_or(true),
    )
    .await
    .map_err(unique_conflict(format!(
        "A retention policy for {} already exists",
        resource
    )))?;

    audit_log(
        &state,
        &ctx,
        actions::RETENTION_CREATE,
        resource_types::RETENTION_POLICY,
        Some(&policy.id),
        Some(&policy.name),
        Some(json!({
            "resource_type": policy.resource_type,
            "retention_days": policy.retention_days,
        })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(policy)))
}

/// PUT /api/retention-policies/:id
pub async fn update_policy(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateRetentionPolicyRequest>,
) -> Result<Json<RetentionPolicy>, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(name) = &req.name {
        if let Err(e) = validate_required(name, "Name", MAX_NAME_LENGTH) {
            errors.add("name", e);
        }
    }
    if let Some(days) = req.retention_days {
        check_days(&mut errors, days);
    }
    errors.finish()?;

    let policy = RetentionPolicy::update(&state.db, &ctx.organization_id, &id, &req)
        .await?
        .ok_or_else(|| ApiError::not_found("Retention policy not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::RETENTION_UPDATE,
        resource_types::RETENTION_POLICY,
        Some(&policy.id),
        Some(&policy.name),
        None,
    )
    .await;

    Ok(Json(policy))
}

/// DELETE /api/retention-policies/:id
pub async fn delete_policy(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let policy = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::RETENTION_DELETE,
        resource_types::RETENTION_POLICY,
        Some(&policy.id),
        Some(&policy.name),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/retention-policies/:id/execute - apply the policy now
pub async fn execute(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<RetentionRunResponse>, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let policy = load(&state, &ctx, &id).await?;
    let run = execute_policy(&state.db, &policy, Utc::now()).await?;

    audit_log(
        &state,
        &ctx,
        actions::RETENTION_EXECUTE,
        resource_types::RETENTION_POLICY,
        Some(&policy.id),
        Some(&policy.name),
        Some(json!({ "deleted": run.deleted, "cutoff": run.cutoff })),
    )
    .await;

    Ok(Json(run))
}
