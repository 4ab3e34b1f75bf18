//! Feature flag endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, resource_types, CreateFeatureFlagRequest, EvaluateQuery, FeatureFlag,
    FeatureFlagFilter, FeatureFlagResponse, FlagEvaluation, OrgRole, UpdateFeatureFlagRequest,
};
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{unique_conflict, ApiError, ValidationErrorBuilder};
use super::validation::{
    Json, Query, validate_flag_key, validate_range, validate_required, MAX_NAME_LENGTH,
};

const TABLE: &str = "feature_flags";
const MAX_ALLOWED_SUBJECTS: usize = 1000;

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<FeatureFlag, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Feature flag not found"))
}

fn check_rollout_and_subjects(
    errors: &mut ValidationErrorBuilder,
    rollout: Option<i64>,
    subjects: Option<&[String]>,
) {
    if let Some(rollout) = rollout {
        if let Err(e) = validate_range(rollout, 0, 100, "Rollout percentage") {
            errors.add("rollout_percentage", e);
        }
    }
    if let Some(subjects) = subjects {
        if subjects.len() > MAX_ALLOWED_SUBJECTS {
            errors.add(
                "allowed_subjects",
                format!("At most {} subjects may be targeted", MAX_ALLOWED_SUBJECTS),
            );
        }
        if subjects.iter().any(|s| s.trim().is_empty()) {
            errors.add("allowed_subjects", "Subjects cannot be blank");
        }
    }
}

/// GET /api/feature-flags
pub async fn list_flags(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<FeatureFlagFilter>,
) -> Result<Json<Paginated<FeatureFlagResponse>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .flag("enabled", filter.enabled)
        .search(&["flag_key", "name", "description"], filter.search.as_deref());
    let flags: Paginated<FeatureFlag> =
        paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(flags.map(FeatureFlagResponse::from)))
}

/// GET /api/feature-flags/:id
pub async fn get_flag(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<FeatureFlagResponse>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?.into()))
}

/// POST /api/feature-flags
pub async fn create_flag(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateFeatureFlagRequest>,
) -> Result<(StatusCode, Json<FeatureFlagResponse>), ApiError> {
    ctx.require(OrgRole::Admin)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_flag_key(req.key.trim()) {
        errors.add("key", e);
    }
    if let Err(e) = validate_required(&req.name, "Name", MAX_NAME_LENGTH) {
        errors.add("name", e);
    }
    check_rollout_and_subjects(
        &mut errors,
        req.rollout_percentage,
        req.allowed_subjects.as_deref(),
    );
    errors.finish()?;

    let flag = FeatureFlag::create(&state.db, &ctx.organization_id, &req)
        .await
        .map_err(unique_conflict(format!(
            "A feature flag with key '{}' already exists",
            req.key.trim()
        )))?;

    audit_log(
        &state,
        &ctx,
        actions::FEATURE_FLAG_CREATE,
        resource_types::FEATURE_FLAG,
        Some(&flag.id),
        Some(&flag.key),
        Some(json!({
            "enabled": flag.enabled,
            "rollout_percentage": flag.rollout_percentage,
        })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(flag.into())))
}

/// PUT /api/feature-flags/:id
pub async fn update_flag(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateFeatureFlagRequest>,
) -> Result<Json<FeatureFlagResponse>, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(name) = &req.name {
        if let Err(e) = validate_required(name, "Name", MAX_NAME_LENGTH) {
            errors.add("name", e);
        }
    }
    check_rollout_and_subjects(
        &mut errors,
        req.rollout_percentage,
        req.allowed_subjects.as_deref(),
    );
    errors.finish()?;

    let flag = FeatureFlag::update(&state.db, &ctx.organization_id, &id, &req)
        .await?
        .ok_or_else(|| ApiError::not_found("Feature flag not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::FEATURE_FLAG_UPDATE,
        resource_types::FEATURE_FLAG,
        Some(&flag.id),
        Some(&flag.key),
        Some(json!({
            "enabled": flag.enabled,
            "rollout_percentage": flag.rollout_percentage,
        })),
    )
    .await;

    Ok(Json(flag.into()))
}

/// DELETE /api/feature-flags/:id
pub async fn delete_flag(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let flag = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::FEATURE_FLAG_DELETE,
        resource_types::FEATURE_FLAG,
        Some(&flag.id),
        Some(&flag.key),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/feature-flags/:key/evaluate?subject=...
pub async fn evaluate_flag(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(key): Path<String>,
    Query(query): Query<EvaluateQuery>,
) -> Result<Json<FlagEvaluation>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let flag = FeatureFlag::find_by_key(&state.db, &ctx.organization_id, &key)
        .await?
        .ok_or_else(|| ApiError::not_found("Feature flag not found"))?;

    let subject = query.subject.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if subject.is_none() && flag.needs_subject() {
        return Err(ApiError::validation_field(
            "subject",
            "A subject is required to evaluate a partial rollout",
        ));
    }

    Ok(Json(flag.evaluate(subject)))
}
