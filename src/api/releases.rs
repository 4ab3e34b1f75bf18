//! Release notes endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, events, resource_types, CreateReleaseRequest, OrgRole, Release, ReleaseFilter,
    ReleaseStatus, UpdateReleaseRequest,
};
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{unique_conflict, ApiError, ValidationErrorBuilder};
use super::validation::{Json, Query, validate_required, validate_semver, MAX_NAME_LENGTH};

const TABLE: &str = "releases";

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<Release, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Release not found"))
}

fn current_status(release: &Release) -> Result<ReleaseStatus, ApiError> {
    release
        .status_enum()
        .ok_or_else(|| ApiError::internal("Release has an unknown status"))
}

/// GET /api/releases
pub async fn list_releases(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<ReleaseFilter>,
) -> Result<Json<Paginated<Release>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("status", filter.status.as_deref())
        .search(&["version", "title"], filter.search.as_deref());
    let releases = paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(releases))
}

/// GET /api/releases/:id
pub async fn get_release(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<Release>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?))
}

/// POST /api/releases
pub async fn create_release(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateReleaseRequest>,
) -> Result<(StatusCode, Json<Release>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_semver(&req.version) {
        errors.add("version", e);
    }
    if let Err(e) = validate_required(&req.title, "Title", MAX_NAME_LENGTH) {
        errors.add("title", e);
    }
    errors.finish()?;

    let release = Release::create(&state.db, &ctx.organization_id, &req, Some(ctx.user_id()))
        .await
        .map_err(unique_conflict(format!(
            "Release {} already exists",
            req.version.trim()
        )))?;

    audit_log(
        &state,
        &ctx,
        actions::RELEASE_CREATE,
        resource_types::RELEASE,
        Some(&release.id),
        Some(&release.version),
        None,
    )
    .await;

    Ok((StatusCode::CREATED, Json(release)))
}

/// PUT /api/releases/:id
pub async fn update_release(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateReleaseRequest>,
) -> Result<Json<Release>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(version) = &req.version {
        if let Err(e) = validate_semver(version) {
            errors.add("version", e);
        }
    }
    if let Some(title) = &req.title {
        if let Err(e) = validate_required(title, "Title", MAX_NAME_LENGTH) {
            errors.add("title", e);
        }
    }
    errors.finish()?;

    let current = load(&state, &ctx, &id).await?;
    let version_changes = matches!(&req.version, Some(v) if v.trim() != current.version);
    if version_changes && current_status(&current)? != ReleaseStatus::Draft {
        return Err(ApiError::conflict(
            "The version of a published or archived release cannot change",
        ));
    }

    let release = Release::update(&state.db, &ctx.organization_id, &id, &req)
        .await
        .map_err(unique_conflict("Another release already uses this version"))?
        .ok_or_else(|| ApiError::not_found("Release not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::RELEASE_UPDATE,
        resource_types::RELEASE,
        Some(&release.id),
        Some(&release.version),
        None,
    )
    .await;

    Ok(Json(release))
}

/// DELETE /api/releases/:id
pub async fn delete_release(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let release = load(&state, &ctx, &id).await?;
    if current_status(&release)? == ReleaseStatus::Published {
        return Err(ApiError::conflict(
            "Published releases cannot be deleted. Archive it instead",
        ));
    }
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::RELEASE_DELETE,
        resource_types::RELEASE,
        Some(&release.id),
        Some(&release.version),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/releases/:id/publish
pub async fn publish_release(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<Release>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let current = load(&state, &ctx, &id).await?;
    let status = current_status(&current)?;
    if status != ReleaseStatus::Draft {
        return Err(ApiError::conflict(format!(
            "Only draft releases can be published (status: {})",
            status
        )));
    }

    let release = Release::set_status(
        &state.db,
        &ctx.organization_id,
        &id,
        status,
        ReleaseStatus::Published,
    )
    .await?
    .ok_or_else(|| ApiError::conflict("Release status changed, reload and retry"))?;

    audit_log(
        &state,
        &ctx,
        actions::RELEASE_PUBLISH,
        resource_types::RELEASE,
        Some(&release.id),
        Some(&release.version),
        None,
    )
    .await;

    state.dispatcher.emit(
        &ctx.organization_id,
        events::RELEASE_PUBLISHED,
        json!({
            "release_id": release.id,
            "version": release.version,
            "title": release.title,
            "published_at": release.published_at,
        }),
    );

    Ok(Json(release))
}

/// POST /api/releases/:id/archive
pub async fn archive_release(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<Release>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let current = load(&state, &ctx, &id).await?;
    let status = current_status(&current)?;
    if status == ReleaseStatus::Archived {
        return Err(ApiError::conflict("Release is already archived"));
    }

    let release = Release::set_status(
        &state.db,
        &ctx.organization_id,
        &id,
        status,
        ReleaseStatus::Archived,
    )
    .await?
    .ok_or_else(|| ApiError::conflict("Release status changed, reload and retry"))?;

    audit_log(
        &state,
        &ctx,
        actions::RELEASE_ARCHIVE,
        resource_types::RELEASE,
        Some(&release.id),
        Some(&release.version),
        None,
    )
    .await;

    Ok(Json(release))
}
