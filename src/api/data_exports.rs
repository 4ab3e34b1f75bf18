//! Data export requests and downloads.
//!
//! The export itself is produced by an external worker, which reports its
//! progress through `PUT /api/data-exports/:id/status`. A completed export is
//! downloadable until `expires_at`; afterwards the download answers 410.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, events, resource_types, CreateDataExportRequest, DataExport, DataExportFilter,
    DownloadResponse, ExportFormat, ExportStatus, ExportType, OrgRole, UpdateExportStatusRequest,
};
use crate::utils::format_timestamp;
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{Json, Query, choice_field, validate_http_url};

const TABLE: &str = "data_exports";

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<DataExport, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Data export not found"))
}

/// GET /api/data-exports
pub async fn list_exports(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<DataExportFilter>,
) -> Result<Json<Paginated<DataExport>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("status", filter.status.as_deref())
        .eq("export_type", filter.export_type.as_deref());
    let exports = paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(exports))
}

/// GET /api/data-exports/:id
pub async fn get_export(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<DataExport>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?))
}

/// POST /api/data-exports
pub async fn create_export(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateDataExportRequest>,
) -> Result<(StatusCode, Json<DataExport>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    let export_type: Option<ExportType> =
        choice_field(&mut errors, "export_type", Some(&req.export_type));
    let format: Option<ExportFormat> = choice_field(&mut errors, "format", req.format.as_deref());
    errors.finish()?;
    let export_type = export_type
        .ok_or_else(|| ApiError::validation_field("export_type", "Export type is required"))?;

    let expires_at =
        format_timestamp(Utc::now() + Duration::days(state.config.exports.expiry_days));
    let export = DataExport::create(
        &state.db,
        &ctx.organization_id,
        export_type,
        format.unwrap_or(ExportFormat::Json),
        Some(ctx.user_id()),
        &expires_at,
    )
    .await?;

    audit_log(
        &state,
        &ctx,
        actions::EXPORT_REQUEST,
        resource_types::DATA_EXPORT,
        Some(&export.id),
        Some(&export.export_type),
        Some(json!({ "format": export.format })),
    )
    .await;
    tracing::info!(
        organization_id = %ctx.organization_id,
        export_id = %export.id,
        export_type = %export.export_type,
        "Data export requested"
    );

    Ok((StatusCode::CREATED, Json(export)))
}

/// PUT /api/data-exports/:id/status
pub async fn update_export_status(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateExportStatusRequest>,
) -> Result<Json<DataExport>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    let next: Option<ExportStatus> = choice_field(&mut errors, "status", Some(&req.status));
    if let Some(url) = &req.file_url {
        if let Err(e) = validate_http_url(url) {
            errors.add("file_url", e);
        }
    }
    if next == Some(ExportStatus::Completed) && req.file_url.is_none() {
        errors.add("file_url", "A completed export requires file_url");
    }
    errors.finish()?;
    let next = next.ok_or_else(|| ApiError::validation_field("status", "Status is required"))?;

    let current = load(&state, &ctx, &id).await?;
    let from = current
        .status_enum()
        .ok_or_else(|| ApiError::internal("Data export has an unknown status"))?;
    if !from.can_transition_to(next) {
        return Err(ApiError::conflict(format!(
            "Cannot move a data export from {} to {}",
            from, next
        )));
    }

    let export = DataExport::set_status(
        &state.db,
        &ctx.organization_id,
        &id,
        from,
        next,
        req.file_url.as_deref().map(str::trim),
        req.error_message.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::conflict("Data export status changed, reload and retry"))?;

    audit_log(
        &state,
        &ctx,
        actions::EXPORT_STATUS,
        resource_types::DATA_EXPORT,
        Some(&export.id),
        Some(&export.export_type),
        Some(json!({ "from": from, "to": next })),
    )
    .await;

    if next == ExportStatus::Completed {
        state.dispatcher.emit(
            &ctx.organization_id,
            events::EXPORT_COMPLETED,
            json!({
                "export_id": export.id,
                "export_type": export.export_type,
                "format": export.format,
                "expires_at": export.expires_at,
            }),
        );
    }

    Ok(Json(export))
}

/// GET /api/data-exports/:id/download
pub async fn download_export(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<DownloadResponse>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let export = load(&state, &ctx, &id).await?;
    if export.is_expired_at(&crate::utils::now()) {
        return Err(ApiError::gone("This export has expired"));
    }
    if export.status_enum() != Some(ExportStatus::Completed) {
        return Err(ApiError::conflict(format!(
            "Export is not ready (status: {})",
            export.status
        )));
    }
    let url = export
        .file_url
        .ok_or_else(|| ApiError::internal("Completed export has no file"))?;

    Ok(Json(DownloadResponse {
        url,
        expires_at: export.expires_at,
    }))
}
