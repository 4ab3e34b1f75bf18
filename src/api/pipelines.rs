//! Data pipeline endpoints.
//!
//! Runs are queued here (manually or by the scheduler) and executed by an
//! external worker, which reports progress through
//! `PUT /api/pipelines/runs/:run_id/status`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, events, resource_types, CreatePipelineRequest, OrgRole, Pipeline, PipelineFields,
    PipelineFilter, PipelineRun, PipelineStatus, RunFilter, RunStatus, SourceType, TriggerType,
    UpdatePipelineRequest, UpdateRunStatusRequest,
};
use crate::engine::{compute_next_run, parse_schedule};
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{unique_conflict, ApiError, ValidationErrorBuilder};
use super::metrics::{record_pipeline_run_finished, record_pipeline_run_queued};
use super::validation::{Json, Query, choice_field, validate_required, MAX_NAME_LENGTH};

const TABLE: &str = "pipelines";
const RUNS_TABLE: &str = "pipeline_runs";
const MAX_DESTINATION_LENGTH: usize = 500;

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<Pipeline, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Pipeline not found"))
}

async fn load_run(state: &AppState, ctx: &OrgContext, id: &str) -> Result<PipelineRun, ApiError> {
    find_scoped(&state.db, RUNS_TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Pipeline run not found"))
}

/// Blank schedules mean "no schedule"
fn normalize_schedule(schedule: Option<&str>) -> Option<&str> {
    schedule.map(str::trim).filter(|s| !s.is_empty())
}

fn check_schedule(errors: &mut ValidationErrorBuilder, schedule: Option<&str>) {
    if let Some(expr) = normalize_schedule(schedule) {
        if let Err(e) = parse_schedule(expr) {
            errors.add("schedule", e);
        }
    }
}

fn check_destination(errors: &mut ValidationErrorBuilder, destination: &str) {
    if let Err(e) = validate_required(destination, "Destination", MAX_DESTINATION_LENGTH) {
        errors.add("destination", e);
    }
}

fn encode_config(config: Option<&serde_json::Value>) -> Option<String> {
    config.map(|c| c.to_string())
}

/// GET /api/pipelines
pub async fn list_pipelines(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<PipelineFilter>,
) -> Result<Json<Paginated<Pipeline>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("status", filter.status.as_deref())
        .eq("source_type", filter.source_type.as_deref())
        .search(&["name", "description", "destination"], filter.search.as_deref());
    let pipelines = paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(pipelines))
}

/// GET /api/pipelines/:id
pub async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<Pipeline>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?))
}

/// POST /api/pipelines
pub async fn create_pipeline(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<(StatusCode, Json<Pipeline>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_required(&req.name, "Name", MAX_NAME_LENGTH) {
        errors.add("name", e);
    }
    let source_type: Option<SourceType> =
        choice_field(&mut errors, "source_type", Some(&req.source_type));
    check_destination(&mut errors, &req.destination);
    check_schedule(&mut errors, req.schedule.as_deref());
    errors.finish()?;
    let source_type = source_type
        .ok_or_else(|| ApiError::validation_field("source_type", "Source type is required"))?;

    let schedule = normalize_schedule(req.schedule.as_deref());
    let fields = PipelineFields {
        name: req.name.trim(),
        description: req.description.as_deref(),
        source_type,
        source_config: encode_config(req.source_config.as_ref()),
        destination: req.destination.trim(),
        schedule,
    };
    let next_run_at = compute_next_run(true, schedule, Utc::now());
    let pipeline =
        Pipeline::create(&state.db, &ctx.organization_id, &fields, next_run_at.as_deref()).await?;

    audit_log(
        &state,
        &ctx,
        actions::PIPELINE_CREATE,
        resource_types::PIPELINE,
        Some(&pipeline.id),
        Some(&pipeline.name),
        Some(json!({ "source_type": pipeline.source_type, "schedule": pipeline.schedule })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// PUT /api/pipelines/:id
pub async fn update_pipeline(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdatePipelineRequest>,
) -> Result<Json<Pipeline>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(name) = &req.name {
        if let Err(e) = validate_required(name, "Name", MAX_NAME_LENGTH) {
            errors.add("name", e);
        }
    }
    let source_type: Option<SourceType> =
        choice_field(&mut errors, "source_type", req.source_type.as_deref());
    if let Some(destination) = &req.destination {
        check_destination(&mut errors, destination);
    }
    check_schedule(&mut errors, req.schedule.as_deref());
    errors.finish()?;

    let existing = load(&state, &ctx, &id).await?;
    let existing_source = existing
        .source_type
        .parse::<SourceType>()
        .map_err(|_| ApiError::internal("Pipeline has an unknown source type"))?;

    // An explicit empty string clears the schedule
    let schedule = match &req.schedule {
        Some(s) => normalize_schedule(Some(s)),
        None => existing.schedule.as_deref(),
    };
    let fields = PipelineFields {
        name: req.name.as_deref().map(str::trim).unwrap_or(&existing.name),
        description: req
            .description
            .as_deref()
            .or(existing.description.as_deref()),
        source_type: source_type.unwrap_or(existing_source),
        source_config: match &req.source_config {
            Some(config) => encode_config(Some(config)),
            None => existing.source_config.clone(),
        },
        destination: req
            .destination
            .as_deref()
            .map(str::trim)
            .unwrap_or(&existing.destination),
        schedule,
    };
    let next_run_at = compute_next_run(existing.is_active(), schedule, Utc::now());

    let pipeline = Pipeline::save(
        &state.db,
        &ctx.organization_id,
        &id,
        &fields,
        next_run_at.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::not_found("Pipeline not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::PIPELINE_UPDATE,
        resource_types::PIPELINE,
        Some(&pipeline.id),
        Some(&pipeline.name),
        None,
    )
    .await;

    Ok(Json(pipeline))
}

/// DELETE /api/pipelines/:id
pub async fn delete_pipeline(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let pipeline = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::PIPELINE_DELETE,
        resource_types::PIPELINE,
        Some(&pipeline.id),
        Some(&pipeline.name),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

async fn change_status(
    state: &AppState,
    ctx: &OrgContext,
    id: &str,
    target: PipelineStatus,
    action: &str,
) -> Result<Pipeline, ApiError> {
    ctx.require(OrgRole::Member)?;

    let current = load(state, ctx, id).await?;
    if current.status_enum() == Some(target) {
        return Err(ApiError::conflict(format!("Pipeline is already {}", target)));
    }

    let next_run_at = compute_next_run(
        target == PipelineStatus::Active,
        current.schedule.as_deref(),
        Utc::now(),
    );
    let pipeline = Pipeline::set_status(
        &state.db,
        &ctx.organization_id,
        id,
        target,
        next_run_at.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::not_found("Pipeline not found"))?;

    audit_log(
        state,
        ctx,
        action,
        resource_types::PIPELINE,
        Some(&pipeline.id),
        Some(&pipeline.name),
        None,
    )
    .await;

    Ok(pipeline)
}

/// POST /api/pipelines/:id/pause
pub async fn pause_pipeline(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<Pipeline>, ApiError> {
    let pipeline =
        change_status(&state, &ctx, &id, PipelineStatus::Paused, actions::PIPELINE_PAUSE).await?;
    Ok(Json(pipeline))
}

/// POST /api/pipelines/:id/resume
pub async fn resume_pipeline(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<Pipeline>, ApiError> {
    let pipeline =
        change_status(&state, &ctx, &id, PipelineStatus::Active, actions::PIPELINE_RESUME).await?;
    Ok(Json(pipeline))
}

/// POST /api/pipelines/:id/runs - queue a manual run
pub async fn trigger_run(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<PipelineRun>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let pipeline = load(&state, &ctx, &id).await?;
    if !pipeline.is_active() {
        return Err(ApiError::conflict("Paused pipelines cannot be run"));
    }
    if PipelineRun::has_active(&state.db, &pipeline.id).await? {
        return Err(ApiError::conflict(
            "Pipeline already has a queued or running run",
        ));
    }

    let run = PipelineRun::create(&state.db, &pipeline, TriggerType::Manual, Some(ctx.user_id()))
        .await
        .map_err(unique_conflict("Pipeline already has a queued or running run"))?;
    record_pipeline_run_queued(TriggerType::Manual);

    audit_log(
        &state,
        &ctx,
        actions::PIPELINE_RUN_TRIGGER,
        resource_types::PIPELINE,
        Some(&pipeline.id),
        Some(&pipeline.name),
        Some(json!({ "run_id": run.id })),
    )
    .await;
    tracing::info!(
        pipeline_id = %pipeline.id,
        run_id = %run.id,
        "Queued manual pipeline run"
    );

    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /api/pipelines/:id/runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
    Query(filter): Query<RunFilter>,
) -> Result<Json<Paginated<PipelineRun>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let pipeline = load(&state, &ctx, &id).await?;
    let where_ = Filter::for_org(&ctx.organization_id)
        .eq_value("pipeline_id", &pipeline.id)
        .eq("status", filter.status.as_deref());
    let runs = paginate(&state.db, RUNS_TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(runs))
}

/// GET /api/pipelines/runs/:run_id
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(run_id): Path<String>,
) -> Result<Json<PipelineRun>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load_run(&state, &ctx, &run_id).await?))
}

/// PUT /api/pipelines/runs/:run_id/status
pub async fn update_run_status(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(run_id): Path<String>,
    Json(req): Json<UpdateRunStatusRequest>,
) -> Result<Json<PipelineRun>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    let next: Option<RunStatus> = choice_field(&mut errors, "status", Some(&req.status));
    if matches!(req.records_processed, Some(n) if n < 0) {
        errors.add("records_processed", "Records processed cannot be negative");
    }
    errors.finish()?;
    let next = next.ok_or_else(|| ApiError::validation_field("status", "Status is required"))?;

    let current = load_run(&state, &ctx, &run_id).await?;
    let from = current
        .status_enum()
        .ok_or_else(|| ApiError::internal("Pipeline run has an unknown status"))?;
    if !from.can_transition_to(next) {
        return Err(ApiError::conflict(format!(
            "Cannot move a pipeline run from {} to {}",
            from, next
        )));
    }

    let run = PipelineRun::set_status(
        &state.db,
        &ctx.organization_id,
        &run_id,
        from,
        next,
        req.records_processed,
        req.error_message.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::conflict("Pipeline run status changed, reload and retry"))?;

    let at = run
        .finished_at
        .clone()
        .or_else(|| run.started_at.clone())
        .unwrap_or_else(crate::utils::now);
    Pipeline::record_run(&state.db, &run.pipeline_id, &at, next).await?;
    if next.is_terminal() {
        record_pipeline_run_finished(next);
    }

    audit_log(
        &state,
        &ctx,
        actions::PIPELINE_RUN_STATUS,
        resource_types::PIPELINE_RUN,
        Some(&run.id),
        None,
        Some(json!({ "pipeline_id": run.pipeline_id, "from": from, "to": next })),
    )
    .await;

    let event = match next {
        RunStatus::Succeeded => Some(events::PIPELINE_RUN_COMPLETED),
        RunStatus::Failed => Some(events::PIPELINE_RUN_FAILED),
        _ => None,
    };
    if let Some(event) = event {
        state.dispatcher.emit(
            &ctx.organization_id,
            event,
            json!({
                "pipeline_id": run.pipeline_id,
                "run_id": run.id,
                "status": run.status,
                "trigger": run.trigger,
                "records_processed": run.records_processed,
                "error_message": run.error_message,
                "started_at": run.started_at,
                "finished_at": run.finished_at,
            }),
        );
    }

    Ok(Json(run))
}
