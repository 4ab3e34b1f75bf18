//! Customer health score endpoints.

use axum::{
    extract::State,
    http::StatusCode,
};
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, events, resource_types, CalculateHealthScoreRequest, HealthScore, HealthScoreFilter,
    OrgRole, RiskLevel,
};
use crate::engine::health::{record_health_score, HealthInputs};
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{Json, Query, timestamp_field};

/// POST /api/health-scores - compute and store a snapshot
pub async fn calculate_health_score(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CalculateHealthScoreRequest>,
) -> Result<(StatusCode, Json<HealthScore>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let inputs = HealthInputs {
        usage: req.usage,
        engagement: req.engagement,
        support: req.support,
        payment: req.payment,
    };
    let mut errors = ValidationErrorBuilder::new();
    for field in inputs.out_of_range() {
        errors.add(field, format!("{} must be between 0 and 100", field));
    }
    errors.finish()?;

    let score = record_health_score(
        &state.db,
        &ctx.organization_id,
        &inputs,
        req.notes.as_deref(),
        Some(ctx.user_id()),
    )
    .await?;

    audit_log(
        &state,
        &ctx,
        actions::HEALTH_SCORE_CALCULATE,
        resource_types::HEALTH_SCORE,
        Some(&score.id),
        None,
        Some(json!({
            "overall_score": score.overall_score,
            "risk_level": score.risk_level,
            "trend": score.trend,
        })),
    )
    .await;

    if score.risk_level_enum() == Some(RiskLevel::Critical) {
        state.dispatcher.emit(
            &ctx.organization_id,
            events::HEALTH_SCORE_CRITICAL,
            json!({
                "health_score_id": score.id,
                "overall_score": score.overall_score,
                "churn_probability": score.churn_probability,
                "churn_risk": score.churn_risk,
                "trend": score.trend,
            }),
        );
    }

    Ok((StatusCode::CREATED, Json(score)))
}

/// GET /api/health-scores - snapshot history, newest first
pub async fn list_health_scores(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<HealthScoreFilter>,
) -> Result<Json<Paginated<HealthScore>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let mut errors = ValidationErrorBuilder::new();
    let since = timestamp_field(&mut errors, "start_date", filter.start_date.as_deref());
    let until = timestamp_field(&mut errors, "end_date", filter.end_date.as_deref());
    errors.finish()?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("risk_level", filter.risk_level.as_deref())
        .since("created_at", since.as_deref())
        .until("created_at", until.as_deref());
    let scores = paginate(&state.db, "health_scores", &where_, "created_at DESC", &page).await?;
    Ok(Json(scores))
}

/// GET /api/health-scores/latest
pub async fn latest_health_score(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
) -> Result<Json<HealthScore>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let score = HealthScore::latest(&state.db, &ctx.organization_id)
        .await?
        .ok_or_else(|| ApiError::not_found("No health score has been calculated yet"))?;
    Ok(Json(score))
}
