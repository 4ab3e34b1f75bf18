//! Compliance audit endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, events, resource_types, AuditChanges, AuditStatus, ComplianceAudit,
    ComplianceAuditFilter, CreateComplianceAuditRequest, Framework, OrgRole,
    UpdateComplianceAuditRequest,
};
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{
    Json, Query, choice_field, timestamp_field, validate_required, validate_score, MAX_NAME_LENGTH,
};

const TABLE: &str = "compliance_audits";

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<ComplianceAudit, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Compliance audit not found"))
}

/// GET /api/compliance-audits
pub async fn list_audits(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<ComplianceAuditFilter>,
) -> Result<Json<Paginated<ComplianceAudit>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("status", filter.status.as_deref())
        .eq("framework", filter.framework.as_deref())
        .search(&["name", "auditor"], filter.search.as_deref());
    let audits = paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(audits))
}

/// GET /api/compliance-audits/:id
pub async fn get_audit(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<ComplianceAudit>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?))
}

/// POST /api/compliance-audits
pub async fn create_audit(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateComplianceAuditRequest>,
) -> Result<(StatusCode, Json<ComplianceAudit>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_required(&req.name, "Name", MAX_NAME_LENGTH) {
        errors.add("name", e);
    }
    choice_field::<Framework>(&mut errors, "framework", Some(&req.framework));
    let scheduled_for =
        timestamp_field(&mut errors, "scheduled_for", req.scheduled_for.as_deref());
    errors.finish()?;

    let audit =
        ComplianceAudit::create(&state.db, &ctx.organization_id, &req, scheduled_for.as_deref())
            .await?;

    audit_log(
        &state,
        &ctx,
        actions::AUDIT_CREATE,
        resource_types::COMPLIANCE_AUDIT,
        Some(&audit.id),
        Some(&audit.name),
        Some(json!({ "framework": audit.framework })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(audit)))
}

/// PUT /api/compliance-audits/:id
pub async fn update_audit(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateComplianceAuditRequest>,
) -> Result<Json<ComplianceAudit>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(name) = &req.name {
        if let Err(e) = validate_required(name, "Name", MAX_NAME_LENGTH) {
            errors.add("name", e);
        }
    }
    let status: Option<AuditStatus> = choice_field(&mut errors, "status", req.status.as_deref());
    let scheduled_for =
        timestamp_field(&mut errors, "scheduled_for", req.scheduled_for.as_deref());
    if let Some(score) = req.score {
        if let Err(e) = validate_score(score, "Score") {
            errors.add("score", e);
        }
    }
    if matches!(req.findings_count, Some(n) if n < 0) {
        errors.add("findings_count", "Findings count cannot be negative");
    }
    errors.finish()?;

    let current = load(&state, &ctx, &id).await?;
    let (expected_status, completing) = match status {
        Some(next) => {
            let from = current
                .status_enum()
                .ok_or_else(|| ApiError::internal("Compliance audit has an unknown status"))?;
            if from != next && !from.can_transition_to(next) {
                return Err(ApiError::conflict(format!(
                    "Cannot move a compliance audit from {} to {}",
                    from, next
                )));
            }
            (Some(from), from != next && next == AuditStatus::Completed)
        }
        None => (None, false),
    };

    let changes = AuditChanges {
        name: req.name.as_deref().map(str::trim),
        auditor: req.auditor.as_deref(),
        scheduled_for,
        status,
        expected_status,
        completed_at: completing.then(crate::utils::now),
        findings_count: req.findings_count,
        score: req.score,
        summary: req.summary.as_deref(),
    };

    let audit = ComplianceAudit::update(&state.db, &ctx.organization_id, &id, &changes)
        .await?
        .ok_or_else(|| match expected_status {
            Some(_) => ApiError::conflict("Compliance audit status changed, reload and retry"),
            None => ApiError::not_found("Compliance audit not found"),
        })?;

    audit_log(
        &state,
        &ctx,
        actions::AUDIT_UPDATE,
        resource_types::COMPLIANCE_AUDIT,
        Some(&audit.id),
        Some(&audit.name),
        status.map(|s| json!({ "status": s })),
    )
    .await;

    if completing {
        state.dispatcher.emit(
            &ctx.organization_id,
            events::AUDIT_COMPLETED,
            json!({
                "audit_id": audit.id,
                "name": audit.name,
                "framework": audit.framework,
                "score": audit.score,
                "findings_count": audit.findings_count,
                "completed_at": audit.completed_at,
            }),
        );
    }

    Ok(Json(audit))
}

/// DELETE /api/compliance-audits/:id
pub async fn delete_audit(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let audit = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::AUDIT_DELETE,
        resource_types::COMPLIANCE_AUDIT,
        Some(&audit.id),
        Some(&audit.name),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}
