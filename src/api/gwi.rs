//! GWI portal: platform admin endpoints spanning every organization.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::query::{paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, resource_types, AuditEntry, CreateOrganizationRequest, CreateUserRequest,
    HealthScore, OrgStatus, Organization, OrganizationFilter, OrganizationHealth, PipelineRun, Plan,
    RiskLevel, SecurityThreat, TextEnum, UpdateOrganizationRequest, UserResponse,
};
use crate::utils::{format_timestamp, slugify};
use crate::AppState;

use super::audit::{record, ClientIp};
use super::auth::PlatformAdmin;
use super::error::{ApiError, ValidationErrorBuilder};
use super::organizations::create_member;
use super::validation::{
    Json, Query, choice_field, parse_choice, validate_required, validate_slug, MAX_NAME_LENGTH,
};

#[derive(Debug, Default, Deserialize)]
pub struct PortalHealthFilter {
    pub risk_level: Option<String>,
}

/// Platform-wide counters
#[derive(Debug, Serialize, Deserialize)]
pub struct PortalOverview {
    pub organizations_total: i64,
    pub organizations_by_status: BTreeMap<String, i64>,
    pub open_threats_by_severity: BTreeMap<String, i64>,
    pub failed_runs_24h: i64,
    pub organizations_at_risk: i64,
    pub organizations_critical: i64,
}

async fn audit_org(
    state: &AppState,
    admin: &PlatformAdmin,
    ip: &str,
    action: &str,
    resource_type: &str,
    org: &Organization,
    resource_id: &str,
    resource_name: &str,
) {
    record(
        state,
        &AuditEntry {
            organization_id: Some(&org.id),
            action,
            resource_type,
            resource_id: Some(resource_id),
            resource_name: Some(resource_name),
            user_id: Some(&admin.0.id),
            ip_address: Some(ip),
            details: None,
        },
    )
    .await;
}

/// GET /api/gwi/organizations
pub async fn list_organizations(
    State(state): State<Arc<AppState>>,
    _admin: PlatformAdmin,
    Query(page): Query<PageQuery>,
    Query(filter): Query<OrganizationFilter>,
) -> Result<Json<Paginated<Organization>>, ApiError> {
    let where_ = Filter::new()
        .eq("status", filter.status.as_deref())
        .eq("plan", filter.plan.as_deref())
        .search(&["name", "slug"], filter.search.as_deref());
    let orgs = paginate(&state.db, "organizations", &where_, "created_at DESC", &page).await?;
    Ok(Json(orgs))
}

/// POST /api/gwi/organizations
pub async fn create_organization(
    State(state): State<Arc<AppState>>,
    admin: PlatformAdmin,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateOrganizationRequest>,
) -> Result<(StatusCode, Json<Organization>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_required(&req.name, "Name", MAX_NAME_LENGTH) {
        errors.add("name", e);
    }
    let slug = req
        .slug
        .as_deref()
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| slugify(&req.name));
    if let Err(e) = validate_slug(&slug) {
        errors.add("slug", e);
    }
    let plan: Plan = choice_field(&mut errors, "plan", req.plan.as_deref()).unwrap_or(Plan::Free);
    errors.finish()?;

    let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM organizations WHERE slug = ?")
        .bind(&slug)
        .fetch_one(&state.db)
        .await?;
    if exists > 0 {
        return Err(ApiError::conflict("An organization with this slug already exists"));
    }

    let org = Organization::create(&state.db, req.name.trim(), &slug, plan.as_str()).await?;

    audit_org(
        &state,
        &admin,
        &ip,
        actions::ORGANIZATION_CREATE,
        resource_types::ORGANIZATION,
        &org,
        &org.id,
        &org.name,
    )
    .await;
    tracing::info!(organization_id = %org.id, slug = %org.slug, "Created organization");

    Ok((StatusCode::CREATED, Json(org)))
}

/// GET /api/gwi/organizations/:id
pub async fn get_organization(
    State(state): State<Arc<AppState>>,
    _admin: PlatformAdmin,
    Path(id): Path<String>,
) -> Result<Json<Organization>, ApiError> {
    let org = Organization::find(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("Organization not found"))?;
    Ok(Json(org))
}

/// PUT /api/gwi/organizations/:id
pub async fn update_organization(
    State(state): State<Arc<AppState>>,
    admin: PlatformAdmin,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<UpdateOrganizationRequest>,
) -> Result<Json<Organization>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Some(name) = &req.name {
        if let Err(e) = validate_required(name, "Name", MAX_NAME_LENGTH) {
            errors.add("name", e);
        }
    }
    let plan: Option<Plan> = choice_field(&mut errors, "plan", req.plan.as_deref());
    let status: Option<OrgStatus> = choice_field(&mut errors, "status", req.status.as_deref());
    errors.finish()?;

    let org = Organization::update(
        &state.db,
        &id,
        req.name.as_deref().map(str::trim),
        plan.map(|p| p.as_str()),
        status.map(|s| s.as_str()),
    )
    .await?
    .ok_or_else(|| ApiError::not_found("Organization not found"))?;

    audit_org(
        &state,
        &admin,
        &ip,
        actions::ORGANIZATION_UPDATE,
        resource_types::ORGANIZATION,
        &org,
        &org.id,
        &org.name,
    )
    .await;

    Ok(Json(org))
}

/// POST /api/gwi/organizations/:id/users
pub async fn create_organization_user(
    State(state): State<Arc<AppState>>,
    admin: PlatformAdmin,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let org = Organization::find(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("Organization not found"))?;

    let user = create_member(&state, &org.id, &req, None).await?;

    audit_org(
        &state,
        &admin,
        &ip,
        actions::USER_CREATE,
        resource_types::USER,
        &org,
        &user.id,
        &user.email,
    )
    .await;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

/// GET /api/gwi/health-scores - latest snapshot per organization, worst first
pub async fn list_health_scores(
    State(state): State<Arc<AppState>>,
    _admin: PlatformAdmin,
    Query(filter): Query<PortalHealthFilter>,
) -> Result<Json<Vec<OrganizationHealth>>, ApiError> {
    let risk_level = match filter.risk_level.as_deref().map(str::trim) {
        Some(r) if !r.is_empty() => Some(
            parse_choice::<RiskLevel>(r, "risk_level")
                .map_err(|e| ApiError::validation_field("risk_level", e))?,
        ),
        _ => None,
    };

    let scores = HealthScore::latest_per_organization(
        &state.db,
        risk_level.map(|r| r.as_str()),
    )
    .await?;
    Ok(Json(scores))
}

/// GET /api/gwi/overview
pub async fn overview(
    State(state): State<Arc<AppState>>,
    _admin: PlatformAdmin,
) -> Result<Json<PortalOverview>, ApiError> {
    let mut organizations_by_status: BTreeMap<String, i64> = OrgStatus::all()
        .iter()
        .map(|s| (s.to_string(), 0))
        .collect();
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM organizations GROUP BY status")
            .fetch_all(&state.db)
            .await?;
    for (status, count) in rows {
        organizations_by_status.insert(status, count);
    }

    let threats = SecurityThreat::summary(&state.db, None).await?;

    let since = format_timestamp(Utc::now() - Duration::hours(24));
    let failed_runs_24h = PipelineRun::count_failed_since(&state.db, &since).await?;

    let health = HealthScore::latest_per_organization(&state.db, None).await?;
    let count_level = |level: RiskLevel| {
        health
            .iter()
            .filter(|h| h.risk_level == level.as_str())
            .count() as i64
    };

    Ok(Json(PortalOverview {
        organizations_total: organizations_by_status.values().sum(),
        organizations_by_status,
        open_threats_by_severity: threats.by_severity,
        failed_runs_24h,
        organizations_at_risk: count_level(RiskLevel::AtRisk),
        organizations_critical: count_level(RiskLevel::Critical),
    }))
}
