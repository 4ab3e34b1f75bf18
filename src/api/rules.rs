//! Business rule endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, resource_types, Condition, CreateRuleRequest, EvaluateRuleRequest, MatchMode,
    Operator, OrgRole, Rule, RuleEvaluation, RuleFields, RuleFilter, RuleResponse, Severity,
    UpdateRuleRequest, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{
    Json, Query, choice_field, validate_range, validate_required, MAX_NAME_LENGTH,
};

const TABLE: &str = "rules";
const MAX_CONDITIONS: usize = 50;
const MAX_CATEGORY_LENGTH: usize = 50;

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<Rule, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Rule not found"))
}

fn check_conditions(errors: &mut ValidationErrorBuilder, conditions: &[Condition]) {
    if conditions.is_empty() {
        errors.add("conditions", "At least one condition is required");
    }
    if conditions.len() > MAX_CONDITIONS {
        errors.add(
            "conditions",
            format!("At most {} conditions are allowed", MAX_CONDITIONS),
        );
    }
    for (i, condition) in conditions.iter().enumerate() {
        if condition.field.trim().is_empty() {
            errors.add("conditions", format!("Condition {} has no field", i));
        }
        if condition.operator == Operator::In && !condition.value.is_array() {
            errors.add(
                "conditions",
                format!("Condition {} uses 'in' and needs an array value", i),
            );
        }
    }
}

fn check_priority(errors: &mut ValidationErrorBuilder, priority: Option<i64>) {
    if let Some(p) = priority {
        if let Err(e) = validate_range(p, MIN_PRIORITY, MAX_PRIORITY, "Priority") {
            errors.add("priority", e);
        }
    }
}

fn check_category(errors: &mut ValidationErrorBuilder, category: &str) {
    if let Err(e) = validate_required(category, "Category", MAX_CATEGORY_LENGTH) {
        errors.add("category", e);
    }
}

/// GET /api/rules
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<RuleFilter>,
) -> Result<Json<Paginated<RuleResponse>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("category", filter.category.as_deref())
        .eq("severity", filter.severity.as_deref())
        .flag("is_enabled", filter.enabled)
        .search(&["name", "description"], filter.search.as_deref());
    let rules: Paginated<Rule> = paginate(
        &state.db,
        TABLE,
        &where_,
        "priority DESC, created_at DESC",
        &page,
    )
    .await?;
    Ok(Json(rules.map(RuleResponse::from)))
}

/// GET /api/rules/:id
pub async fn get_rule(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<RuleResponse>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    Ok(Json(load(&state, &ctx, &id).await?.into()))
}

/// POST /api/rules
pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<RuleResponse>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_required(&req.name, "Name", MAX_NAME_LENGTH) {
        errors.add("name", e);
    }
    check_category(&mut errors, &req.category);
    let severity: Option<Severity> = choice_field(&mut errors, "severity", req.severity.as_deref());
    let match_mode: Option<MatchMode> =
        choice_field(&mut errors, "match_mode", req.match_mode.as_deref());
    check_conditions(&mut errors, &req.conditions);
    check_priority(&mut errors, req.priority);
    errors.finish()?;

    let fields = RuleFields {
        name: req.name.trim(),
        description: req.description.as_deref(),
        category: req.category.trim(),
        severity: severity.unwrap_or(Severity::Medium),
        conditions: &req.conditions,
        match_mode: match_mode.unwrap_or(MatchMode::All),
        priority: req.priority.unwrap_or(DEFAULT_PRIORITY),
        is_enabled: req.is_enabled.unwrap_or(true),
    };
    let rule = Rule::create(&state.db, &ctx.organization_id, &fields).await?;

    audit_log(
        &state,
        &ctx,
        actions::RULE_CREATE,
        resource_types::RULE,
        Some(&rule.id),
        Some(&rule.name),
        Some(json!({ "category": rule.category, "severity": rule.severity })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(rule.into())))
}

/// PUT /api/rules/:id
pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<Json<RuleResponse>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(name) = &req.name {
        if let Err(e) = validate_required(name, "Name", MAX_NAME_LENGTH) {
            errors.add("name", e);
        }
    }
    if let Some(category) = &req.category {
        check_category(&mut errors, category);
    }
    let severity: Option<Severity> = choice_field(&mut errors, "severity", req.severity.as_deref());
    let match_mode: Option<MatchMode> =
        choice_field(&mut errors, "match_mode", req.match_mode.as_deref());
    if let Some(conditions) = &req.conditions {
        check_conditions(&mut errors, conditions);
    }
    check_priority(&mut errors, req.priority);
    errors.finish()?;

    let existing = load(&state, &ctx, &id).await?;
    let existing_conditions = existing.condition_list();
    let existing_severity = existing.severity.parse().unwrap_or(Severity::Medium);

    let fields = RuleFields {
        name: req.name.as_deref().map(str::trim).unwrap_or(&existing.name),
        description: req
            .description
            .as_deref()
            .or(existing.description.as_deref()),
        category: req
            .category
            .as_deref()
            .map(str::trim)
            .unwrap_or(&existing.category),
        severity: severity.unwrap_or(existing_severity),
        conditions: req.conditions.as_deref().unwrap_or(&existing_conditions),
        match_mode: match_mode.unwrap_or_else(|| existing.match_mode_enum()),
        priority: req.priority.unwrap_or(existing.priority),
        is_enabled: req.is_enabled.unwrap_or(existing.is_enabled),
    };
    let rule = Rule::save(&state.db, &ctx.organization_id, &id, &fields)
        .await?
        .ok_or_else(|| ApiError::not_found("Rule not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::RULE_UPDATE,
        resource_types::RULE,
        Some(&rule.id),
        Some(&rule.name),
        None,
    )
    .await;

    Ok(Json(rule.into()))
}

/// DELETE /api/rules/:id
pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let rule = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::RULE_DELETE,
        resource_types::RULE,
        Some(&rule.id),
        Some(&rule.name),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/rules/:id/toggle
pub async fn toggle_rule(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<RuleResponse>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let rule = Rule::toggle(&state.db, &ctx.organization_id, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("Rule not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::RULE_TOGGLE,
        resource_types::RULE,
        Some(&rule.id),
        Some(&rule.name),
        Some(json!({ "is_enabled": rule.is_enabled })),
    )
    .await;

    Ok(Json(rule.into()))
}

/// POST /api/rules/:id/evaluate
pub async fn evaluate_rule(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<EvaluateRuleRequest>,
) -> Result<Json<RuleEvaluation>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    if !matches!(req.context, Value::Object(_) | Value::Null) {
        return Err(ApiError::validation_field(
            "context",
            "Context must be a JSON object",
        ));
    }

    let rule = load(&state, &ctx, &id).await?;
    Ok(Json(rule.evaluate(&req.context)))
}
