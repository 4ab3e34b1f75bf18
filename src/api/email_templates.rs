//! Email template endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, resource_types, CreateEmailTemplateRequest, EmailTemplate, EmailTemplateFilter,
    EmailTemplateResponse, OrgRole, PreviewRequest, RenderedEmail, TemplateCategory,
    UpdateEmailTemplateRequest,
};
use crate::utils::slugify;
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{unique_conflict, ApiError, ValidationErrorBuilder};
use super::validation::{
    Json, Query, choice_field, validate_required, validate_slug, MAX_NAME_LENGTH,
};

const TABLE: &str = "email_templates";
const MAX_SUBJECT_LENGTH: usize = 500;

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<EmailTemplate, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Email template not found"))
}

/// GET /api/email-templates
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<EmailTemplateFilter>,
) -> Result<Json<Paginated<EmailTemplateResponse>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("category", filter.category.as_deref())
        .flag("is_active", filter.is_active)
        .search(&["name", "slug", "subject"], filter.search.as_deref());
    let templates: Paginated<EmailTemplate> =
        paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(templates.map(EmailTemplateResponse::from)))
}

/// GET /api/email-templates/:id
pub async fn get_template(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<EmailTemplateResponse>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    let template = load(&state, &ctx, &id).await?;
    Ok(Json(template.into()))
}

/// POST /api/email-templates
pub async fn create_template(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateEmailTemplateRequest>,
) -> Result<(StatusCode, Json<EmailTemplateResponse>), ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_required(&req.name, "Name", MAX_NAME_LENGTH) {
        errors.add("name", e);
    }
    let slug = match req.slug.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => slugify(&req.name),
    };
    if let Err(e) = validate_slug(&slug) {
        errors.add("slug", e);
    }
    if let Err(e) = validate_required(&req.subject, "Subject", MAX_SUBJECT_LENGTH) {
        errors.add("subject", e);
    }
    if req.body_html.trim().is_empty() {
        errors.add("body_html", "HTML body is required");
    }
    let category: Option<TemplateCategory> =
        choice_field(&mut errors, "category", req.category.as_deref());
    errors.finish()?;

    let template = EmailTemplate::create(
        &state.db,
        &ctx.organization_id,
        &req,
        &slug,
        category.unwrap_or(TemplateCategory::Transactional),
    )
    .await
    .map_err(unique_conflict(format!(
        "An email template with slug '{}' already exists",
        slug
    )))?;

    audit_log(
        &state,
        &ctx,
        actions::EMAIL_TEMPLATE_CREATE,
        resource_types::EMAIL_TEMPLATE,
        Some(&template.id),
        Some(&template.name),
        Some(json!({ "slug": template.slug })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(template.into())))
}

/// PUT /api/email-templates/:id
pub async fn update_template(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateEmailTemplateRequest>,
) -> Result<Json<EmailTemplateResponse>, ApiError> {
    ctx.require(OrgRole::Member)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(name) = &req.name {
        if let Err(e) = validate_required(name, "Name", MAX_NAME_LENGTH) {
            errors.add("name", e);
        }
    }
    if let Some(subject) = &req.subject {
        if let Err(e) = validate_required(subject, "Subject", MAX_SUBJECT_LENGTH) {
            errors.add("subject", e);
        }
    }
    if matches!(&req.body_html, Some(html) if html.trim().is_empty()) {
        errors.add("body_html", "HTML body cannot be empty");
    }
    let category: Option<TemplateCategory> =
        choice_field(&mut errors, "category", req.category.as_deref());
    errors.finish()?;

    let existing = load(&state, &ctx, &id).await?;
    let template = EmailTemplate::save(&state.db, existing, &req, category).await?;

    audit_log(
        &state,
        &ctx,
        actions::EMAIL_TEMPLATE_UPDATE,
        resource_types::EMAIL_TEMPLATE,
        Some(&template.id),
        Some(&template.name),
        None,
    )
    .await;

    Ok(Json(template.into()))
}

/// DELETE /api/email-templates/:id
pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let template = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::EMAIL_TEMPLATE_DELETE,
        resource_types::EMAIL_TEMPLATE,
        Some(&template.id),
        Some(&template.name),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/email-templates/:id/preview
pub async fn preview_template(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<PreviewRequest>,
) -> Result<Json<RenderedEmail>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let template = load(&state, &ctx, &id).await?;
    let rendered = template.render(&req.variables).map_err(|missing| {
        let mut details = HashMap::new();
        details.insert("missing".to_string(), json!(missing));
        ApiError::bad_request(format!("Missing template variables: {}", missing.join(", ")))
            .with_details(details)
    })?;

    Ok(Json(rendered))
}
