//! Outbound webhook endpoints.
//!
//! Secrets are only ever returned by create and rotate-secret; every other
//! response omits them.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use std::sync::Arc;

use crate::db::query::{delete_scoped, find_scoped, paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, events, resource_types, CreateWebhookRequest, DeliveryFilter, OrgRole,
    UpdateWebhookRequest, Webhook, WebhookDelivery, WebhookFilter, WebhookResponse,
};
use crate::AppState;

use super::audit::audit_log;
use super::auth::OrgContext;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{Json, Query, validate_http_url};

const TABLE: &str = "webhooks";

async fn load(state: &AppState, ctx: &OrgContext, id: &str) -> Result<Webhook, ApiError> {
    find_scoped(&state.db, TABLE, &ctx.organization_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Webhook not found"))
}

fn check_events(errors: &mut ValidationErrorBuilder, list: &[String]) {
    if list.is_empty() {
        errors.add("events", "Subscribe to at least one event");
        return;
    }
    let unknown: Vec<&str> = list
        .iter()
        .map(String::as_str)
        .filter(|e| !events::is_known(e))
        .collect();
    if !unknown.is_empty() {
        errors.add(
            "events",
            format!(
                "Unknown events: {}. Must be '*' or one of: {}",
                unknown.join(", "),
                events::ALL.join(", ")
            ),
        );
    }
}

/// GET /api/webhooks
pub async fn list_webhooks(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<WebhookFilter>,
) -> Result<Json<Paginated<WebhookResponse>>, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .flag("is_active", filter.is_active)
        .search(&["url", "description"], filter.search.as_deref());
    let hooks: Paginated<Webhook> =
        paginate(&state.db, TABLE, &where_, "created_at DESC", &page).await?;
    Ok(Json(hooks.map(WebhookResponse::from)))
}

/// GET /api/webhooks/:id
pub async fn get_webhook(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<WebhookResponse>, ApiError> {
    ctx.require(OrgRole::Admin)?;
    Ok(Json(load(&state, &ctx, &id).await?.into()))
}

/// POST /api/webhooks
pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    ctx.require(OrgRole::Admin)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_http_url(&req.url) {
        errors.add("url", e);
    }
    check_events(&mut errors, &req.events);
    errors.finish()?;

    let hook = Webhook::create(&state.db, &ctx.organization_id, &req).await?;

    audit_log(
        &state,
        &ctx,
        actions::WEBHOOK_CREATE,
        resource_types::WEBHOOK,
        Some(&hook.id),
        Some(&hook.url),
        Some(json!({ "events": req.events })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(WebhookResponse::with_secret(hook))))
}

/// PUT /api/webhooks/:id
pub async fn update_webhook(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateWebhookRequest>,
) -> Result<Json<WebhookResponse>, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(url) = &req.url {
        if let Err(e) = validate_http_url(url) {
            errors.add("url", e);
        }
    }
    if let Some(list) = &req.events {
        check_events(&mut errors, list);
    }
    errors.finish()?;

    let hook = Webhook::update(&state.db, &ctx.organization_id, &id, &req)
        .await?
        .ok_or_else(|| ApiError::not_found("Webhook not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::WEBHOOK_UPDATE,
        resource_types::WEBHOOK,
        Some(&hook.id),
        Some(&hook.url),
        req.is_active.map(|active| json!({ "is_active": active })),
    )
    .await;

    Ok(Json(hook.into()))
}

/// DELETE /api/webhooks/:id
pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let hook = load(&state, &ctx, &id).await?;
    delete_scoped(&state.db, TABLE, &ctx.organization_id, &id).await?;

    audit_log(
        &state,
        &ctx,
        actions::WEBHOOK_DELETE,
        resource_types::WEBHOOK,
        Some(&hook.id),
        Some(&hook.url),
        None,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/webhooks/:id/rotate-secret
pub async fn rotate_secret(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<WebhookResponse>, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let hook = Webhook::rotate_secret(&state.db, &ctx.organization_id, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("Webhook not found"))?;

    audit_log(
        &state,
        &ctx,
        actions::WEBHOOK_ROTATE_SECRET,
        resource_types::WEBHOOK,
        Some(&hook.id),
        Some(&hook.url),
        None,
    )
    .await;

    Ok(Json(WebhookResponse::with_secret(hook)))
}

/// POST /api/webhooks/:id/test - deliver a `webhook.test` event and wait for
/// the outcome
pub async fn test_webhook(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
) -> Result<Json<WebhookDelivery>, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let hook = load(&state, &ctx, &id).await?;
    let data = json!({
        "webhook_id": hook.id,
        "message": "This is a test event",
        "triggered_by": ctx.user_id(),
    });
    let delivery = state
        .dispatcher
        .deliver(&hook, events::WEBHOOK_TEST, &data)
        .await?;

    Ok(Json(delivery))
}

/// GET /api/webhooks/:id/deliveries
pub async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
    Query(filter): Query<DeliveryFilter>,
) -> Result<Json<Paginated<WebhookDelivery>>, ApiError> {
    ctx.require(OrgRole::Admin)?;

    let hook = load(&state, &ctx, &id).await?;
    let where_ = Filter::for_org(&ctx.organization_id)
        .eq_value("webhook_id", &hook.id)
        .eq("status", filter.status.as_deref())
        .eq("event", filter.event.as_deref());
    let deliveries =
        paginate(&state.db, "webhook_deliveries", &where_, "created_at DESC", &page).await?;
    Ok(Json(deliveries))
}
