//! Caller's organization and its users.

use axum::{
    extract::State,
    http::StatusCode,
};
use std::sync::Arc;

use crate::db::query::{paginate, Filter, PageQuery, Paginated};
use crate::db::{
    actions, resource_types, CreateUserRequest, NewUser, OrgRole, Organization, User,
    UserFilter, UserResponse,
};
use crate::AppState;

use super::audit::audit_log;
use super::auth::{hash_password, validate_password_strength, OrgContext};
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{Json, Query, validate_email, validate_required, MAX_NAME_LENGTH};

/// GET /api/organization
pub async fn get_organization(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
) -> Result<Json<Organization>, ApiError> {
    ctx.require(OrgRole::Viewer)?;
    let org = Organization::find(&state.db, &ctx.organization_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Organization not found"))?;
    Ok(Json(org))
}

/// GET /api/users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(page): Query<PageQuery>,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Paginated<UserResponse>>, ApiError> {
    ctx.require(OrgRole::Viewer)?;

    let where_ = Filter::for_org(&ctx.organization_id)
        .eq("role", filter.role.as_deref())
        .search(&["name", "email"], filter.search.as_deref());
    let users: Paginated<User> =
        paginate(&state.db, "users", &where_, "created_at DESC", &page).await?;

    Ok(Json(users.map(UserResponse::from)))
}

/// Validate and insert a user into `organization_id`.
///
/// `granter` is the role of the caller; a user can never be given a role
/// above it. Platform admins pass `None`.
pub(crate) async fn create_member(
    state: &AppState,
    organization_id: &str,
    req: &CreateUserRequest,
    granter: Option<OrgRole>,
) -> Result<User, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_email(&req.email) {
        errors.add("email", e);
    }
    if let Err(e) = validate_required(&req.name, "Name", MAX_NAME_LENGTH) {
        errors.add("name", e);
    }
    if let Some(e) = validate_password_strength(&req.password) {
        errors.add("password", e);
    }
    let role = match req.role.as_deref() {
        None => OrgRole::Member,
        Some(r) => match r.parse::<OrgRole>() {
            Ok(role) => role,
            Err(_) => {
                errors.add("role", "Invalid role. Must be one of: owner, admin, member, viewer");
                OrgRole::Viewer
            }
        },
    };
    errors.finish()?;

    if let Some(granter) = granter {
        if role.level() > granter.level() {
            return Err(ApiError::forbidden(format!(
                "Cannot grant the {} role with {} permissions",
                role, granter
            )));
        }
    }

    if User::find_by_email(&state.db, &req.email).await?.is_some() {
        return Err(ApiError::conflict("A user with this email already exists"));
    }

    let password_hash = hash_password(&req.password).map_err(|e| {
        tracing::error!("Failed to hash password: {}", e);
        ApiError::internal("Failed to create user")
    })?;

    let user = User::create(
        &state.db,
        &NewUser {
            organization_id: Some(organization_id),
            email: &req.email,
            name: req.name.trim(),
            password_hash: &password_hash,
            role,
            is_platform_admin: false,
        },
    )
    .await?;

    tracing::info!(
        organization_id = %organization_id,
        user_id = %user.id,
        role = %role,
        "Created user"
    );
    Ok(user)
}

/// POST /api/users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    ctx.require(OrgRole::Admin)?;

    let granter = (!ctx.user.is_platform_admin).then_some(ctx.role);
    let user = create_member(&state, &ctx.organization_id, &req, granter).await?;

    audit_log(
        &state,
        &ctx,
        actions::USER_CREATE,
        resource_types::USER,
        Some(&user.id),
        Some(&user.email),
        Some(serde_json::json!({ "role": user.role })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

