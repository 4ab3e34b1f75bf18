//! Authentication, sessions and organization context.
//!
//! Requests authenticate with `Authorization: Bearer <token>` or `X-API-Key`.
//! A token is either the configured admin token or a session token issued by
//! `POST /api/auth/login`; only the SHA-256 of session tokens is stored.

use anyhow::Context;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{request::Parts, HeaderMap, StatusCode},
};
use chrono::{Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::{AuthConfig, Config};
use crate::db::{
    actions, resource_types, AuditEntry, LoginRequest, LoginResponse, NewUser, OrgRole,
    Organization, Session, User, UserResponse,
};
use crate::utils::format_timestamp;
use crate::{AppState, DbPool};

use super::audit::{record, ClientIp};
use super::error::ApiError;
use super::rate_limit::client_ip;
use super::validation::Json;

/// Header platform admins use to act within an organization
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// Id of the synthetic user behind the admin token
pub const SYSTEM_USER_ID: &str = "system";

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt_bytes: [u8; 16] = rand::rng().random();
    let salt = SaltString::encode_b64(&salt_bytes)?;
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// 32 random bytes, hex encoded
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

/// Hash a token for storage
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate password strength
/// Returns None if valid, or Some(error_message) if invalid
pub fn validate_password_strength(password: &str) -> Option<String> {
    if password.chars().count() < 12 {
        return Some("Password must be at least 12 characters".to_string());
    }

    let has_uppercase = password.chars().any(|c| c.is_uppercase());
    let has_lowercase = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_alphanumeric());

    if !has_uppercase {
        return Some("Password must contain at least one uppercase letter".to_string());
    }
    if !has_lowercase {
        return Some("Password must contain at least one lowercase letter".to_string());
    }
    if !has_digit {
        return Some("Password must contain at least one digit".to_string());
    }
    if !has_special {
        return Some("Password must contain at least one special character".to_string());
    }

    let common_passwords = [
        "password123!", "admin123!@#", "welcome123!", "qwerty123!@#", "changeme123!",
        "letmein123!@",
    ];
    let lower = password.to_lowercase();
    if common_passwords.iter().any(|common| lower.contains(common)) {
        return Some("Password is too common. Please choose a stronger password.".to_string());
    }

    None
}

/// Constant-time comparison against the configured admin token
fn is_admin_token(config: &Config, token: &str) -> bool {
    let admin_token = config.auth.admin_token.as_bytes();
    let provided = token.as_bytes();
    !admin_token.is_empty()
        && admin_token.len() == provided.len()
        && admin_token.ct_eq(provided).into()
}

/// Extract the token from request headers
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth_header) = headers.get("Authorization").and_then(|h| h.to_str().ok()) {
        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    headers
        .get("X-API-Key")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn system_user() -> User {
    let now = crate::utils::now();
    User {
        id: SYSTEM_USER_ID.to_string(),
        organization_id: None,
        email: "system@tenantdesk.local".to_string(),
        name: "System Admin".to_string(),
        password_hash: String::new(),
        role: OrgRole::Owner.to_string(),
        is_platform_admin: true,
        created_at: now.clone(),
        updated_at: now,
    }
}

/// Resolve the user behind a token
pub async fn get_current_user(db: &DbPool, config: &Config, token: &str) -> Result<User, ApiError> {
    if is_admin_token(config, token) {
        return Ok(system_user());
    }

    let session = Session::find_valid(db, &hash_token(token))
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

    User::find(db, &session.user_id)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))
}

/// Extractor for the authenticated user
#[async_trait]
impl FromRequestParts<Arc<AppState>> for User {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
        get_current_user(&state.db, &state.config, &token).await
    }
}

/// The caller plus the organization the request acts within.
///
/// Ordinary users are bound to their own organization. Platform admins pick
/// one with `X-Organization-Id` and act as owners there.
#[derive(Debug, Clone)]
pub struct OrgContext {
    pub user: User,
    pub organization_id: String,
    pub role: OrgRole,
    pub ip_address: String,
}

impl OrgContext {
    /// Require at least `required` within the organization
    pub fn require(&self, required: OrgRole) -> Result<(), ApiError> {
        require_role(self.role, required)
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

pub fn require_role(role: OrgRole, required: OrgRole) -> Result<(), ApiError> {
    if !role.has_at_least(required) {
        return Err(ApiError::forbidden(format!(
            "This action requires {} role or higher",
            required
        )));
    }
    Ok(())
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for OrgContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user = User::from_request_parts(parts, state).await?;
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let ip_address = client_ip(&parts.headers, peer).to_string();

        let requested = parts
            .headers
            .get(ORGANIZATION_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let (organization_id, role) = if user.is_platform_admin {
            match requested.or(user.organization_id.as_deref()) {
                Some(org_id) => {
                    let org = Organization::find(&state.db, org_id)
                        .await?
                        .ok_or_else(|| ApiError::not_found("Organization not found"))?;
                    (org.id, OrgRole::Owner)
                }
                None => {
                    return Err(ApiError::bad_request(
                        "No organization context. Send the X-Organization-Id header",
                    ))
                }
            }
        } else {
            let org_id = user
                .organization_id
                .clone()
                .ok_or_else(|| ApiError::bad_request("User does not belong to an organization"))?;
            let org = Organization::find(&state.db, &org_id)
                .await?
                .ok_or_else(|| ApiError::not_found("Organization not found"))?;
            if !org.is_active() {
                return Err(ApiError::forbidden("Organization is suspended"));
            }
            (org.id, user.role_enum())
        };

        Ok(OrgContext {
            user,
            organization_id,
            role,
            ip_address,
        })
    }
}

/// Extractor for platform-admin-only endpoints
#[derive(Debug, Clone)]
pub struct PlatformAdmin(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for PlatformAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user = User::from_request_parts(parts, state).await?;
        if !user.is_platform_admin {
            return Err(ApiError::forbidden("Platform admin access required"));
        }
        Ok(PlatformAdmin(user))
    }
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = User::find_by_email(&state.db, &request.email)
        .await?
        .filter(|u| verify_password(&request.password, &u.password_hash))
        .ok_or_else(|| {
            tracing::info!(ip = %ip, "Failed login attempt");
            ApiError::unauthorized("Invalid credentials")
        })?;

    let token = generate_token();
    let ttl = Duration::hours(state.config.auth.session_ttl_hours.max(1));
    let expires_at = format_timestamp(Utc::now() + ttl);
    Session::create(&state.db, &user.id, &hash_token(&token), &expires_at).await?;

    record(
        &state,
        &AuditEntry {
            organization_id: user.organization_id.as_deref(),
            action: actions::AUTH_LOGIN,
            resource_type: resource_types::SESSION,
            resource_name: Some(&user.email),
            user_id: Some(&user.id),
            ip_address: Some(&ip),
            ..Default::default()
        },
    )
    .await;

    tracing::info!(user_id = %user.id, "User logged in");

    Ok(Json(LoginResponse {
        token,
        expires_at,
        user: UserResponse::from(user),
    }))
}

/// POST /api/auth/logout - revokes the presented session token
pub async fn logout(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    user: User,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = extract_token(&headers)
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    if !is_admin_token(&state.config, &token) {
        Session::revoke(&state.db, &hash_token(&token)).await?;
        record(
            &state,
            &AuditEntry {
                organization_id: user.organization_id.as_deref(),
                action: actions::AUTH_LOGOUT,
                resource_type: resource_types::SESSION,
                user_id: Some(&user.id),
                ip_address: Some(&ip),
                ..Default::default()
            },
        )
        .await;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/auth/me
pub async fn me(user: User) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

/// Create a platform admin without an organization
pub async fn create_platform_admin(
    db: &DbPool,
    email: &str,
    name: &str,
    password: &str,
) -> anyhow::Result<User> {
    if let Some(problem) = validate_password_strength(password) {
        anyhow::bail!(problem);
    }
    if let Err(problem) = super::validation::validate_email(email) {
        anyhow::bail!(problem);
    }

    let password_hash = hash_password(password)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;

    let user = User::create(
        db,
        &NewUser {
            organization_id: None,
            email,
            name,
            password_hash: &password_hash,
            role: OrgRole::Owner,
            is_platform_admin: true,
        },
    )
    .await
    .context("Failed to create platform admin")?;

    Ok(user)
}

/// Create the configured bootstrap admin when the database has no users
pub async fn ensure_bootstrap_admin(db: &DbPool, config: &AuthConfig) -> anyhow::Result<Option<User>> {
    let (email, password) = match (&config.bootstrap_email, &config.bootstrap_password) {
        (Some(email), Some(password)) => (email, password),
        _ => return Ok(None),
    };

    if User::count(db).await? > 0 {
        return Ok(None);
    }

    let user = create_platform_admin(db, email, "Platform Admin", password).await?;
    tracing::info!(email = %user.email, "Created bootstrap platform admin");
    Ok(Some(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("Correct-Horse-42").unwrap();
        assert!(verify_password("Correct-Horse-42", &hash));
        assert!(!verify_password("correct-horse-42", &hash));
        assert!(!verify_password("anything", "not-a-hash"));

        // Fresh salt per hash
        let again = hash_password("Correct-Horse-42").unwrap();
        assert_ne!(hash, again);
        assert!(hash.starts_with("$argon2id$"));
    }

    #[test]
    fn test_token_generation() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(hash_token(&a), hash_token(&a));
        assert_ne!(hash_token(&a), a);
    }

    #[test]
    fn test_password_strength() {
        assert!(validate_password_strength("Sh0rt!").is_some());
        assert!(validate_password_strength("alllowercase123!").is_some());
        assert!(validate_password_strength("ALLUPPERCASE123!").is_some());
        assert!(validate_password_strength("NoDigitsHere!!").is_some());
        assert!(validate_password_strength("NoSpecials1234").is_some());
        assert!(validate_password_strength("Tr1cky-Lantern-Sky").is_none());
        assert!(validate_password_strength("xxPassword123!xx").is_some());
    }

    #[test]
    fn test_extract_token() {
        let mut headers = HeaderMap::new();
        assert!(extract_token(&headers).is_none());

        headers.insert("X-API-Key", HeaderValue::from_static("key-123"));
        assert_eq!(extract_token(&headers).as_deref(), Some("key-123"));

        headers.insert("Authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_token(&headers).as_deref(), Some("abc"));

        headers.insert("Authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers).as_deref(), Some("key-123"));
    }

    #[test]
    fn test_require_role() {
        assert!(require_role(OrgRole::Admin, OrgRole::Member).is_ok());
        let err = require_role(OrgRole::Viewer, OrgRole::Member).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_admin_token_match() {
        let mut config = Config::default();
        config.auth.admin_token = "s3cret-admin-token".to_string();
        assert!(is_admin_token(&config, "s3cret-admin-token"));
        assert!(!is_admin_token(&config, "s3cret-admin-tokeN"));
        assert!(!is_admin_token(&config, "short"));

        config.auth.admin_token = String::new();
        assert!(!is_admin_token(&config, ""));
    }

    #[tokio::test]
    async fn test_bootstrap_admin_only_on_empty_database() {
        let db = crate::db::init_memory().await.unwrap();
        let config = AuthConfig {
            bootstrap_email: Some("root@acme.io".to_string()),
            bootstrap_password: Some("Bootstrap-Pass-1".to_string()),
            ..AuthConfig::default()
        };

        let created = ensure_bootstrap_admin(&db, &config).await.unwrap().unwrap();
        assert!(created.is_platform_admin);
        assert!(created.organization_id.is_none());

        assert!(ensure_bootstrap_admin(&db, &config).await.unwrap().is_none());
        assert_eq!(User::count(&db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_weak_bootstrap_password_is_rejected() {
        let db = crate::db::init_memory().await.unwrap();
        let err = create_platform_admin(&db, "root@acme.io", "Root", "weak")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("12 characters"));
    }
}
