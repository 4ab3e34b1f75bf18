//! Input validation for API requests.
//!
//! Validators return `Err(message)` so handlers can collect several of them
//! into a `ValidationErrorBuilder` and answer with one 400 listing every field.
//!
//! `Json` and `Query` wrap the axum extractors so malformed input renders as
//! the standard `validation_error` envelope instead of axum's plain-text rejection.

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, FromRequestParts, Request},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::str::FromStr;

use crate::db::TextEnum;

use super::error::{ApiError, ValidationErrorBuilder};

lazy_static! {
    /// Simple email shape check (local@domain.tld)
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$"
    ).unwrap();

    /// Lowercase alphanumeric with dashes, starting and ending with alphanumeric
    static ref SLUG_REGEX: Regex = Regex::new(
        r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$"
    ).unwrap();

    /// Semantic version with optional `v` prefix and pre-release suffix
    static ref SEMVER_REGEX: Regex = Regex::new(
        r"^v?\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?$"
    ).unwrap();

    static ref FLAG_KEY_REGEX: Regex = Regex::new(
        r"^[a-z0-9][a-z0-9_.-]*$"
    ).unwrap();

    /// http(s) URL with a host and optional port and path
    static ref HTTP_URL_REGEX: Regex = Regex::new(
        r"^https?://[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?(:\d{1,5})?(/\S*)?$"
    ).unwrap();
}

pub const MAX_NAME_LENGTH: usize = 200;
pub const MAX_SLUG_LENGTH: usize = 63;
pub const MAX_FLAG_KEY_LENGTH: usize = 100;
pub const MAX_URL_LENGTH: usize = 2048;

/// Non-blank text of bounded length
pub fn validate_required(value: &str, label: &str, max: usize) -> Result<(), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{} is required", label));
    }
    if trimmed.chars().count() > max {
        return Err(format!("{} is too long (max {} characters)", label, max));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), String> {
    let email = email.trim();
    if email.is_empty() {
        return Err("Email is required".to_string());
    }
    if email.len() > 254 || !EMAIL_REGEX.is_match(email) {
        return Err("Invalid email address".to_string());
    }
    Ok(())
}

pub fn validate_slug(slug: &str) -> Result<(), String> {
    if slug.is_empty() {
        return Err("Slug is required".to_string());
    }
    if slug.len() > MAX_SLUG_LENGTH {
        return Err(format!(
            "Slug is too long (max {} characters)",
            MAX_SLUG_LENGTH
        ));
    }
    if !SLUG_REGEX.is_match(slug) {
        return Err(
            "Slug must be lowercase alphanumeric with dashes, starting and ending with alphanumeric"
                .to_string(),
        );
    }
    Ok(())
}

pub fn validate_semver(version: &str) -> Result<(), String> {
    if !SEMVER_REGEX.is_match(version.trim()) {
        return Err("Version must look like 1.2.3, v1.2.3 or 1.2.3-beta.1".to_string());
    }
    Ok(())
}

pub fn validate_flag_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Key is required".to_string());
    }
    if key.len() > MAX_FLAG_KEY_LENGTH {
        return Err(format!(
            "Key is too long (max {} characters)",
            MAX_FLAG_KEY_LENGTH
        ));
    }
    if !FLAG_KEY_REGEX.is_match(key) {
        return Err(
            "Key must start with a lowercase letter or digit and contain only a-z, 0-9, '_', '.' or '-'"
                .to_string(),
        );
    }
    Ok(())
}

/// Webhook targets must be plain http(s) URLs
pub fn validate_http_url(url: &str) -> Result<(), String> {
    let url = url.trim();
    if url.is_empty() {
        return Err("URL is required".to_string());
    }
    if url.len() > MAX_URL_LENGTH {
        return Err(format!("URL is too long (max {} characters)", MAX_URL_LENGTH));
    }
    if !HTTP_URL_REGEX.is_match(url) {
        return Err("URL must be an http:// or https:// address".to_string());
    }
    Ok(())
}

/// Inclusive integer range
pub fn validate_range(value: i64, min: i64, max: i64, label: &str) -> Result<(), String> {
    if value < min || value > max {
        return Err(format!("{} must be between {} and {}", label, min, max));
    }
    Ok(())
}

/// Score in 0..=100
pub fn validate_score(value: f64, label: &str) -> Result<(), String> {
    if !(0.0..=100.0).contains(&value) {
        return Err(format!("{} must be between 0 and 100", label));
    }
    Ok(())
}

/// Parse an RFC 3339 timestamp into storage format
pub fn parse_timestamp_field(value: &str, label: &str) -> Result<String, String> {
    crate::utils::normalize_timestamp(value)
        .ok_or_else(|| format!("{} must be an RFC 3339 timestamp", label))
}

/// Parse a stored-text enum, listing the accepted values on failure
pub fn parse_choice<T>(value: &str, label: &str) -> Result<T, String>
where
    T: TextEnum + FromStr,
{
    value
        .parse::<T>()
        .map_err(|_| format!("Invalid {}. Must be one of: {}", label, T::expected()))
}

/// Parse an optional enum field, recording a validation error on failure
pub fn choice_field<T>(
    errors: &mut ValidationErrorBuilder,
    field: &str,
    value: Option<&str>,
) -> Option<T>
where
    T: TextEnum + FromStr,
{
    match parse_choice::<T>(value?, field) {
        Ok(v) => Some(v),
        Err(e) => {
            errors.add(field, e);
            None
        }
    }
}

/// Parse an optional timestamp field, recording a validation error on failure
pub fn timestamp_field(
    errors: &mut ValidationErrorBuilder,
    field: &str,
    value: Option<&str>,
) -> Option<String> {
    match parse_timestamp_field(value?, field) {
        Ok(ts) => Some(ts),
        Err(e) => {
            errors.add(field, e);
            None
        }
    }
}

/// JSON body extractor and response. An empty body deserializes as `{}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for Json<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;

        let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &body
        };

        let axum::Json(value) = axum::Json::<T>::from_bytes(body)?;
        Ok(Json(value))
    }
}

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

/// Query string extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct Query<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for Query<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Query(value) =
            axum::extract::Query::<T>::from_request_parts(parts, state).await?;
        Ok(Query(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::db::{ReleaseStatus, Severity};
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Note {
        #[serde(default)]
        text: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct Required {
        #[allow(dead_code)]
        name: String,
    }

    fn json_request(body: &'static str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_json_empty_body_uses_defaults() {
        let Json(note) = Json::<Note>::from_request(json_request(""), &()).await.unwrap();
        assert!(note.text.is_none());

        let Json(note) = Json::<Note>::from_request(json_request(r#"{"text":"ok"}"#), &())
            .await
            .unwrap();
        assert_eq!(note.text.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_json_rejections_are_validation_errors() {
        let err = Json::<Required>::from_request(json_request("{}"), &())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = Json::<Note>::from_request(json_request("{not json"), &())
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_query_rejection_is_validation_error() {
        #[derive(Debug, Deserialize)]
        struct Paging {
            #[allow(dead_code)]
            page: Option<i64>,
        }

        let (mut parts, _) = axum::http::Request::builder()
            .uri("/?page=abc")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let err = Query::<Paging>::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn test_validate_required() {
        assert!(validate_required("Quarterly review", "Name", 200).is_ok());
        assert!(validate_required("   ", "Name", 200).is_err());
        assert!(validate_required(&"x".repeat(201), "Name", 200).is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ops@acme.io").is_ok());
        assert!(validate_email("first.last+tag@sub.example.com").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("a@b").is_err());
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("acme").is_ok());
        assert!(validate_slug("welcome-email-2").is_ok());
        assert!(validate_slug("-acme").is_err());
        assert!(validate_slug("Acme").is_err());
        assert!(validate_slug("acme_corp").is_err());
        assert!(validate_slug(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_semver() {
        assert!(validate_semver("1.2.3").is_ok());
        assert!(validate_semver("v10.0.1").is_ok());
        assert!(validate_semver("2.0.0-rc.1").is_ok());
        assert!(validate_semver("1.2").is_err());
        assert!(validate_semver("1.2.3.4").is_err());
        assert!(validate_semver("latest").is_err());
    }

    #[test]
    fn test_validate_flag_key() {
        assert!(validate_flag_key("new-dashboard").is_ok());
        assert!(validate_flag_key("billing.v2_beta").is_ok());
        assert!(validate_flag_key("_hidden").is_err());
        assert!(validate_flag_key("New").is_err());
        assert!(validate_flag_key(&"a".repeat(101)).is_err());
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("https://hooks.acme.io/tenantdesk").is_ok());
        assert!(validate_http_url("http://127.0.0.1:9000/hook?x=1").is_ok());
        assert!(validate_http_url("ftp://acme.io").is_err());
        assert!(validate_http_url("https://").is_err());
        assert!(validate_http_url("").is_err());
    }

    #[test]
    fn test_numeric_ranges() {
        assert!(validate_range(0, 0, 100, "Rollout").is_ok());
        assert!(validate_range(101, 0, 100, "Rollout").is_err());
        assert!(validate_score(100.0, "Score").is_ok());
        assert!(validate_score(-0.5, "Score").is_err());
        assert!(validate_score(f64::NAN, "Score").is_err());
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice::<Severity>("HIGH", "severity"), Ok(Severity::High));
        let err = parse_choice::<ReleaseStatus>("live", "status").unwrap_err();
        assert_eq!(
            err,
            "Invalid status. Must be one of: draft, published, archived"
        );
    }

    #[test]
    fn test_choice_field_collects_errors() {
        let mut errors = ValidationErrorBuilder::new();
        assert_eq!(
            choice_field::<Severity>(&mut errors, "severity", Some("low")),
            Some(Severity::Low)
        );
        assert_eq!(choice_field::<Severity>(&mut errors, "severity", None), None);
        assert!(errors.is_empty());
        assert_eq!(choice_field::<Severity>(&mut errors, "severity", Some("meh")), None);
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_parse_timestamp_field() {
        assert_eq!(
            parse_timestamp_field("2025-01-01T00:00:00Z", "expires_at").unwrap(),
            "2025-01-01T00:00:00.000Z"
        );
        assert!(parse_timestamp_field("tomorrow", "expires_at").is_err());
    }
}
