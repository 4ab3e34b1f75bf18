//! Feature flags with percentage rollout.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};

use crate::db::query::find_scoped;

use super::common::{parse_string_list, serialize_string_list};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeatureFlag {
    pub id: String,
    pub organization_id: String,
    #[sqlx(rename = "flag_key")]
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub rollout_percentage: i64,
    pub allowed_subjects: String,
    pub created_at: String,
    pub updated_at: String,
}

/// API representation of a flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlagResponse {
    pub id: String,
    pub organization_id: String,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub rollout_percentage: i64,
    pub allowed_subjects: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<FeatureFlag> for FeatureFlagResponse {
    fn from(flag: FeatureFlag) -> Self {
        Self {
            enabled: flag.enabled,
            allowed_subjects: parse_string_list(&flag.allowed_subjects),
            id: flag.id,
            organization_id: flag.organization_id,
            key: flag.key,
            name: flag.name,
            description: flag.description,
            rollout_percentage: flag.rollout_percentage,
            created_at: flag.created_at,
            updated_at: flag.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateFeatureFlagRequest {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub rollout_percentage: Option<i64>,
    pub allowed_subjects: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFeatureFlagRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub rollout_percentage: Option<i64>,
    pub allowed_subjects: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeatureFlagFilter {
    pub enabled: Option<bool>,
    pub search: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EvaluateQuery {
    pub subject: Option<String>,
}

/// Why a flag evaluated the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    Disabled,
    Targeted,
    Rollout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagEvaluation {
    pub key: String,
    pub enabled: bool,
    pub reason: EvaluationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<u32>,
}

/// Stable bucket in `0..100` for a flag/subject pair.
///
/// First four bytes (big endian) of SHA-256(`key:subject`), modulo 100.
pub fn rollout_bucket(key: &str, subject: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b":");
    hasher.update(subject.as_bytes());
    let digest = hasher.finalize();
    let prefix = [digest[0], digest[1], digest[2], digest[3]];
    u32::from_be_bytes(prefix) % 100
}

impl FeatureFlag {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn subjects(&self) -> Vec<String> {
        parse_string_list(&self.allowed_subjects)
    }

    /// Whether evaluating this flag needs a subject
    pub fn needs_subject(&self) -> bool {
        self.is_enabled() && self.rollout_percentage > 0 && self.rollout_percentage < 100
    }

    /// Evaluate the flag for a subject (user id, org id, ...)
    pub fn evaluate(&self, subject: Option<&str>) -> FlagEvaluation {
        let result = |enabled, reason, bucket| FlagEvaluation {
            key: self.key.clone(),
            enabled,
            reason,
            bucket,
        };

        if !self.is_enabled() {
            return result(false, EvaluationReason::Disabled, None);
        }

        if let Some(subject) = subject {
            if self.subjects().iter().any(|s| s == subject) {
                return result(true, EvaluationReason::Targeted, None);
            }
        }

        match (self.rollout_percentage, subject) {
            (p, _) if p >= 100 => result(true, EvaluationReason::Rollout, None),
            (p, _) if p <= 0 => result(false, EvaluationReason::Rollout, None),
            (p, Some(subject)) => {
                let bucket = rollout_bucket(&self.key, subject);
                result((bucket as i64) < p, EvaluationReason::Rollout, Some(bucket))
            }
            (_, None) => result(false, EvaluationReason::Rollout, None),
        }
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        req: &CreateFeatureFlagRequest,
    ) -> Result<FeatureFlag, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();
        let subjects = serialize_string_list(req.allowed_subjects.as_deref().unwrap_or(&[]));

        sqlx::query(
            r#"
            INSERT INTO feature_flags (id, organization_id, flag_key, name, description, enabled, rollout_percentage, allowed_subjects, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(req.key.trim())
        .bind(req.name.trim())
        .bind(&req.description)
        .bind(req.enabled.unwrap_or(false))
        .bind(req.rollout_percentage.unwrap_or(100))
        .bind(&subjects)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "feature_flags", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_by_key(
        db: &SqlitePool,
        organization_id: &str,
        key: &str,
    ) -> Result<Option<FeatureFlag>, sqlx::Error> {
        sqlx::query_as::<_, FeatureFlag>(
            "SELECT * FROM feature_flags WHERE organization_id = ? AND flag_key = ?",
        )
        .bind(organization_id)
        .bind(key)
        .fetch_optional(db)
        .await
    }

    pub async fn update(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        req: &UpdateFeatureFlagRequest,
    ) -> Result<Option<FeatureFlag>, sqlx::Error> {
        let subjects = req
            .allowed_subjects
            .as_deref()
            .map(serialize_string_list);

        let result = sqlx::query(
            r#"
            UPDATE feature_flags
            SET name = COALESCE(?, name),
                description = COALESCE(?, description),
                enabled = COALESCE(?, enabled),
                rollout_percentage = COALESCE(?, rollout_percentage),
                allowed_subjects = COALESCE(?, allowed_subjects),
                updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(req.name.as_deref().map(str::trim))
        .bind(&req.description)
        .bind(req.enabled)
        .bind(req.rollout_percentage)
        .bind(&subjects)
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "feature_flags", organization_id, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(enabled: bool, rollout: i64, subjects: &[&str]) -> FeatureFlag {
        let subjects: Vec<String> = subjects.iter().map(|s| s.to_string()).collect();
        FeatureFlag {
            id: "f1".to_string(),
            organization_id: "o1".to_string(),
            key: "new-dashboard".to_string(),
            name: "New dashboard".to_string(),
            description: None,
            enabled,
            rollout_percentage: rollout,
            allowed_subjects: serialize_string_list(&subjects),
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
            updated_at: "2024-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_disabled_flag_is_off_even_for_targets() {
        let f = flag(false, 100, &["user-1"]);
        let eval = f.evaluate(Some("user-1"));
        assert!(!eval.enabled);
        assert_eq!(eval.reason, EvaluationReason::Disabled);
    }

    #[test]
    fn test_targeted_subject_bypasses_rollout() {
        let f = flag(true, 0, &["user-1"]);
        let eval = f.evaluate(Some("user-1"));
        assert!(eval.enabled);
        assert_eq!(eval.reason, EvaluationReason::Targeted);
        assert!(!f.evaluate(Some("user-2")).enabled);
    }

    #[test]
    fn test_full_and_zero_rollout() {
        assert!(flag(true, 100, &[]).evaluate(None).enabled);
        assert!(!flag(true, 0, &[]).evaluate(Some("x")).enabled);
    }

    #[test]
    fn test_bucketing_is_deterministic_and_bounded() {
        for i in 0..200 {
            let subject = format!("user-{}", i);
            let a = rollout_bucket("new-dashboard", &subject);
            let b = rollout_bucket("new-dashboard", &subject);
            assert_eq!(a, b);
            assert!(a < 100);
        }
    }

    #[test]
    fn test_partial_rollout_matches_bucket() {
        let f = flag(true, 30, &[]);
        for i in 0..50 {
            let subject = format!("org-{}", i);
            let eval = f.evaluate(Some(&subject));
            let bucket = rollout_bucket("new-dashboard", &subject);
            assert_eq!(eval.bucket, Some(bucket));
            assert_eq!(eval.enabled, bucket < 30);
        }
    }

    #[test]
    fn test_partial_rollout_distribution_is_roughly_proportional() {
        let f = flag(true, 50, &[]);
        let on = (0..2000)
            .filter(|i| f.evaluate(Some(&format!("subject-{}", i))).enabled)
            .count();
        assert!(on > 800 && on < 1200, "got {} of 2000", on);
    }

    #[test]
    fn test_needs_subject() {
        assert!(flag(true, 50, &[]).needs_subject());
        assert!(!flag(true, 100, &[]).needs_subject());
        assert!(!flag(false, 50, &[]).needs_subject());
    }
}
