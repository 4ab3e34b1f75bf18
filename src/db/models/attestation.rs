//! Compliance attestations.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

text_enum! {
    pub enum AttestationStatus {
        Pending => "pending",
        Attested => "attested",
        Rejected => "rejected",
        Expired => "expired",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attestation {
    pub id: String,
    pub organization_id: String,
    pub title: String,
    pub description: Option<String>,
    pub framework: String,
    pub status: String,
    pub attested_by: Option<String>,
    pub attested_at: Option<String>,
    pub expires_at: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAttestationRequest {
    pub title: String,
    pub description: Option<String>,
    pub framework: String,
    pub expires_at: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAttestationRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub framework: Option<String>,
    pub expires_at: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AttestRequest {
    pub notes: Option<String>,
    pub expires_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AttestationFilter {
    pub status: Option<String>,
    pub framework: Option<String>,
    pub search: Option<String>,
}

/// Days an attestation stays valid when no expiry is given
pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

impl Attestation {
    pub fn status_enum(&self) -> Option<AttestationStatus> {
        self.status.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        req: &CreateAttestationRequest,
        expires_at: Option<&str>,
    ) -> Result<Attestation, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO attestations (id, organization_id, title, description, framework, status, expires_at, notes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(req.title.trim())
        .bind(&req.description)
        .bind(req.framework.trim().to_lowercase())
        .bind(expires_at)
        .bind(&req.notes)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        crate::db::query::find_scoped(db, "attestations", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn update(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        req: &UpdateAttestationRequest,
        expires_at: Option<&str>,
    ) -> Result<Option<Attestation>, sqlx::Error> {
        let now = crate::utils::now();
        let result = sqlx::query(
            r#"
            UPDATE attestations
            SET title = COALESCE(?, title),
                description = COALESCE(?, description),
                framework = COALESCE(?, framework),
                expires_at = COALESCE(?, expires_at),
                notes = COALESCE(?, notes),
                updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(req.title.as_deref().map(str::trim))
        .bind(&req.description)
        .bind(req.framework.as_deref().map(|f| f.trim().to_lowercase()))
        .bind(expires_at)
        .bind(&req.notes)
        .bind(&now)
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        crate::db::query::find_scoped(db, "attestations", organization_id, id).await
    }

    /// Mark as attested by `user_id`
    pub async fn attest(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        user_id: &str,
        attested_at: &str,
        expires_at: &str,
        notes: Option<&str>,
    ) -> Result<Option<Attestation>, sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE attestations
            SET status = 'attested', attested_by = ?, attested_at = ?, expires_at = ?,
                notes = COALESCE(?, notes), updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(user_id)
        .bind(attested_at)
        .bind(expires_at)
        .bind(notes)
        .bind(attested_at)
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        crate::db::query::find_scoped(db, "attestations", organization_id, id).await
    }

    pub async fn reject(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        notes: Option<&str>,
    ) -> Result<Option<Attestation>, sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE attestations
            SET status = 'rejected', notes = COALESCE(?, notes), updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(notes)
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        crate::db::query::find_scoped(db, "attestations", organization_id, id).await
    }

    /// Move every attestation whose expiry has passed to `expired`.
    ///
    /// Returns the rows that changed so callers can notify about them.
    pub async fn expire_due(db: &SqlitePool, now: &str) -> Result<Vec<Attestation>, sqlx::Error> {
        let due = sqlx::query_as::<_, Attestation>(
            r#"
            SELECT * FROM attestations
            WHERE status IN ('pending', 'attested') AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(now)
        .fetch_all(db)
        .await?;

        if due.is_empty() {
            return Ok(due);
        }

        sqlx::query(
            r#"
            UPDATE attestations SET status = 'expired', updated_at = ?
            WHERE status IN ('pending', 'attested') AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(db)
        .await?;

        Ok(due
            .into_iter()
            .map(|mut a| {
                a.status = AttestationStatus::Expired.to_string();
                a
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    fn request(title: &str) -> CreateAttestationRequest {
        CreateAttestationRequest {
            title: title.to_string(),
            description: None,
            framework: "SOC2".to_string(),
            expires_at: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_create_defaults_to_pending() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();

        let a = Attestation::create(&db, &org.id, &request("Access review"), None)
            .await
            .unwrap();
        assert_eq!(a.status, "pending");
        assert_eq!(a.framework, "soc2");
        assert_eq!(a.status_enum(), Some(AttestationStatus::Pending));
    }

    #[tokio::test]
    async fn test_attest_then_expire() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let a = Attestation::create(&db, &org.id, &request("Access review"), None)
            .await
            .unwrap();

        let attested = Attestation::attest(
            &db,
            &org.id,
            &a.id,
            "user-1",
            "2024-01-01T00:00:00.000Z",
            "2024-06-01T00:00:00.000Z",
            Some("looks good"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(attested.status, "attested");
        assert_eq!(attested.attested_by.as_deref(), Some("user-1"));
        assert_eq!(attested.notes.as_deref(), Some("looks good"));

        let none_yet = Attestation::expire_due(&db, "2024-05-31T23:59:59.999Z")
            .await
            .unwrap();
        assert!(none_yet.is_empty());

        let expired = Attestation::expire_due(&db, "2024-06-01T00:00:00.000Z")
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, "expired");

        // Second pass finds nothing new
        assert!(Attestation::expire_due(&db, "2025-01-01T00:00:00.000Z")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_is_scoped_to_org() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let other = Organization::create(&db, "Other", "other", "free").await.unwrap();
        let a = Attestation::create(&db, &org.id, &request("Access review"), None)
            .await
            .unwrap();

        let req = UpdateAttestationRequest {
            title: Some("Hijack".to_string()),
            description: None,
            framework: None,
            expires_at: None,
            notes: None,
        };
        assert!(Attestation::update(&db, &other.id, &a.id, &req, None)
            .await
            .unwrap()
            .is_none());

        let updated = Attestation::update(&db, &org.id, &a.id, &req, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "Hijack");
        assert_eq!(updated.framework, "soc2");
    }
}
