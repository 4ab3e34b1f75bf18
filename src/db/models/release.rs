//! Product releases.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::db::query::find_scoped;

text_enum! {
    pub enum ReleaseStatus {
        Draft => "draft",
        Published => "published",
        Archived => "archived",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Release {
    pub id: String,
    pub organization_id: String,
    pub version: String,
    pub title: String,
    pub notes: Option<String>,
    pub status: String,
    pub published_at: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateReleaseRequest {
    pub version: String,
    pub title: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateReleaseRequest {
    pub version: Option<String>,
    pub title: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseFilter {
    pub status: Option<String>,
    pub search: Option<String>,
}

impl Release {
    pub fn status_enum(&self) -> Option<ReleaseStatus> {
        self.status.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        req: &CreateReleaseRequest,
        created_by: Option<&str>,
    ) -> Result<Release, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO releases (id, organization_id, version, title, notes, status, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'draft', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(req.version.trim())
        .bind(req.title.trim())
        .bind(&req.notes)
        .bind(created_by)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "releases", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn update(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        req: &UpdateReleaseRequest,
    ) -> Result<Option<Release>, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE releases
            SET version = COALESCE(?, version),
                title = COALESCE(?, title),
                notes = COALESCE(?, notes),
                updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(req.version.as_deref().map(str::trim))
        .bind(req.title.as_deref().map(str::trim))
        .bind(&req.notes)
        .bind(crate::utils::now())
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "releases", organization_id, id).await
    }

    /// Move the release from `from` to `status`, stamping `published_at` on
    /// publish. Returns `None` when the release is no longer in `from`.
    pub async fn set_status(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        from: ReleaseStatus,
        status: ReleaseStatus,
    ) -> Result<Option<Release>, sqlx::Error> {
        let now = crate::utils::now();
        let published_at = (status == ReleaseStatus::Published).then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE releases
            SET status = ?, published_at = COALESCE(?, published_at), updated_at = ?
            WHERE id = ? AND organization_id = ? AND status = ?
            "#,
        )
        .bind(status.to_string())
        .bind(&published_at)
        .bind(&now)
        .bind(id)
        .bind(organization_id)
        .bind(from.to_string())
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "releases", organization_id, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    #[tokio::test]
    async fn test_publish_sets_timestamp() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();

        let release = Release::create(
            &db,
            &org.id,
            &CreateReleaseRequest {
                version: "1.2.0".to_string(),
                title: "Spring release".to_string(),
                notes: None,
            },
            None,
        )
        .await
        .unwrap();
        assert_eq!(release.status_enum(), Some(ReleaseStatus::Draft));
        assert!(release.published_at.is_none());

        let published = Release::set_status(
            &db,
            &org.id,
            &release.id,
            ReleaseStatus::Draft,
            ReleaseStatus::Published,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(published.status, "published");
        assert!(published.published_at.is_some());

        // A second publish that read `draft` finds nothing to update
        let again = Release::set_status(
            &db,
            &org.id,
            &release.id,
            ReleaseStatus::Draft,
            ReleaseStatus::Published,
        )
        .await
        .unwrap();
        assert!(again.is_none());

        let archived = Release::set_status(
            &db,
            &org.id,
            &release.id,
            ReleaseStatus::Published,
            ReleaseStatus::Archived,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(archived.status, "archived");
        assert_eq!(archived.published_at, published.published_at);
    }

    #[tokio::test]
    async fn test_version_unique_per_org() {
        let db = init_memory().await.unwrap();
        let acme = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let globex = Organization::create(&db, "Globex", "globex", "free").await.unwrap();
        let req = CreateReleaseRequest {
            version: "v1.0.0".to_string(),
            title: "First".to_string(),
            notes: None,
        };

        Release::create(&db, &acme.id, &req, None).await.unwrap();
        Release::create(&db, &globex.id, &req, None).await.unwrap();
        assert!(Release::create(&db, &acme.id, &req, None).await.is_err());
    }
}
