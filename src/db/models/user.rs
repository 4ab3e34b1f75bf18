//! Users, organization roles and sessions.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Organization roles with hierarchical permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    /// Full access, including organization settings
    Owner,
    /// Manage members, webhooks, flags and retention
    Admin,
    /// Create and edit records
    Member,
    /// Read-only access
    Viewer,
}

impl OrgRole {
    /// Check if this role has at least the specified permission level
    pub fn has_at_least(&self, required: OrgRole) -> bool {
        self.level() >= required.level()
    }

    /// Get the permission level (higher = more permissions)
    pub fn level(&self) -> u8 {
        match self {
            OrgRole::Owner => 4,
            OrgRole::Admin => 3,
            OrgRole::Member => 2,
            OrgRole::Viewer => 1,
        }
    }
}

impl std::fmt::Display for OrgRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrgRole::Owner => write!(f, "owner"),
            OrgRole::Admin => write!(f, "admin"),
            OrgRole::Member => write!(f, "member"),
            OrgRole::Viewer => write!(f, "viewer"),
        }
    }
}

impl std::str::FromStr for OrgRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(OrgRole::Owner),
            "admin" => Ok(OrgRole::Admin),
            "member" => Ok(OrgRole::Member),
            "viewer" => Ok(OrgRole::Viewer),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

impl From<String> for OrgRole {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(OrgRole::Viewer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub organization_id: Option<String>,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub is_platform_admin: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    /// Get the role as an OrgRole enum
    pub fn role_enum(&self) -> OrgRole {
        OrgRole::from(self.role.clone())
    }

    pub async fn find(db: &SqlitePool, id: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_by_email(db: &SqlitePool, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email.trim().to_lowercase())
            .fetch_optional(db)
            .await
    }

    pub async fn count(db: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(db)
            .await
    }

    pub async fn create(db: &SqlitePool, new: &NewUser<'_>) -> Result<User, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO users (id, organization_id, email, name, password_hash, role, is_platform_admin, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(new.organization_id)
        .bind(new.email.trim().to_lowercase())
        .bind(new.name)
        .bind(new.password_hash)
        .bind(new.role.to_string())
        .bind(new.is_platform_admin)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        Self::find(db, &id).await?.ok_or(sqlx::Error::RowNotFound)
    }
}

/// Fields for inserting a user
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub organization_id: Option<&'a str>,
    pub email: &'a str,
    pub name: &'a str,
    pub password_hash: &'a str,
    pub role: OrgRole,
    pub is_platform_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub organization_id: Option<String>,
    pub email: String,
    pub name: String,
    pub role: String,
    pub is_platform_admin: bool,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            organization_id: user.organization_id,
            email: user.email,
            name: user.name,
            role: user.role,
            is_platform_admin: user.is_platform_admin,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: String,
    pub password: String,
    pub role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserFilter {
    pub role: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub expires_at: String,
    pub created_at: String,
}

impl Session {
    pub async fn create(
        db: &SqlitePool,
        user_id: &str,
        token_hash: &str,
        expires_at: &str,
    ) -> Result<Session, sqlx::Error> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            token_hash: token_hash.to_string(),
            expires_at: expires_at.to_string(),
            created_at: crate::utils::now(),
        };

        sqlx::query(
            "INSERT INTO sessions (id, user_id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.token_hash)
        .bind(&session.expires_at)
        .bind(&session.created_at)
        .execute(db)
        .await?;

        Ok(session)
    }

    /// Find a session by token hash that has not expired yet
    pub async fn find_valid(
        db: &SqlitePool,
        token_hash: &str,
    ) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE token_hash = ? AND expires_at > ?",
        )
        .bind(token_hash)
        .bind(crate::utils::now())
        .fetch_optional(db)
        .await
    }

    pub async fn revoke(db: &SqlitePool, token_hash: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(token_hash)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove expired sessions
    pub async fn purge_expired(db: &SqlitePool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(crate::utils::now())
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: String,
    pub user: UserResponse,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn test_role_hierarchy() {
        assert!(OrgRole::Owner.has_at_least(OrgRole::Admin));
        assert!(OrgRole::Admin.has_at_least(OrgRole::Member));
        assert!(OrgRole::Member.has_at_least(OrgRole::Viewer));
        assert!(!OrgRole::Viewer.has_at_least(OrgRole::Member));
        assert!(!OrgRole::Member.has_at_least(OrgRole::Admin));
    }

    #[test]
    fn test_unknown_role_falls_back_to_viewer() {
        assert_eq!(OrgRole::from("superuser".to_string()), OrgRole::Viewer);
        assert_eq!(OrgRole::from("ADMIN".to_string()), OrgRole::Admin);
    }

    #[tokio::test]
    async fn test_email_is_normalized() {
        let db = init_memory().await.unwrap();
        let user = User::create(
            &db,
            &NewUser {
                organization_id: None,
                email: "  Alice@Example.COM ",
                name: "Alice",
                password_hash: "x",
                role: OrgRole::Owner,
                is_platform_admin: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(user.email, "alice@example.com");
        assert!(user.is_platform_admin);
        assert!(User::find_by_email(&db, "ALICE@example.com")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_not_valid() {
        let db = init_memory().await.unwrap();
        let user = User::create(
            &db,
            &NewUser {
                organization_id: None,
                email: "bob@example.com",
                name: "Bob",
                password_hash: "x",
                role: OrgRole::Member,
                is_platform_admin: false,
            },
        )
        .await
        .unwrap();

        Session::create(&db, &user.id, "live", "2999-01-01T00:00:00.000Z")
            .await
            .unwrap();
        Session::create(&db, &user.id, "dead", "2000-01-01T00:00:00.000Z")
            .await
            .unwrap();

        assert!(Session::find_valid(&db, "live").await.unwrap().is_some());
        assert!(Session::find_valid(&db, "dead").await.unwrap().is_none());

        assert_eq!(Session::purge_expired(&db).await.unwrap(), 1);
        assert!(Session::revoke(&db, "live").await.unwrap());
        assert!(!Session::revoke(&db, "live").await.unwrap());
    }
}
