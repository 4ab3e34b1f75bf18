//! Detected security threats.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeMap;

use crate::db::query::find_scoped;
use crate::db::{Severity, TextEnum};

text_enum! {
    pub enum ThreatType {
        BruteForce => "brute_force",
        SuspiciousLogin => "suspicious_login",
        DataExfiltration => "data_exfiltration",
        Malware => "malware",
        PolicyViolation => "policy_violation",
    }
}

text_enum! {
    pub enum ThreatStatus {
        Open => "open",
        Investigating => "investigating",
        Mitigated => "mitigated",
        Resolved => "resolved",
        FalsePositive => "false_positive",
    }
}

impl ThreatStatus {
    /// Resolved and false positive threats are closed
    pub fn is_closed(&self) -> bool {
        matches!(self, ThreatStatus::Resolved | ThreatStatus::FalsePositive)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SecurityThreat {
    pub id: String,
    pub organization_id: String,
    pub title: String,
    pub description: Option<String>,
    pub threat_type: String,
    pub severity: String,
    pub status: String,
    pub source_ip: Option<String>,
    pub resolution: Option<String>,
    pub detected_at: String,
    pub resolved_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateThreatRequest {
    pub title: String,
    pub description: Option<String>,
    pub threat_type: String,
    pub severity: String,
    pub source_ip: Option<String>,
    pub detected_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateThreatRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveThreatRequest {
    pub resolution: Option<String>,
    #[serde(default)]
    pub false_positive: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThreatFilter {
    pub severity: Option<String>,
    pub status: Option<String>,
    pub threat_type: Option<String>,
    pub search: Option<String>,
}

/// Threat counts for the dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreatSummary {
    pub total: i64,
    pub unresolved: i64,
    /// Unresolved threats per severity
    pub by_severity: BTreeMap<String, i64>,
    /// All threats per status
    pub by_status: BTreeMap<String, i64>,
}

/// Validated values for a new threat
#[derive(Debug)]
pub struct NewThreat<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub source_ip: Option<&'a str>,
    pub detected_at: &'a str,
}

impl SecurityThreat {
    pub fn status_enum(&self) -> Option<ThreatStatus> {
        self.status.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        new: &NewThreat<'_>,
    ) -> Result<SecurityThreat, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();

        sqlx::query(
            r#"
            INSERT INTO security_threats (id, organization_id, title, description, threat_type, severity, status, source_ip, detected_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'open', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(new.title)
        .bind(new.description)
        .bind(new.threat_type.to_string())
        .bind(new.severity.to_string())
        .bind(new.source_ip)
        .bind(new.detected_at)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "security_threats", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn update(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        severity: Option<Severity>,
        status: Option<ThreatStatus>,
    ) -> Result<Option<SecurityThreat>, sqlx::Error> {
        let now = crate::utils::now();
        // Closing stamps resolved_at, reopening clears it
        let resolved_at = status.filter(|s| s.is_closed()).map(|_| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE security_threats
            SET title = COALESCE(?, title),
                description = COALESCE(?, description),
                severity = COALESCE(?, severity),
                status = COALESCE(?, status),
                resolved_at = CASE WHEN ? IS NULL THEN resolved_at ELSE ? END,
                updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(title)
        .bind(description)
        .bind(severity.map(|s| s.to_string()))
        .bind(status.map(|s| s.to_string()))
        .bind(status.map(|s| s.to_string()))
        .bind(&resolved_at)
        .bind(&now)
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        find_scoped(db, "security_threats", organization_id, id).await
    }

    pub async fn resolve(
        db: &SqlitePool,
        organization_id: &str,
        id: &str,
        status: ThreatStatus,
        resolution: Option<&str>,
    ) -> Result<Option<SecurityThreat>, sqlx::Error> {
        let now = crate::utils::now();
        sqlx::query(
            r#"
            UPDATE security_threats
            SET status = ?, resolution = COALESCE(?, resolution), resolved_at = ?, updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(resolution)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(organization_id)
        .execute(db)
        .await?;

        find_scoped(db, "security_threats", organization_id, id).await
    }

    /// Count threats by status and unresolved threats by severity.
    ///
    /// `organization_id` of `None` summarizes across every organization.
    pub async fn summary(
        db: &SqlitePool,
        organization_id: Option<&str>,
    ) -> Result<ThreatSummary, sqlx::Error> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT status, severity, COUNT(*)
            FROM security_threats
            WHERE (? IS NULL OR organization_id = ?)
            GROUP BY status, severity
            "#,
        )
        .bind(organization_id)
        .bind(organization_id)
        .fetch_all(db)
        .await?;

        let mut summary = ThreatSummary::default();
        for severity in Severity::all() {
            summary.by_severity.insert(severity.to_string(), 0);
        }
        for status in ThreatStatus::all() {
            summary.by_status.insert(status.to_string(), 0);
        }

        for (status, severity, count) in rows {
            summary.total += count;
            *summary.by_status.entry(status.clone()).or_insert(0) += count;

            let closed = status
                .parse::<ThreatStatus>()
                .map(|s| s.is_closed())
                .unwrap_or(false);
            if !closed {
                summary.unresolved += count;
                *summary.by_severity.entry(severity).or_insert(0) += count;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    async fn report(db: &SqlitePool, org: &str, severity: Severity) -> SecurityThreat {
        SecurityThreat::create(
            db,
            org,
            &NewThreat {
                title: "Repeated failed logins",
                description: None,
                threat_type: ThreatType::BruteForce,
                severity,
                source_ip: Some("203.0.113.9"),
                detected_at: "2024-05-01T10:00:00.000Z",
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_sets_timestamp() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let threat = report(&db, &org.id, Severity::High).await;
        assert_eq!(threat.status_enum(), Some(ThreatStatus::Open));
        assert!(threat.resolved_at.is_none());

        let resolved = SecurityThreat::resolve(
            &db,
            &org.id,
            &threat.id,
            ThreatStatus::FalsePositive,
            Some("Pen test traffic"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(resolved.status, "false_positive");
        assert_eq!(resolved.resolution.as_deref(), Some("Pen test traffic"));
        assert!(resolved.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_reopen_clears_resolved_at() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let threat = report(&db, &org.id, Severity::Medium).await;

        let resolved = SecurityThreat::resolve(&db, &org.id, &threat.id, ThreatStatus::Resolved, None)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.resolved_at.is_some());

        let renamed = SecurityThreat::update(
            &db,
            &org.id,
            &threat.id,
            Some("Repeated failed logins (VPN)"),
            None,
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(renamed.resolved_at, resolved.resolved_at);

        let reopened = SecurityThreat::update(
            &db,
            &org.id,
            &threat.id,
            None,
            None,
            None,
            Some(ThreatStatus::Investigating),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reopened.status, "investigating");
        assert!(reopened.resolved_at.is_none());

        let summary = SecurityThreat::summary(&db, Some(&org.id)).await.unwrap();
        assert_eq!(summary.unresolved, 1);
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let db = init_memory().await.unwrap();
        let acme = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let globex = Organization::create(&db, "Globex", "globex", "free").await.unwrap();

        report(&db, &acme.id, Severity::High).await;
        report(&db, &acme.id, Severity::High).await;
        let closed = report(&db, &acme.id, Severity::Critical).await;
        SecurityThreat::resolve(&db, &acme.id, &closed.id, ThreatStatus::Resolved, None)
            .await
            .unwrap();
        report(&db, &globex.id, Severity::Low).await;

        let summary = SecurityThreat::summary(&db, Some(&acme.id)).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.unresolved, 2);
        assert_eq!(summary.by_severity["high"], 2);
        assert_eq!(summary.by_severity["critical"], 0);
        assert_eq!(summary.by_status["open"], 2);
        assert_eq!(summary.by_status["resolved"], 1);

        let everywhere = SecurityThreat::summary(&db, None).await.unwrap();
        assert_eq!(everywhere.total, 4);
        assert_eq!(everywhere.by_severity["low"], 1);
    }
}
