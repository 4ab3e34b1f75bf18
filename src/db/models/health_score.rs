//! Customer health score snapshots.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

text_enum! {
    pub enum RiskLevel {
        Healthy => "healthy",
        AtRisk => "at_risk",
        Critical => "critical",
    }
}

text_enum! {
    pub enum ChurnRisk {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

text_enum! {
    pub enum Trend {
        New => "new",
        Improving => "improving",
        Stable => "stable",
        Declining => "declining",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HealthScore {
    pub id: String,
    pub organization_id: String,
    pub usage_score: f64,
    pub engagement_score: f64,
    pub support_score: f64,
    pub payment_score: f64,
    pub overall_score: f64,
    pub risk_level: String,
    pub churn_probability: f64,
    pub churn_risk: String,
    pub trend: String,
    pub notes: Option<String>,
    pub calculated_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CalculateHealthScoreRequest {
    pub usage: f64,
    pub engagement: f64,
    pub support: f64,
    pub payment: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthScoreFilter {
    pub risk_level: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// A computed snapshot ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewHealthScore {
    pub usage_score: f64,
    pub engagement_score: f64,
    pub support_score: f64,
    pub payment_score: f64,
    pub overall_score: f64,
    pub risk_level: RiskLevel,
    pub churn_probability: f64,
    pub churn_risk: ChurnRisk,
    pub trend: Trend,
}

/// Latest snapshot per organization, joined with the organization name
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrganizationHealth {
    pub organization_id: String,
    pub organization_name: String,
    pub overall_score: f64,
    pub risk_level: String,
    pub churn_probability: f64,
    pub churn_risk: String,
    pub trend: String,
    pub created_at: String,
}

impl HealthScore {
    pub fn risk_level_enum(&self) -> Option<RiskLevel> {
        self.risk_level.parse().ok()
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        score: &NewHealthScore,
        notes: Option<&str>,
        calculated_by: Option<&str>,
    ) -> Result<HealthScore, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO health_scores (
                id, organization_id, usage_score, engagement_score, support_score, payment_score,
                overall_score, risk_level, churn_probability, churn_risk, trend, notes, calculated_by, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(score.usage_score)
        .bind(score.engagement_score)
        .bind(score.support_score)
        .bind(score.payment_score)
        .bind(score.overall_score)
        .bind(score.risk_level.to_string())
        .bind(score.churn_probability)
        .bind(score.churn_risk.to_string())
        .bind(score.trend.to_string())
        .bind(notes)
        .bind(calculated_by)
        .bind(crate::utils::now())
        .execute(db)
        .await?;

        sqlx::query_as::<_, HealthScore>("SELECT * FROM health_scores WHERE id = ?")
            .bind(&id)
            .fetch_one(db)
            .await
    }

    pub async fn latest(
        db: &SqlitePool,
        organization_id: &str,
    ) -> Result<Option<HealthScore>, sqlx::Error> {
        sqlx::query_as::<_, HealthScore>(
            "SELECT * FROM health_scores WHERE organization_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(organization_id)
        .fetch_optional(db)
        .await
    }

    /// Latest snapshot of every organization, worst first
    pub async fn latest_per_organization(
        db: &SqlitePool,
        risk_level: Option<&str>,
    ) -> Result<Vec<OrganizationHealth>, sqlx::Error> {
        sqlx::query_as::<_, OrganizationHealth>(
            r#"
            SELECT h.organization_id, o.name AS organization_name, h.overall_score, h.risk_level,
                   h.churn_probability, h.churn_risk, h.trend, h.created_at
            FROM health_scores h
            JOIN organizations o ON o.id = h.organization_id
            WHERE h.rowid = (
                SELECT h2.rowid FROM health_scores h2
                WHERE h2.organization_id = h.organization_id
                ORDER BY h2.created_at DESC, h2.rowid DESC
                LIMIT 1
            )
            AND (? IS NULL OR h.risk_level = ?)
            ORDER BY h.overall_score ASC
            "#,
        )
        .bind(risk_level)
        .bind(risk_level)
        .fetch_all(db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    fn snapshot(overall: f64, risk: RiskLevel) -> NewHealthScore {
        NewHealthScore {
            usage_score: overall,
            engagement_score: overall,
            support_score: overall,
            payment_score: overall,
            overall_score: overall,
            risk_level: risk,
            churn_probability: (100.0 - overall) / 100.0,
            churn_risk: ChurnRisk::Low,
            trend: Trend::New,
        }
    }

    #[tokio::test]
    async fn test_latest_per_organization() {
        let db = init_memory().await.unwrap();
        let acme = Organization::create(&db, "Acme", "acme", "free").await.unwrap();
        let globex = Organization::create(&db, "Globex", "globex", "free").await.unwrap();

        HealthScore::create(&db, &acme.id, &snapshot(80.0, RiskLevel::Healthy), None, None)
            .await
            .unwrap();
        HealthScore::create(&db, &acme.id, &snapshot(30.0, RiskLevel::Critical), None, None)
            .await
            .unwrap();
        HealthScore::create(&db, &globex.id, &snapshot(55.0, RiskLevel::AtRisk), None, None)
            .await
            .unwrap();

        let latest = HealthScore::latest(&db, &acme.id).await.unwrap().unwrap();
        assert_eq!(latest.overall_score, 30.0);
        assert_eq!(latest.risk_level_enum(), Some(RiskLevel::Critical));

        let all = HealthScore::latest_per_organization(&db, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].organization_name, "Acme");
        assert_eq!(all[1].overall_score, 55.0);

        let at_risk = HealthScore::latest_per_organization(&db, Some("at_risk"))
            .await
            .unwrap();
        assert_eq!(at_risk.len(), 1);
        assert_eq!(at_risk[0].organization_id, globex.id);
    }
}
