//! Customer health score calculation.
//!
//! A snapshot combines four component scores (0..=100) into a weighted overall
//! score, classifies the risk level, compares against the previous snapshot to
//! derive a trend and estimates churn probability.

use sqlx::SqlitePool;

use crate::db::{ChurnRisk, HealthScore, NewHealthScore, RiskLevel, Trend};

/// Component weights; they sum to 1.0
pub const USAGE_WEIGHT: f64 = 0.30;
pub const ENGAGEMENT_WEIGHT: f64 = 0.25;
pub const SUPPORT_WEIGHT: f64 = 0.20;
pub const PAYMENT_WEIGHT: f64 = 0.25;

/// Overall score at or above which an organization is healthy
pub const HEALTHY_THRESHOLD: f64 = 70.0;
/// Overall score at or above which an organization is at risk (below: critical)
pub const AT_RISK_THRESHOLD: f64 = 40.0;

/// Score change that counts as improving/declining
pub const TREND_DELTA: f64 = 5.0;
/// Decline that adds [`STEEP_DECLINE_PENALTY`] to churn probability
pub const STEEP_DECLINE: f64 = 10.0;
pub const STEEP_DECLINE_PENALTY: f64 = 0.10;

pub const HIGH_CHURN_THRESHOLD: f64 = 0.70;
pub const MEDIUM_CHURN_THRESHOLD: f64 = 0.40;

/// Component scores supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthInputs {
    pub usage: f64,
    pub engagement: f64,
    pub support: f64,
    pub payment: f64,
}

impl HealthInputs {
    /// Names of components outside 0..=100
    pub fn out_of_range(&self) -> Vec<&'static str> {
        [
            ("usage", self.usage),
            ("engagement", self.engagement),
            ("support", self.support),
            ("payment", self.payment),
        ]
        .into_iter()
        .filter(|(_, v)| !(0.0..=100.0).contains(v))
        .map(|(name, _)| name)
        .collect()
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn overall_score(inputs: &HealthInputs) -> f64 {
    round_to(
        inputs.usage * USAGE_WEIGHT
            + inputs.engagement * ENGAGEMENT_WEIGHT
            + inputs.support * SUPPORT_WEIGHT
            + inputs.payment * PAYMENT_WEIGHT,
        1,
    )
}

pub fn risk_level(overall: f64) -> RiskLevel {
    if overall >= HEALTHY_THRESHOLD {
        RiskLevel::Healthy
    } else if overall >= AT_RISK_THRESHOLD {
        RiskLevel::AtRisk
    } else {
        RiskLevel::Critical
    }
}

pub fn trend(overall: f64, previous: Option<f64>) -> Trend {
    match previous {
        None => Trend::New,
        Some(prev) => {
            let delta = overall - prev;
            if delta >= TREND_DELTA {
                Trend::Improving
            } else if delta <= -TREND_DELTA {
                Trend::Declining
            } else {
                Trend::Stable
            }
        }
    }
}

pub fn churn_probability(overall: f64, previous: Option<f64>) -> f64 {
    let mut p = (100.0 - overall) / 100.0;
    if let Some(prev) = previous {
        if prev - overall >= STEEP_DECLINE {
            p += STEEP_DECLINE_PENALTY;
        }
    }
    round_to(p.clamp(0.0, 1.0), 2)
}

pub fn churn_risk(probability: f64) -> ChurnRisk {
    if probability >= HIGH_CHURN_THRESHOLD {
        ChurnRisk::High
    } else if probability >= MEDIUM_CHURN_THRESHOLD {
        ChurnRisk::Medium
    } else {
        ChurnRisk::Low
    }
}

/// Compute a snapshot given the previous overall score, if any
pub fn calculate(inputs: &HealthInputs, previous: Option<f64>) -> NewHealthScore {
    let overall = overall_score(inputs);
    let probability = churn_probability(overall, previous);

    NewHealthScore {
        usage_score: inputs.usage,
        engagement_score: inputs.engagement,
        support_score: inputs.support,
        payment_score: inputs.payment,
        overall_score: overall,
        risk_level: risk_level(overall),
        churn_probability: probability,
        churn_risk: churn_risk(probability),
        trend: trend(overall, previous),
    }
}

/// Compute and store a new snapshot for an organization
pub async fn record_health_score(
    db: &SqlitePool,
    organization_id: &str,
    inputs: &HealthInputs,
    notes: Option<&str>,
    calculated_by: Option<&str>,
) -> Result<HealthScore, sqlx::Error> {
    let previous = HealthScore::latest(db, organization_id)
        .await?
        .map(|s| s.overall_score);
    let snapshot = calculate(inputs, previous);

    let stored = HealthScore::create(db, organization_id, &snapshot, notes, calculated_by).await?;
    tracing::info!(
        organization_id = %organization_id,
        overall = stored.overall_score,
        risk_level = %stored.risk_level,
        trend = %stored.trend,
        "Health score recorded"
    );
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Organization};

    fn inputs(usage: f64, engagement: f64, support: f64, payment: f64) -> HealthInputs {
        HealthInputs {
            usage,
            engagement,
            support,
            payment,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let sum = USAGE_WEIGHT + ENGAGEMENT_WEIGHT + SUPPORT_WEIGHT + PAYMENT_WEIGHT;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overall_score_weighting() {
        assert_eq!(overall_score(&inputs(100.0, 100.0, 100.0, 100.0)), 100.0);
        assert_eq!(overall_score(&inputs(0.0, 0.0, 0.0, 0.0)), 0.0);
        // 24 + 15 + 10 + 22.5
        assert_eq!(overall_score(&inputs(80.0, 60.0, 50.0, 90.0)), 71.5);
        assert_eq!(overall_score(&inputs(33.3, 33.3, 33.3, 33.3)), 33.3);
    }

    #[test]
    fn test_risk_thresholds() {
        assert_eq!(risk_level(70.0), RiskLevel::Healthy);
        assert_eq!(risk_level(69.9), RiskLevel::AtRisk);
        assert_eq!(risk_level(40.0), RiskLevel::AtRisk);
        assert_eq!(risk_level(39.9), RiskLevel::Critical);
    }

    #[test]
    fn test_trend() {
        assert_eq!(trend(50.0, None), Trend::New);
        assert_eq!(trend(55.0, Some(50.0)), Trend::Improving);
        assert_eq!(trend(54.9, Some(50.0)), Trend::Stable);
        assert_eq!(trend(45.0, Some(50.0)), Trend::Declining);
    }

    #[test]
    fn test_churn_probability() {
        assert_eq!(churn_probability(80.0, None), 0.2);
        assert_eq!(churn_probability(80.0, Some(85.0)), 0.2);
        assert_eq!(churn_probability(70.0, Some(80.0)), 0.4);
        assert_eq!(churn_probability(5.0, Some(50.0)), 1.0);
        assert_eq!(churn_risk(0.7), ChurnRisk::High);
        assert_eq!(churn_risk(0.69), ChurnRisk::Medium);
        assert_eq!(churn_risk(0.4), ChurnRisk::Medium);
        assert_eq!(churn_risk(0.39), ChurnRisk::Low);
    }

    #[test]
    fn test_out_of_range() {
        assert!(inputs(0.0, 100.0, 50.0, 50.0).out_of_range().is_empty());
        assert_eq!(
            inputs(-1.0, 100.1, 50.0, f64::NAN).out_of_range(),
            vec!["usage", "engagement", "payment"]
        );
    }

    #[tokio::test]
    async fn test_record_uses_previous_snapshot() {
        let db = init_memory().await.unwrap();
        let org = Organization::create(&db, "Acme", "acme", "free").await.unwrap();

        let first = record_health_score(&db, &org.id, &inputs(90.0, 90.0, 90.0, 90.0), None, None)
            .await
            .unwrap();
        assert_eq!(first.trend, "new");
        assert_eq!(first.risk_level, "healthy");

        let second = record_health_score(&db, &org.id, &inputs(30.0, 30.0, 30.0, 30.0), None, None)
            .await
            .unwrap();
        assert_eq!(second.trend, "declining");
        assert_eq!(second.risk_level, "critical");
        assert_eq!(second.churn_probability, 0.8);
        assert_eq!(second.churn_risk, "high");
    }
}
