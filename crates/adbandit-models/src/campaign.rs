//! Campaign entity and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ValidationError;

/// Opaque campaign identifier (database rowid).
pub type CampaignId = i64;

/// Campaign lifecycle.
///
/// `Draft -> Active <-> Paused -> Completed` with `Errored` as a terminal
/// state that an operator may reset manually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Errored,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Errored => "errored",
        }
    }

    /// Terminal states accept no further allocation changes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Errored)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "errored" => Ok(CampaignStatus::Errored),
            other => Err(ValidationError::UnknownEnumValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// KPI the optimizer maximizes for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKpi {
    Roas,
    Cpa,
    Revenue,
    Conversions,
}

impl PrimaryKpi {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryKpi::Roas => "roas",
            PrimaryKpi::Cpa => "cpa",
            PrimaryKpi::Revenue => "revenue",
            PrimaryKpi::Conversions => "conversions",
        }
    }
}

impl FromStr for PrimaryKpi {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "roas" => Ok(PrimaryKpi::Roas),
            "cpa" => Ok(PrimaryKpi::Cpa),
            "revenue" => Ok(PrimaryKpi::Revenue),
            "conversions" => Ok(PrimaryKpi::Conversions),
            other => Err(ValidationError::UnknownEnumValue {
                field: "primary_kpi",
                value: other.to_string(),
            }),
        }
    }
}

/// A budget-bounded, time-bounded collection of arms optimized toward one KPI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    /// Database id; 0 until persisted.
    pub id: CampaignId,
    pub name: String,
    pub total_budget: f64,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub primary_kpi: PrimaryKpi,
    /// How much variance the campaign accepts, in `[0, 1]`.
    /// 0 = fully risk-averse, 1 = risk-neutral.
    pub risk_tolerance: f64,
    /// Maximum acceptable per-arm reward variance.
    pub variance_limit: f64,
    /// Decision cycle cadence in milliseconds.
    pub cadence_ms: i64,
}

impl Campaign {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms.max(0) as u64)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("name"));
        }
        if !self.total_budget.is_finite() || self.total_budget <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "total_budget",
                value: self.total_budget,
            });
        }
        if !(0.0..=1.0).contains(&self.risk_tolerance) {
            return Err(ValidationError::OutOfRange {
                field: "risk_tolerance",
                value: self.risk_tolerance,
            });
        }
        if !self.variance_limit.is_finite() || self.variance_limit < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "variance_limit",
                value: self.variance_limit,
            });
        }
        if self.cadence_ms <= 0 {
            return Err(ValidationError::OutOfRange {
                field: "cadence_ms",
                value: self.cadence_ms as f64,
            });
        }
        if let Some(end) = self.end {
            if end <= self.start {
                return Err(ValidationError::Config(
                    "campaign end precedes start".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Campaign {
        Campaign {
            id: 0,
            name: "spring_push".into(),
            total_budget: 10_000.0,
            start: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            end: None,
            status: CampaignStatus::Draft,
            primary_kpi: PrimaryKpi::Roas,
            risk_tolerance: 0.3,
            variance_limit: 0.1,
            cadence_ms: 900_000,
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            CampaignStatus::Draft,
            CampaignStatus::Active,
            CampaignStatus::Paused,
            CampaignStatus::Completed,
            CampaignStatus::Errored,
        ] {
            assert_eq!(s.as_str().parse::<CampaignStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn validate_rejects_bad_risk_parameters() {
        let mut c = sample();
        assert!(c.validate().is_ok());
        c.risk_tolerance = 1.5;
        assert!(c.validate().is_err());
        c.risk_tolerance = 0.3;
        c.variance_limit = -0.1;
        assert!(c.validate().is_err());
        c.variance_limit = 0.1;
        c.total_budget = 0.0;
        assert!(c.validate().is_err());
    }
}
