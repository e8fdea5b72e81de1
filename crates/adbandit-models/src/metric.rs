//! Metric time-series rows.
//!
//! CTR, CVR and ROAS are always derived from the stored counters; they are
//! never the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::arm::ArmId;
use crate::error::ValidationError;

/// Guard against division by a zero cost when deriving ROAS.
pub const COST_EPSILON: f64 = 1e-9;

/// Where a metric row came from.
///
/// `(arm_id, ts, source)` is the idempotency key; a poll row and a webhook
/// row for the same window coexist, with poll authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    Poll,
    Webhook,
    Backfill,
}

impl MetricSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricSource::Poll => "poll",
            MetricSource::Webhook => "webhook",
            MetricSource::Backfill => "backfill",
        }
    }
}

impl fmt::Display for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricSource {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(MetricSource::Poll),
            "webhook" => Ok(MetricSource::Webhook),
            "backfill" => Ok(MetricSource::Backfill),
            other => Err(ValidationError::UnknownEnumValue {
                field: "source",
                value: other.to_string(),
            }),
        }
    }
}

/// Data-quality verdict attached at ingest time.
///
/// Suspect rows are persisted for audit but excluded from posterior updates
/// until an operator accepts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricQuality {
    Ok,
    Suspect,
}

impl MetricQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricQuality::Ok => "ok",
            MetricQuality::Suspect => "suspect",
        }
    }
}

impl FromStr for MetricQuality {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(MetricQuality::Ok),
            "suspect" => Ok(MetricQuality::Suspect),
            other => Err(ValidationError::UnknownEnumValue {
                field: "quality",
                value: other.to_string(),
            }),
        }
    }
}

/// One measurement window for one arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub arm_id: ArmId,
    pub ts: DateTime<Utc>,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub cost: f64,
    pub revenue: f64,
    pub source: MetricSource,
    #[serde(default = "default_quality")]
    pub quality: MetricQuality,
}

fn default_quality() -> MetricQuality {
    MetricQuality::Ok
}

impl Metric {
    /// Click-through rate; 0 when no impressions.
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }

    /// Conversion rate per click; 0 when no clicks.
    pub fn cvr(&self) -> f64 {
        if self.clicks == 0 {
            0.0
        } else {
            self.conversions as f64 / self.clicks as f64
        }
    }

    /// Return on ad spend for this window.
    pub fn roas(&self) -> f64 {
        self.revenue / self.cost.max(COST_EPSILON)
    }

    /// Hard validity rules: required fields, ranges, and cross-field
    /// funnel constraints. Failing rows are rejected outright.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "cost",
                value: self.cost,
            });
        }
        if !self.revenue.is_finite() || self.revenue < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "revenue",
                value: self.revenue,
            });
        }
        if self.clicks > self.impressions {
            return Err(ValidationError::FunnelViolation {
                detail: format!(
                    "clicks ({}) exceed impressions ({})",
                    self.clicks, self.impressions
                ),
            });
        }
        if self.conversions > self.clicks {
            return Err(ValidationError::FunnelViolation {
                detail: format!(
                    "conversions ({}) exceed clicks ({})",
                    self.conversions, self.clicks
                ),
            });
        }
        if self.cost == 0.0 && self.revenue > 0.0 {
            return Err(ValidationError::FunnelViolation {
                detail: "revenue reported with zero cost".to_string(),
            });
        }
        Ok(())
    }

    /// Soft plausibility checks. Violations mark the row `suspect` instead
    /// of rejecting it.
    pub fn plausibility_flags(&self, roas_max: f64) -> Vec<String> {
        let mut flags = Vec::new();
        if self.cost > 0.0 {
            let roas = self.roas();
            if roas > roas_max {
                flags.push(format!("roas {:.2} above plausible bound {:.0}", roas, roas_max));
            }
        }
        if self.impressions > 0 && self.ctr() > 0.5 {
            flags.push(format!("ctr {:.2}% unusually high", self.ctr() * 100.0));
        }
        if self.clicks > 0 && self.cvr() > 0.5 {
            flags.push(format!("cvr {:.2}% unusually high", self.cvr() * 100.0));
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(impressions: u64, clicks: u64, conversions: u64, cost: f64, revenue: f64) -> Metric {
        Metric {
            arm_id: 1,
            ts: Utc::now(),
            impressions,
            clicks,
            conversions,
            cost,
            revenue,
            source: MetricSource::Poll,
            quality: MetricQuality::Ok,
        }
    }

    #[test]
    fn funnel_constraints_enforced() {
        assert!(metric(100, 10, 2, 5.0, 12.0).validate().is_ok());
        assert!(metric(10, 11, 0, 5.0, 0.0).validate().is_err());
        assert!(metric(100, 10, 11, 5.0, 0.0).validate().is_err());
        assert!(metric(100, 10, 2, -1.0, 0.0).validate().is_err());
        assert!(metric(100, 10, 2, 0.0, 12.0).validate().is_err());
    }

    #[test]
    fn derived_rates() {
        let m = metric(1000, 50, 5, 25.0, 100.0);
        assert!((m.ctr() - 0.05).abs() < 1e-12);
        assert!((m.cvr() - 0.1).abs() < 1e-12);
        assert!((m.roas() - 4.0).abs() < 1e-12);
        let empty = metric(0, 0, 0, 0.0, 0.0);
        assert_eq!(empty.ctr(), 0.0);
        assert_eq!(empty.cvr(), 0.0);
    }

    #[test]
    fn implausible_roas_flags_but_validates() {
        let m = metric(1000, 50, 40, 1.0, 500.0);
        assert!(m.validate().is_ok());
        let flags = m.plausibility_flags(100.0);
        assert!(flags.iter().any(|f| f.contains("roas")));
        assert!(flags.iter().any(|f| f.contains("cvr")));
    }
}
