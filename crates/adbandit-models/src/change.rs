//! Append-only allocation change records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::arm::ArmId;
use crate::campaign::CampaignId;
use crate::error::ValidationError;

/// Who initiated an allocation change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    Auto,
    Analyst,
    Override,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::Auto => "auto",
            Initiator::Analyst => "analyst",
            Initiator::Override => "override",
        }
    }
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Initiator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Initiator::Auto),
            "analyst" => Ok(Initiator::Analyst),
            "override" => Ok(Initiator::Override),
            other => Err(ValidationError::UnknownEnumValue {
                field: "initiated_by",
                value: other.to_string(),
            }),
        }
    }
}

/// One recorded decision that altered a campaign's allocation vector.
///
/// `factors` carries the scalar contribution of each decision step as the
/// log of the ratio between successive step values; `mmm_factors` carries
/// the log of each applied marketing-mix multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationChange {
    /// Database id; 0 until appended.
    pub id: i64,
    pub campaign_id: CampaignId,
    pub arm_id: ArmId,
    pub ts: DateTime<Utc>,
    pub old_alloc: f64,
    pub new_alloc: f64,
    pub reason: String,
    pub factors: BTreeMap<String, f64>,
    pub mmm_factors: BTreeMap<String, f64>,
    pub initiated_by: Initiator,
    /// Posterior numbers at decision time, for audit and explanation.
    pub state_snapshot: serde_json::Value,
}

impl AllocationChange {
    /// Relative change, in percent of the old allocation.
    pub fn change_pct(&self) -> f64 {
        if self.old_alloc.abs() < f64::EPSILON {
            if self.new_alloc.abs() < f64::EPSILON { 0.0 } else { 100.0 }
        } else {
            (self.new_alloc - self.old_alloc) / self.old_alloc * 100.0
        }
    }
}
