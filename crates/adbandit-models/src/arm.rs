//! Arm definitions.
//!
//! An arm is the atomic unit of allocation: one immutable
//! `(platform, channel, creative, bid)` tuple owned by exactly one campaign.

use serde::{Deserialize, Serialize};

use crate::campaign::CampaignId;
use crate::error::ValidationError;

/// Opaque arm identifier (database rowid).
pub type ArmId = i64;

/// Deterministic arm key from the identity tuple. The bid is rendered with
/// fixed precision so `1.5` and `1.50` collapse to the same key.
pub fn arm_key_of(platform: &str, channel: &str, creative: &str, bid: f64) -> String {
    format!("{platform}|{channel}|{creative}|{bid:.4}")
}

/// One ad configuration a campaign can spend against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    /// Database id; 0 until persisted.
    pub id: ArmId,
    pub campaign_id: CampaignId,
    pub platform: String,
    pub channel: String,
    pub creative: String,
    /// Base bid in account currency. Immutable once created.
    pub bid: f64,
    /// Disabled arms stay in the table with allocation pinned to 0.
    #[serde(default)]
    pub disabled: bool,
}

impl Arm {
    pub fn new(
        campaign_id: CampaignId,
        platform: impl Into<String>,
        channel: impl Into<String>,
        creative: impl Into<String>,
        bid: f64,
    ) -> Self {
        Self {
            id: 0,
            campaign_id,
            platform: platform.into(),
            channel: channel.into(),
            creative: creative.into(),
            bid,
            disabled: false,
        }
    }

    /// Stable key: deterministic concatenation of the identity tuple.
    pub fn arm_key(&self) -> String {
        arm_key_of(&self.platform, &self.channel, &self.creative, self.bid)
    }

    /// Reject malformed arms before they reach the store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.platform.trim().is_empty() {
            return Err(ValidationError::EmptyField("platform"));
        }
        if self.channel.trim().is_empty() {
            return Err(ValidationError::EmptyField("channel"));
        }
        if self.creative.trim().is_empty() {
            return Err(ValidationError::EmptyField("creative"));
        }
        if !self.bid.is_finite() || self.bid <= 0.0 {
            return Err(ValidationError::NonPositiveBid(self.bid));
        }
        Ok(())
    }
}
