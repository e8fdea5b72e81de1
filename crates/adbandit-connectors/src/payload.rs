//! Typed webhook payloads and per-platform adapters.
//!
//! Each platform's raw body parses into a platform-specific record first;
//! only the canonical [`NormalizedMetric`] crosses into the core. Free-form
//! maps never do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use adbandit_models::ValidationError;

/// Platform-agnostic metric candidate produced by a payload adapter.
///
/// The ingest pipeline resolves `(platform, channel, creative, bid)` to an
/// arm id before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMetric {
    pub platform: String,
    pub channel: String,
    pub creative: String,
    pub bid: f64,
    pub ts: DateTime<Utc>,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub cost: f64,
    pub revenue: f64,
}

/// Google-style conversion webhook: one `conversion` object per body.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConversionPayload {
    pub conversion: GoogleConversion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConversion {
    #[serde(default = "default_search")]
    pub channel: String,
    pub creative: String,
    pub bid: f64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub conversions: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub revenue: f64,
}

fn default_search() -> String {
    "Search".to_string()
}

/// Meta-style webhook: `entry[].changes[].value` envelopes.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaWebhookPayload {
    pub entry: Vec<MetaEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaEntry {
    pub changes: Vec<MetaChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaChange {
    pub value: MetaValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaValue {
    #[serde(default = "default_social")]
    pub channel: String,
    pub creative: String,
    pub bid: f64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub conversions: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub revenue: f64,
}

fn default_social() -> String {
    "Social".to_string()
}

/// Trade-desk-style webhook: a flat report row.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeDeskPayload {
    pub channel: String,
    pub creative: String,
    pub bid: f64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub conversions: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub revenue: f64,
}

/// Parsed raw payload, tagged by platform.
#[derive(Debug, Clone)]
pub enum RawPayload {
    Google(GoogleConversionPayload),
    Meta(MetaWebhookPayload),
    TradeDesk(TradeDeskPayload),
}

impl RawPayload {
    /// Parse a webhook body for the named platform.
    pub fn parse(platform: &str, body: &[u8]) -> Result<Self, ValidationError> {
        let malformed = |e: serde_json::Error| ValidationError::MalformedPayload(e.to_string());
        match platform {
            "google" => Ok(RawPayload::Google(
                serde_json::from_slice(body).map_err(malformed)?,
            )),
            "meta" => Ok(RawPayload::Meta(
                serde_json::from_slice(body).map_err(malformed)?,
            )),
            "tradedesk" => Ok(RawPayload::TradeDesk(
                serde_json::from_slice(body).map_err(malformed)?,
            )),
            other => Err(ValidationError::MalformedPayload(format!(
                "unknown platform `{other}`"
            ))),
        }
    }

    /// Map into canonical metric candidates.
    pub fn normalize(self) -> Vec<NormalizedMetric> {
        match self {
            RawPayload::Google(p) => {
                let c = p.conversion;
                vec![NormalizedMetric {
                    platform: "google".into(),
                    channel: c.channel,
                    creative: c.creative,
                    bid: c.bid,
                    ts: c.ts,
                    impressions: c.impressions,
                    clicks: c.clicks,
                    conversions: c.conversions,
                    cost: c.cost,
                    revenue: c.revenue,
                }]
            }
            RawPayload::Meta(p) => p
                .entry
                .into_iter()
                .flat_map(|e| e.changes)
                .map(|ch| {
                    let v = ch.value;
                    NormalizedMetric {
                        platform: "meta".into(),
                        channel: v.channel,
                        creative: v.creative,
                        bid: v.bid,
                        ts: v.ts,
                        impressions: v.impressions,
                        clicks: v.clicks,
                        conversions: v.conversions,
                        cost: v.cost,
                        revenue: v.revenue,
                    }
                })
                .collect(),
            RawPayload::TradeDesk(p) => vec![NormalizedMetric {
                platform: "tradedesk".into(),
                channel: p.channel,
                creative: p.creative,
                bid: p.bid,
                ts: p.ts,
                impressions: p.impressions,
                clicks: p.clicks,
                conversions: p.conversions,
                cost: p.cost,
                revenue: p.revenue,
            }],
        }
    }
}
