//! Marketing-mix-model adjustment layer.
//!
//! Three multiplier families apply on top of the risk-adjusted Thompson
//! score:
//! - seasonality, keyed by `(quarter, channel)`
//! - ad-stock carryover per channel, decaying at rate gamma and capped
//! - scalar external factors (promo uplift, holiday calendar)
//!
//! When nothing applies, every multiplier is 1.0.

use chrono::{DateTime, Datelike, Utc};
use std::collections::BTreeMap;

use adbandit_models::MmmConfig;

/// The multipliers applied to one arm in one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MmmMultipliers {
    pub seasonality: f64,
    pub carryover: f64,
    pub external: f64,
}

impl MmmMultipliers {
    pub fn product(&self) -> f64 {
        self.seasonality * self.carryover * self.external
    }
}

/// Quarter of the year for a timestamp, 1..=4.
pub fn quarter_of(ts: DateTime<Utc>) -> u8 {
    ((ts.month() - 1) / 3 + 1) as u8
}

/// Stateful MMM adjuster for one campaign.
///
/// Carryover ad-stock per channel: after each applied cycle the stock
/// decays by gamma and absorbs the channel's spend share; the multiplier
/// is `min(cap, 1 + gamma * stock)`.
#[derive(Debug, Clone)]
pub struct MmmAdjuster {
    cfg: MmmConfig,
    stock: BTreeMap<String, f64>,
}

impl MmmAdjuster {
    pub fn new(cfg: MmmConfig) -> Self {
        Self {
            cfg,
            stock: BTreeMap::new(),
        }
    }

    /// Multipliers for one channel at one instant.
    pub fn multipliers(&self, channel: &str, now: DateTime<Utc>) -> MmmMultipliers {
        let quarter = format!("Q{}", quarter_of(now));
        let seasonality = self
            .cfg
            .seasonality
            .get(&quarter)
            .and_then(|by_channel| by_channel.get(channel))
            .copied()
            .filter(|m| m.is_finite() && *m > 0.0)
            .unwrap_or(1.0);

        let stock = self.stock.get(channel).copied().unwrap_or(0.0);
        let carryover = (1.0 + self.cfg.carryover_decay * stock).min(self.cfg.carryover_cap);

        let mut external: f64 = self
            .cfg
            .external
            .values()
            .filter(|m| m.is_finite() && **m > 0.0)
            .product();
        let today = now.format("%m-%d").to_string();
        if self.cfg.holidays.iter().any(|d| *d == today) {
            external *= self.cfg.holiday_multiplier;
        }

        MmmMultipliers {
            seasonality,
            carryover,
            external,
        }
    }

    /// Fold one applied cycle's spend share into the channel ad-stock.
    pub fn observe_spend(&mut self, channel: &str, spend_share: f64) {
        let share = if spend_share.is_finite() {
            spend_share.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let entry = self.stock.entry(channel.to_string()).or_insert(0.0);
        *entry = *entry * self.cfg.carryover_decay + share;
    }

    /// Current ad-stock level for a channel (diagnostics).
    pub fn stock(&self, channel: &str) -> f64 {
        self.stock.get(channel).copied().unwrap_or(0.0)
    }
}
