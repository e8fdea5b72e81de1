//! Engine configuration surface.
//!
//! One TOML file feeds the whole engine. Every field has a default so a
//! partial file (or none at all) still yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ValidationError;

/// Marketing-mix-model adjustment tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MmmConfig {
    /// Seasonality multipliers keyed by quarter ("Q1".."Q4") then channel.
    #[serde(default)]
    pub seasonality: BTreeMap<String, BTreeMap<String, f64>>,
    /// Ad-stock decay rate per cycle, in `(0, 1)`.
    #[serde(default = "default_carryover_decay")]
    pub carryover_decay: f64,
    /// Upper bound on the ad-stock multiplier, `>= 1`.
    #[serde(default = "default_carryover_cap")]
    pub carryover_cap: f64,
    /// Scalar external multipliers applied to every arm (e.g. promo uplift).
    #[serde(default)]
    pub external: BTreeMap<String, f64>,
    /// Calendar dates ("MM-DD") carrying the holiday multiplier.
    #[serde(default)]
    pub holidays: Vec<String>,
    #[serde(default = "default_holiday_multiplier")]
    pub holiday_multiplier: f64,
}

fn default_carryover_decay() -> f64 {
    0.8
}
fn default_carryover_cap() -> f64 {
    2.0
}
fn default_holiday_multiplier() -> f64 {
    1.8
}

impl Default for MmmConfig {
    fn default() -> Self {
        Self {
            seasonality: BTreeMap::new(),
            carryover_decay: default_carryover_decay(),
            carryover_cap: default_carryover_cap(),
            external: BTreeMap::new(),
            holidays: Vec::new(),
            holiday_multiplier: default_holiday_multiplier(),
        }
    }
}

/// Root engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Default decision cycle cadence for new campaigns, in milliseconds.
    #[serde(default = "default_cycle_ms")]
    pub cycle_default_ms: i64,
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance_default: f64,
    #[serde(default = "default_variance_limit")]
    pub variance_limit_default: f64,
    /// Below this trial count, high-variance arms take the exploration
    /// penalty instead of the full risk discount.
    #[serde(default = "default_min_trials_for_risk_gate")]
    pub min_trials_for_risk_gate: u64,
    /// Per-arm maximum allocation movement per cycle, in `(0, 1]`.
    #[serde(default = "default_max_step")]
    pub max_step: f64,
    /// Per-arm minimum exploration share.
    #[serde(default = "default_min_alloc_floor")]
    pub min_alloc_floor: f64,
    /// Allocation deltas below this are not reported to the change log.
    #[serde(default = "default_report_threshold")]
    pub report_threshold: f64,
    /// Poll rate per platform, in requests per second.
    #[serde(default)]
    pub poll_rate_per_platform: BTreeMap<String, f64>,
    /// Z-score beyond which a metric row is flagged suspect.
    #[serde(default = "default_anomaly_z")]
    pub anomaly_z: f64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Cap on Bernoulli trials a single window may contribute.
    #[serde(default = "default_max_trials_per_cycle")]
    pub max_trials_per_cycle: u64,
    /// Reward delta above which a webhook hint triggers an out-of-cycle
    /// posterior update.
    #[serde(default = "default_webhook_hint_threshold")]
    pub webhook_hint_threshold: f64,
    /// Upper plausibility bound for ROAS (validation V3).
    #[serde(default = "default_roas_plausible_max")]
    pub roas_plausible_max: f64,
    /// Change-log retention window in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Webhook HTTP listener port.
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,
    /// Concurrent cycle tasks; 0 means `cores × 4`.
    #[serde(default)]
    pub max_concurrent_cycles: usize,
    /// Concurrent in-flight calls per platform.
    #[serde(default = "default_platform_concurrency")]
    pub platform_concurrency: usize,
    /// Deadline for platform metric fetches, in milliseconds.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Deadline for bid updates, in milliseconds.
    #[serde(default = "default_bid_timeout_ms")]
    pub bid_timeout_ms: u64,
    /// Deadline for durable writes, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Bounded intake queue capacity.
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    #[serde(default)]
    pub mmm: MmmConfig,
}

fn default_db_path() -> String {
    "adbandit.db".to_string()
}
fn default_cycle_ms() -> i64 {
    15 * 60 * 1000
}
fn default_risk_tolerance() -> f64 {
    0.3
}
fn default_variance_limit() -> f64 {
    0.1
}
fn default_min_trials_for_risk_gate() -> u64 {
    30
}
fn default_max_step() -> f64 {
    0.1
}
fn default_min_alloc_floor() -> f64 {
    0.01
}
fn default_report_threshold() -> f64 {
    1e-4
}
fn default_anomaly_z() -> f64 {
    3.0
}
fn default_drain_timeout_ms() -> u64 {
    30_000
}
fn default_max_trials_per_cycle() -> u64 {
    1000
}
fn default_webhook_hint_threshold() -> f64 {
    0.5
}
fn default_roas_plausible_max() -> f64 {
    100.0
}
fn default_retention_days() -> u32 {
    90
}
fn default_webhook_port() -> u16 {
    8090
}
fn default_platform_concurrency() -> usize {
    4
}
fn default_fetch_timeout_ms() -> u64 {
    30_000
}
fn default_bid_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_pending_capacity() -> usize {
    4096
}

impl Default for EngineConfig {
    fn default() -> Self {
        // serde defaults and Default must agree; route through an empty doc.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ValidationError::Config(format!(
                "could not read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|e| ValidationError::Config(format!("failed to parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0.0..=1.0).contains(&self.risk_tolerance_default) {
            return Err(ValidationError::Config(
                "risk_tolerance_default must be in [0, 1]".into(),
            ));
        }
        if self.variance_limit_default < 0.0 {
            return Err(ValidationError::Config(
                "variance_limit_default must be >= 0".into(),
            ));
        }
        if !(self.max_step > 0.0 && self.max_step <= 1.0) {
            return Err(ValidationError::Config("max_step must be in (0, 1]".into()));
        }
        if self.min_alloc_floor < 0.0 {
            return Err(ValidationError::Config("min_alloc_floor must be >= 0".into()));
        }
        if self.report_threshold < 0.0 {
            return Err(ValidationError::Config("report_threshold must be >= 0".into()));
        }
        if !(self.mmm.carryover_decay > 0.0 && self.mmm.carryover_decay < 1.0) {
            return Err(ValidationError::Config(
                "carryover_decay must be in (0, 1)".into(),
            ));
        }
        if self.mmm.carryover_cap < 1.0 {
            return Err(ValidationError::Config("carryover_cap must be >= 1".into()));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn bid_timeout(&self) -> Duration {
        Duration::from_millis(self.bid_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Effective cycle-task cap: explicit value or `cores × 4`.
    pub fn effective_cycle_cap(&self) -> usize {
        if self.max_concurrent_cycles > 0 {
            self.max_concurrent_cycles
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() * 4)
                .unwrap_or(16)
        }
    }

    /// Poll rate for a platform; defaults to 1 rps when unconfigured.
    pub fn poll_rate(&self, platform: &str) -> f64 {
        self.poll_rate_per_platform
            .get(platform)
            .copied()
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(1.0)
    }
}
