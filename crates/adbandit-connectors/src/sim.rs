//! Deterministic simulated ad platform.
//!
//! Serves the `simulate` subcommand and the end-to-end tests: per-arm
//! CTR/CVR/revenue/CPC profiles drive a seeded funnel model, so a run with
//! the same seed and bid sequence reproduces identical metrics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use adbandit_models::{Metric, MetricQuality, MetricSource};

use crate::platform::{AdPlatform, ArmBinding, PlatformError, RemoteCampaign};

/// Funnel parameters for one simulated arm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimArmProfile {
    pub ctr: f64,
    pub cvr: f64,
    pub revenue_per_conversion: f64,
    pub cost_per_click: f64,
}

impl Default for SimArmProfile {
    fn default() -> Self {
        Self {
            ctr: 0.05,
            cvr: 0.10,
            revenue_per_conversion: 10.0,
            cost_per_click: 1.0,
        }
    }
}

struct SimState {
    rng: StdRng,
    bids: HashMap<String, f64>,
    set_bid_calls: u64,
}

/// Simulated platform with a seeded funnel model.
pub struct SimPlatform {
    name: String,
    impressions_per_cycle: u64,
    profiles: HashMap<String, SimArmProfile>,
    default_profile: SimArmProfile,
    state: Mutex<SimState>,
}

impl SimPlatform {
    pub fn new(name: impl Into<String>, seed: u64, impressions_per_cycle: u64) -> Self {
        Self {
            name: name.into(),
            impressions_per_cycle,
            profiles: HashMap::new(),
            default_profile: SimArmProfile::default(),
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                bids: HashMap::new(),
                set_bid_calls: 0,
            }),
        }
    }

    /// Override the funnel profile for one arm key.
    pub fn with_profile(mut self, arm_key: impl Into<String>, profile: SimArmProfile) -> Self {
        self.profiles.insert(arm_key.into(), profile);
        self
    }

    fn profile_for(&self, arm_key: &str) -> SimArmProfile {
        self.profiles
            .get(arm_key)
            .copied()
            .unwrap_or(self.default_profile)
    }

    /// Currently applied bid for an arm, if any was set.
    pub fn bid_for(&self, arm_key: &str) -> Option<f64> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .bids
            .get(arm_key)
            .copied()
    }

    /// Total `set_bid` invocations (idempotent re-issues included).
    pub fn set_bid_calls(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .set_bid_calls
    }

    fn draw_binomial(rng: &mut StdRng, n: u64, p: f64) -> u64 {
        let p = p.clamp(0.0, 1.0);
        if n == 0 || p <= 0.0 {
            return 0;
        }
        match Binomial::new(n, p) {
            Ok(dist) => dist.sample(rng),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl AdPlatform for SimPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_metrics(
        &self,
        _account_id: &str,
        bindings: &[ArmBinding],
        since: DateTime<Utc>,
    ) -> Result<Vec<Metric>, PlatformError> {
        if bindings.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let per_arm = self.impressions_per_cycle / bindings.len() as u64;
        let mut out = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let profile = self.profile_for(&binding.arm_key);
            let impressions = per_arm;
            let clicks = Self::draw_binomial(&mut state.rng, impressions, profile.ctr);
            let conversions = Self::draw_binomial(&mut state.rng, clicks, profile.cvr);
            let cost = clicks as f64 * profile.cost_per_click;
            let revenue = conversions as f64 * profile.revenue_per_conversion;
            out.push(Metric {
                arm_id: binding.arm_id,
                ts: since,
                impressions,
                clicks,
                conversions,
                cost,
                revenue,
                source: MetricSource::Poll,
                quality: MetricQuality::Ok,
            });
        }
        Ok(out)
    }

    async fn set_bid(&self, binding: &ArmBinding, new_bid: f64) -> Result<(), PlatformError> {
        if !new_bid.is_finite() || new_bid < 0.0 {
            return Err(PlatformError::Permanent(format!(
                "rejected bid {new_bid} for {}",
                binding.arm_key
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.set_bid_calls += 1;
        // Idempotent by (arm_binding, bid): overwriting with the same value
        // changes nothing observable.
        state.bids.insert(binding.arm_key.clone(), new_bid);
        debug!(platform = %self.name, arm = %binding.arm_key, bid = new_bid, "sim bid applied");
        Ok(())
    }

    async fn list_campaigns(
        &self,
        account_id: &str,
    ) -> Result<Vec<RemoteCampaign>, PlatformError> {
        Ok(vec![RemoteCampaign {
            remote_id: format!("{}-{}", self.name, account_id),
            name: format!("{} simulated account", self.name),
            status: "active".to_string(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn binding(arm_id: i64, key: &str) -> ArmBinding {
        ArmBinding {
            arm_id,
            arm_key: key.to_string(),
            channel: "Search".into(),
            creative: "A".into(),
            bid: 1.0,
        }
    }

    #[tokio::test]
    async fn same_seed_reproduces_the_funnel() {
        let since = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let bindings = vec![binding(1, "a"), binding(2, "b")];
        let p1 = SimPlatform::new("sim", 99, 10_000);
        let p2 = SimPlatform::new("sim", 99, 10_000);
        let m1 = p1.fetch_metrics("acct", &bindings, since).await.unwrap();
        let m2 = p2.fetch_metrics("acct", &bindings, since).await.unwrap();
        assert_eq!(m1, m2);
    }

    #[tokio::test]
    async fn funnel_respects_profile_ordering() {
        let since = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let strong = SimArmProfile { ctr: 0.2, ..Default::default() };
        let weak = SimArmProfile { ctr: 0.01, ..Default::default() };
        let platform = SimPlatform::new("sim", 7, 100_000)
            .with_profile("strong", strong)
            .with_profile("weak", weak);
        let metrics = platform
            .fetch_metrics("acct", &[binding(1, "strong"), binding(2, "weak")], since)
            .await
            .unwrap();
        assert!(metrics[0].clicks > metrics[1].clicks);
        for m in &metrics {
            assert!(m.clicks <= m.impressions);
            assert!(m.conversions <= m.clicks);
        }
    }

    #[tokio::test]
    async fn set_bid_is_recorded_and_counted() {
        let platform = SimPlatform::new("sim", 0, 1000);
        let b = binding(1, "a");
        platform.set_bid(&b, 1.25).await.unwrap();
        platform.set_bid(&b, 1.25).await.unwrap();
        assert_eq!(platform.bid_for("a"), Some(1.25));
        assert_eq!(platform.set_bid_calls(), 2);
        assert!(platform.set_bid(&b, f64::NAN).await.is_err());
    }
}
