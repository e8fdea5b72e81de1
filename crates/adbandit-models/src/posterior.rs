//! Per-arm learned state: Beta posterior plus reward statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arm::ArmId;

/// Laplace prior. A fresh arm samples from `Beta(1, 1)` = Uniform(0, 1).
pub const PRIOR_ALPHA: f64 = 1.0;
pub const PRIOR_BETA: f64 = 1.0;

/// The learned belief over an arm's success probability, held as Beta
/// parameters plus auxiliary reward statistics.
///
/// Accounting invariant: `alpha + beta - 2 == trials` for any posterior
/// built purely from observed rewards (successes bump alpha, failures bump
/// beta, each by one trial).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmPosterior {
    pub arm_id: ArmId,
    pub alpha: f64,
    pub beta: f64,
    /// Cumulative cost charged to the arm.
    pub spend: f64,
    /// Running sum of trial-weighted rewards (ROAS per window × trials).
    pub reward_sum: f64,
    /// Running sum of trial-weighted squared rewards.
    pub reward_sq_sum: f64,
    /// Bernoulli trial count (successes + failures observed).
    pub trials: u64,
    pub updated_ts: DateTime<Utc>,
}

impl ArmPosterior {
    pub fn new(arm_id: ArmId) -> Self {
        Self {
            arm_id,
            alpha: PRIOR_ALPHA,
            beta: PRIOR_BETA,
            spend: 0.0,
            reward_sum: 0.0,
            reward_sq_sum: 0.0,
            trials: 0,
            updated_ts: Utc::now(),
        }
    }

    /// Posterior mean of the success probability.
    pub fn expected_success(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 { 0.5 } else { self.alpha / denom }
    }

    /// Mean observed reward (trial-weighted ROAS).
    pub fn mean_reward(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.reward_sum / self.trials as f64
        }
    }

    /// Sample variance of the reward signal, `E[r^2] - E[r]^2`.
    pub fn reward_variance(&self) -> f64 {
        if self.trials == 0 {
            return 0.0;
        }
        let n = self.trials as f64;
        let mean = self.reward_sum / n;
        (self.reward_sq_sum / n - mean * mean).max(0.0)
    }

    /// Normalized risk score in `[0, 1]`: variance relative to the limit.
    ///
    /// A non-positive limit treats any observed variance as maximal risk.
    pub fn risk_score(&self, variance_limit: f64) -> f64 {
        let var = self.reward_variance();
        if variance_limit <= 0.0 {
            if var > 0.0 { 1.0 } else { 0.0 }
        } else {
            (var / variance_limit).min(1.0)
        }
    }

    /// Apply one batch of observations.
    pub fn apply(&mut self, update: &PosteriorUpdate, now: DateTime<Utc>) {
        self.alpha += update.successes;
        self.beta += update.failures;
        self.spend += update.cost;
        self.reward_sum += update.reward_weighted;
        self.reward_sq_sum += update.reward_sq_weighted;
        self.trials += (update.successes + update.failures).round() as u64;
        self.updated_ts = now;
    }
}

/// Delta applied to a posterior for one or more measurement windows.
///
/// `successes`/`failures` may be fractionally scaled down when a window's
/// click count exceeds the per-cycle trial cap, preserving the observed
/// success ratio while bounding posterior growth. Reward carries as
/// trial-weighted sums so deltas merge by plain addition without losing
/// dispersion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorUpdate {
    pub successes: f64,
    pub failures: f64,
    /// Sum of `roas * trials` over the covered windows.
    pub reward_weighted: f64,
    /// Sum of `roas^2 * trials` over the covered windows.
    pub reward_sq_weighted: f64,
    pub cost: f64,
}

impl PosteriorUpdate {
    /// Build an update from one window's counters.
    ///
    /// Conversions count as successes, non-converting clicks as failures.
    /// `max_trials` bounds how many Bernoulli trials a single window may
    /// contribute; the success/failure split is scaled proportionally.
    pub fn from_window(
        conversions: u64,
        clicks: u64,
        cost: f64,
        revenue: f64,
        max_trials: u64,
    ) -> Self {
        let conversions = conversions.min(clicks);
        let mut successes = conversions as f64;
        let mut failures = (clicks - conversions) as f64;
        let total = successes + failures;
        if max_trials > 0 && total > max_trials as f64 {
            let scale = max_trials as f64 / total;
            successes *= scale;
            failures *= scale;
        }
        let reward = revenue / cost.max(crate::metric::COST_EPSILON);
        let k = successes + failures;
        Self {
            successes,
            failures,
            reward_weighted: reward * k,
            reward_sq_weighted: reward * reward * k,
            cost,
        }
    }

    /// Fold another delta into this one.
    pub fn merge(&mut self, other: &PosteriorUpdate) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.reward_weighted += other.reward_weighted;
        self.reward_sq_weighted += other.reward_sq_weighted;
        self.cost += other.cost;
    }
}
