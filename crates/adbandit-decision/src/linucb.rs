//! Contextual LinUCB agent.
//!
//! Per-arm ridge regression with incremental Sherman-Morrison updates over
//! the shared feature vector. Selectable per campaign as an alternative to
//! plain Thompson sampling; the decision pipeline only sees [`BanditAgent`].

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use adbandit_models::{Arm, ArmPosterior};

use crate::agent::BanditAgent;

/// Configuration for linear UCB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinUcbConfig {
    /// Feature dimension (must match `context_features`).
    pub dim: usize,
    /// Ridge regularization lambda, > 0.
    pub lambda: f64,
    /// Exploration strength, >= 0.
    pub alpha: f64,
    /// Exponential forgetting on the sufficient statistics; 1.0 = none.
    pub decay: f64,
}

impl Default for LinUcbConfig {
    fn default() -> Self {
        Self {
            dim: 7,
            lambda: 1.0,
            alpha: 1.0,
            decay: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct ArmState {
    /// A^{-1} for ridge regression, row-major d x d.
    a_inv: Vec<f64>,
    b: Vec<f64>,
    uses: u64,
}

impl ArmState {
    fn new(dim: usize, lambda: f64) -> Self {
        let mut a_inv = vec![0.0; dim * dim];
        let diag = if lambda.is_finite() && lambda > 0.0 {
            1.0 / lambda
        } else {
            1.0
        };
        for i in 0..dim {
            a_inv[i * dim + i] = diag;
        }
        Self {
            a_inv,
            b: vec![0.0; dim],
            uses: 0,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mat_vec(a: &[f64], dim: usize, x: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; dim];
    for i in 0..dim {
        out[i] = dot(&a[i * dim..(i + 1) * dim], x);
    }
    out
}

/// Linear contextual bandit, keyed by arm key.
#[derive(Debug, Clone)]
pub struct ContextualLinUcb {
    cfg: LinUcbConfig,
    state: BTreeMap<String, ArmState>,
    _rng: StdRng,
}

impl ContextualLinUcb {
    pub fn new(cfg: LinUcbConfig, seed: u64) -> Self {
        Self {
            cfg,
            state: BTreeMap::new(),
            _rng: StdRng::seed_from_u64(seed),
        }
    }

    fn state_for(&mut self, key: &str) -> &mut ArmState {
        let (dim, lambda) = (self.cfg.dim, self.cfg.lambda);
        self.state
            .entry(key.to_string())
            .or_insert_with(|| ArmState::new(dim, lambda))
    }
}

impl BanditAgent for ContextualLinUcb {
    fn sample(&mut self, arm: &Arm, _posterior: &ArmPosterior, context: &[f64]) -> f64 {
        let dim = self.cfg.dim;
        let alpha = self.cfg.alpha;
        if context.len() != dim {
            return 0.5;
        }
        let s = self.state_for(&arm.arm_key());
        let theta = mat_vec(&s.a_inv, dim, &s.b);
        let mean = dot(&theta, context);
        let a_inv_x = mat_vec(&s.a_inv, dim, context);
        let bonus = alpha * dot(context, &a_inv_x).max(0.0).sqrt();
        (mean + bonus).clamp(0.0, 1.0)
    }

    fn update(&mut self, arm: &Arm, context: &[f64], reward01: f64) {
        let dim = self.cfg.dim;
        let decay = self.cfg.decay;
        if context.len() != dim {
            return;
        }
        let r = if reward01.is_finite() {
            reward01.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let s = self.state_for(&arm.arm_key());

        // Forgetting: A <- d*A means A^{-1} <- A^{-1}/d before the rank-1 add.
        if decay > 0.0 && decay < 1.0 {
            for v in s.a_inv.iter_mut() {
                *v /= decay;
            }
            for v in s.b.iter_mut() {
                *v *= decay;
            }
        }

        // Sherman-Morrison: (A + x x^T)^{-1} = A^{-1} - (A^{-1}x)(A^{-1}x)^T / (1 + x^T A^{-1} x)
        let a_inv_x = mat_vec(&s.a_inv, dim, context);
        let denom = 1.0 + dot(context, &a_inv_x);
        if denom.abs() > 1e-12 {
            for i in 0..dim {
                for j in 0..dim {
                    s.a_inv[i * dim + j] -= a_inv_x[i] * a_inv_x[j] / denom;
                }
            }
        }
        for i in 0..dim {
            s.b[i] += r * context[i];
        }
        s.uses = s.uses.saturating_add(1);
    }

    fn reseed(&mut self, seed: u64) {
        self._rng = StdRng::seed_from_u64(seed);
    }

    fn snapshot(&self) -> serde_json::Value {
        let uses: BTreeMap<&str, u64> =
            self.state.iter().map(|(k, v)| (k.as_str(), v.uses)).collect();
        serde_json::json!({ "agent": "contextual_linucb", "uses": uses })
    }
}
