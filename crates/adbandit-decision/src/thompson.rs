//! Thompson sampling over persisted Beta posteriors.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};

use adbandit_models::{Arm, ArmPosterior};

use crate::agent::BanditAgent;

/// Seedable Bernoulli Thompson sampler.
///
/// Holds no per-arm state of its own: the Beta parameters live in the
/// posterior store, so a process restart loses nothing.
#[derive(Debug, Clone)]
pub struct ThompsonBernoulli {
    rng: StdRng,
}

impl ThompsonBernoulli {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample_beta(&mut self, alpha: f64, beta: f64) -> f64 {
        if !(alpha.is_finite() && beta.is_finite()) || alpha <= 0.0 || beta <= 0.0 {
            return 0.5;
        }
        match Beta::new(alpha, beta) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0.5,
        }
    }
}

impl BanditAgent for ThompsonBernoulli {
    fn sample(&mut self, _arm: &Arm, posterior: &ArmPosterior, _context: &[f64]) -> f64 {
        self.sample_beta(posterior.alpha, posterior.beta)
    }

    fn update(&mut self, _arm: &Arm, _context: &[f64], _reward01: f64) {
        // Posterior updates happen in the store; nothing to learn here.
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "agent": "thompson_bernoulli" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbandit_models::Arm;

    #[test]
    fn identical_seeds_draw_identical_samples() {
        let arm = Arm::new(1, "Google", "Search", "A", 1.0);
        let post = ArmPosterior::new(1);
        let mut a = ThompsonBernoulli::with_seed(42);
        let mut b = ThompsonBernoulli::with_seed(42);
        for _ in 0..10 {
            assert_eq!(a.sample(&arm, &post, &[]), b.sample(&arm, &post, &[]));
        }
    }

    #[test]
    fn degenerate_posterior_falls_back_to_half() {
        let arm = Arm::new(1, "Google", "Search", "A", 1.0);
        let mut post = ArmPosterior::new(1);
        post.alpha = f64::NAN;
        let mut agent = ThompsonBernoulli::with_seed(0);
        assert_eq!(agent.sample(&arm, &post, &[]), 0.5);
    }

    #[test]
    fn strong_posterior_concentrates_samples() {
        let arm = Arm::new(1, "Google", "Search", "A", 1.0);
        let mut post = ArmPosterior::new(1);
        post.alpha = 900.0;
        post.beta = 100.0;
        let mut agent = ThompsonBernoulli::with_seed(7);
        let mean: f64 =
            (0..200).map(|_| agent.sample(&arm, &post, &[])).sum::<f64>() / 200.0;
        assert!((mean - 0.9).abs() < 0.05, "mean={mean}");
    }
}
