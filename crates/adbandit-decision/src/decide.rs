//! The per-cycle allocation decision.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use adbandit_models::{
    AllocationChange, Arm, ArmId, ArmPosterior, Campaign, CampaignStatus, EngineConfig,
    Initiator,
};

use crate::agent::{context_features, BanditAgent};
use crate::mmm::{quarter_of, MmmAdjuster};

/// Spend below this counts as a fully exhausted budget.
const BUDGET_EPSILON: f64 = 1e-6;

/// Floor for log-factor arguments.
const LOG_FLOOR: f64 = 1e-12;

fn ln_safe(x: f64) -> f64 {
    x.max(LOG_FLOOR).ln()
}

fn ln_ratio(after: f64, before: f64) -> f64 {
    ln_safe(after) - ln_safe(before)
}

/// Tuning knobs for the decision pipeline, lifted from [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionParams {
    pub min_trials_for_risk_gate: u64,
    pub max_step: f64,
    pub min_alloc_floor: f64,
    pub report_threshold: f64,
}

impl DecisionParams {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            min_trials_for_risk_gate: cfg.min_trials_for_risk_gate,
            max_step: cfg.max_step,
            min_alloc_floor: cfg.min_alloc_floor,
            report_threshold: cfg.report_threshold,
        }
    }
}

impl Default for DecisionParams {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Everything a cycle needs besides the campaign and its posteriors.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub now: DateTime<Utc>,
    pub cycle_tick: u64,
    /// Allocation applied by the previous cycle; empty on the first one.
    pub prev_alloc: BTreeMap<ArmId, f64>,
    /// Cumulative spend across all arms of the campaign.
    pub spend_total: f64,
    /// Projected total cost of the coming cycle at unscaled allocation.
    pub projected_cycle_cost: f64,
    pub params: DecisionParams,
}

/// Output of one decision cycle.
#[derive(Debug, Clone)]
pub struct Decision {
    /// New allocation per arm. Sums to 1 unless budget scaling engaged,
    /// in which case it sums to `budget_scale`.
    pub alloc: BTreeMap<ArmId, f64>,
    pub changes: Vec<AllocationChange>,
    /// Proportional scale applied to fit the remaining budget; 1.0 when
    /// the budget was not binding.
    pub budget_scale: f64,
    /// The remaining budget reached zero; the campaign should complete.
    pub completed: bool,
}

struct Scored<'a> {
    arm: &'a Arm,
    posterior: ArmPosterior,
    adjusted: f64,
    factors: BTreeMap<String, f64>,
    mmm_factors: BTreeMap<String, f64>,
}

/// Compute the next allocation for a campaign.
///
/// Pure: reads posteriors and context, touches no I/O. Reproducible given
/// the same inputs and agent seed. Arms are processed in lexicographic
/// `arm_key` order so equal scores resolve deterministically.
pub fn decide(
    campaign: &Campaign,
    arms: &[Arm],
    posteriors: &BTreeMap<ArmId, ArmPosterior>,
    agent: &mut dyn BanditAgent,
    mmm: &MmmAdjuster,
    ctx: &DecisionContext,
) -> Decision {
    let mut enabled: Vec<&Arm> = arms.iter().filter(|a| !a.disabled).collect();
    enabled.sort_by(|a, b| a.arm_key().cmp(&b.arm_key()).then(a.id.cmp(&b.id)));

    let disabled: Vec<&Arm> = arms.iter().filter(|a| a.disabled).collect();

    if enabled.is_empty() {
        let alloc: BTreeMap<ArmId, f64> = arms.iter().map(|a| (a.id, 0.0)).collect();
        return Decision {
            alloc,
            changes: Vec::new(),
            budget_scale: 1.0,
            completed: false,
        };
    }

    // Steps 1-3: sample, risk-filter, MMM-adjust, in stable arm order.
    let quarter = quarter_of(ctx.now);
    let mut scored: Vec<Scored<'_>> = Vec::with_capacity(enabled.len());
    for &arm in &enabled {
        let posterior = posteriors
            .get(&arm.id)
            .cloned()
            .unwrap_or_else(|| ArmPosterior::new(arm.id));
        let features = context_features(arm, &posterior, quarter);
        let theta = agent.sample(arm, &posterior, &features);

        let mut factors = BTreeMap::new();
        factors.insert("thompson".to_string(), ln_safe(theta));

        let risk_score = posterior.risk_score(campaign.variance_limit);
        let mut adjusted = theta * (1.0 - campaign.risk_tolerance * risk_score);
        if posterior.reward_variance() > campaign.variance_limit
            && posterior.trials < ctx.params.min_trials_for_risk_gate
        {
            // Exploration penalty, not exclusion: the arm still learns.
            adjusted *= 0.5;
        }
        factors.insert("risk".to_string(), ln_ratio(adjusted, theta));

        let m = mmm.multipliers(&arm.channel, ctx.now);
        adjusted *= m.product();
        factors.insert("mmm_seasonality".to_string(), ln_safe(m.seasonality));
        factors.insert("mmm_carryover".to_string(), ln_safe(m.carryover));

        let mut mmm_factors = BTreeMap::new();
        mmm_factors.insert("seasonality".to_string(), ln_safe(m.seasonality));
        mmm_factors.insert("carryover".to_string(), ln_safe(m.carryover));
        mmm_factors.insert("external".to_string(), ln_safe(m.external));

        scored.push(Scored {
            arm,
            posterior,
            adjusted: adjusted.max(0.0),
            factors,
            mmm_factors,
        });
    }

    // Step 4a: normalize, falling back to uniform when everything is
    // penalized to zero.
    let total: f64 = scored.iter().map(|s| s.adjusted).sum();
    let k = scored.len() as f64;
    let uniform_fallback = !(total > 0.0) || !total.is_finite();
    let mut alloc: Vec<f64> = if uniform_fallback {
        vec![1.0 / k; scored.len()]
    } else {
        scored.iter().map(|s| s.adjusted / total).collect()
    };

    // Step 4b: exploration floor, then renormalize.
    if ctx.params.min_alloc_floor > 0.0 {
        for a in alloc.iter_mut() {
            *a = a.max(ctx.params.min_alloc_floor);
        }
        let s: f64 = alloc.iter().sum();
        for a in alloc.iter_mut() {
            *a /= s;
        }
    }

    // Step 4c: bound per-arm movement, then renormalize.
    let pre_clip = alloc.clone();
    if !ctx.prev_alloc.is_empty() {
        for (i, s) in scored.iter().enumerate() {
            let old = ctx.prev_alloc.get(&s.arm.id).copied().unwrap_or(0.0);
            alloc[i] = alloc[i].clamp(old - ctx.params.max_step, old + ctx.params.max_step);
            alloc[i] = alloc[i].max(0.0);
        }
        let s: f64 = alloc.iter().sum();
        if s > 0.0 {
            for a in alloc.iter_mut() {
                *a /= s;
            }
        } else {
            for a in alloc.iter_mut() {
                *a = 1.0 / k;
            }
        }
    }
    for (i, s) in scored.iter_mut().enumerate() {
        s.factors
            .insert("step_clip".to_string(), ln_ratio(alloc[i], pre_clip[i]));
    }

    // Step 5: fit the remaining budget.
    let remaining = campaign.total_budget - ctx.spend_total;
    let mut budget_scale = 1.0;
    let mut completed = false;
    if remaining <= BUDGET_EPSILON {
        completed = true;
        budget_scale = 0.0;
        for a in alloc.iter_mut() {
            *a = 0.0;
        }
    } else if ctx.projected_cycle_cost > remaining && ctx.projected_cycle_cost > 0.0 {
        budget_scale = remaining / ctx.projected_cycle_cost;
        for a in alloc.iter_mut() {
            *a *= budget_scale;
        }
    }
    for s in scored.iter_mut() {
        s.factors
            .insert("budget_scale".to_string(), ln_safe(budget_scale));
    }

    let reason = if completed {
        "budget_exhausted"
    } else if budget_scale < 1.0 {
        "budget_scaled"
    } else if uniform_fallback {
        "uniform_fallback"
    } else {
        "decision_cycle"
    };

    // Step 6: emit changes for materially moved arms.
    let mut changes = Vec::new();
    let mut alloc_map: BTreeMap<ArmId, f64> = BTreeMap::new();
    for (i, s) in scored.iter().enumerate() {
        alloc_map.insert(s.arm.id, alloc[i]);
        let old = ctx.prev_alloc.get(&s.arm.id).copied().unwrap_or(0.0);
        if (alloc[i] - old).abs() >= ctx.params.report_threshold {
            changes.push(AllocationChange {
                id: 0,
                campaign_id: campaign.id,
                arm_id: s.arm.id,
                ts: ctx.now,
                old_alloc: old,
                new_alloc: alloc[i],
                reason: reason.to_string(),
                factors: s.factors.clone(),
                mmm_factors: s.mmm_factors.clone(),
                initiated_by: Initiator::Auto,
                state_snapshot: posterior_snapshot(&s.posterior, ctx.cycle_tick),
            });
        }
    }

    // Disabled arms stay pinned to zero; record the pin-down once.
    for &arm in &disabled {
        alloc_map.insert(arm.id, 0.0);
        let old = ctx.prev_alloc.get(&arm.id).copied().unwrap_or(0.0);
        if old.abs() >= ctx.params.report_threshold {
            changes.push(AllocationChange {
                id: 0,
                campaign_id: campaign.id,
                arm_id: arm.id,
                ts: ctx.now,
                old_alloc: old,
                new_alloc: 0.0,
                reason: "arm_disabled".to_string(),
                factors: BTreeMap::new(),
                mmm_factors: BTreeMap::new(),
                initiated_by: Initiator::Auto,
                state_snapshot: serde_json::Value::Null,
            });
        }
    }

    Decision {
        alloc: alloc_map,
        changes,
        budget_scale,
        completed,
    }
}

/// Whether a campaign is eligible for decision cycles at all.
pub fn cycle_eligible(campaign: &Campaign) -> bool {
    campaign.status == CampaignStatus::Active
}

fn posterior_snapshot(p: &ArmPosterior, cycle_tick: u64) -> serde_json::Value {
    serde_json::json!({
        "alpha": p.alpha,
        "beta": p.beta,
        "trials": p.trials,
        "spend": p.spend,
        "mean_reward": p.mean_reward(),
        "reward_variance": p.reward_variance(),
        "cycle_tick": cycle_tick,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmm::MmmAdjuster;
    use crate::thompson::ThompsonBernoulli;
    use adbandit_models::{MmmConfig, PrimaryKpi};
    use chrono::TimeZone;

    fn campaign(budget: f64) -> Campaign {
        Campaign {
            id: 1,
            name: "test".into(),
            total_budget: budget,
            start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            end: None,
            status: CampaignStatus::Active,
            primary_kpi: PrimaryKpi::Roas,
            risk_tolerance: 0.3,
            variance_limit: 0.1,
            cadence_ms: 900_000,
        }
    }

    fn arms(n: usize) -> Vec<Arm> {
        (0..n)
            .map(|i| {
                let mut a = Arm::new(1, "Google", "Search", format!("Creative {i}"), 1.0);
                a.id = i as i64 + 1;
                a
            })
            .collect()
    }

    fn posterior(id: ArmId, alpha: f64, beta: f64) -> ArmPosterior {
        let mut p = ArmPosterior::new(id);
        p.alpha = alpha;
        p.beta = beta;
        p.trials = ((alpha - 1.0) + (beta - 1.0)).round() as u64;
        p
    }

    fn ctx(tick: u64) -> DecisionContext {
        DecisionContext {
            now: Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap(),
            cycle_tick: tick,
            prev_alloc: BTreeMap::new(),
            spend_total: 0.0,
            projected_cycle_cost: 100.0,
            params: DecisionParams::default(),
        }
    }

    fn run(
        c: &Campaign,
        arms: &[Arm],
        posts: &BTreeMap<ArmId, ArmPosterior>,
        ctx: &DecisionContext,
    ) -> Decision {
        let mut agent = ThompsonBernoulli::with_seed(crate::cycle_seed(c.id, ctx.cycle_tick));
        let mmm = MmmAdjuster::new(MmmConfig::default());
        decide(c, arms, posts, &mut agent, &mmm, ctx)
    }

    #[test]
    fn allocation_sums_to_one() {
        let c = campaign(10_000.0);
        let arms = arms(5);
        let posts = BTreeMap::new();
        let d = run(&c, &arms, &posts, &ctx(1));
        let sum: f64 = d.alloc.values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum={sum}");
        assert_eq!(d.budget_scale, 1.0);
        assert!(!d.completed);
    }

    #[test]
    fn identical_seed_and_snapshot_reproduce_the_decision() {
        let c = campaign(10_000.0);
        let arms = arms(4);
        let mut posts = BTreeMap::new();
        posts.insert(1, posterior(1, 50.0, 950.0));
        posts.insert(2, posterior(2, 30.0, 970.0));
        let context = ctx(7);
        let a = run(&c, &arms, &posts, &context);
        let b = run(&c, &arms, &posts, &context);
        assert_eq!(a.alloc, b.alloc);
        assert_eq!(a.changes.len(), b.changes.len());
    }

    #[test]
    fn better_posterior_wins_allocation() {
        let c = campaign(10_000.0);
        let arms = arms(3);
        let mut posts = BTreeMap::new();
        // Conversion rates 5%, 3%, 1% over 10k trials each.
        posts.insert(1, posterior(1, 501.0, 9501.0));
        posts.insert(2, posterior(2, 301.0, 9701.0));
        posts.insert(3, posterior(3, 101.0, 9901.0));
        let d = run(&c, &arms, &posts, &ctx(3));
        assert!(d.alloc[&1] > d.alloc[&2]);
        assert!(d.alloc[&2] > d.alloc[&3]);
        assert!(d.alloc[&1] >= 0.5, "alloc(best)={}", d.alloc[&1]);
    }

    #[test]
    fn fresh_arm_keeps_exploration_floor() {
        let c = campaign(10_000.0);
        let arms = arms(3);
        let mut posts = BTreeMap::new();
        posts.insert(1, posterior(1, 900.0, 100.0));
        posts.insert(2, posterior(2, 800.0, 200.0));
        // Arm 3 has no posterior at all.
        let d = run(&c, &arms, &posts, &ctx(11));
        let floor = DecisionParams::default().min_alloc_floor;
        // Floor applies before the final renormalization; allow slack.
        assert!(d.alloc[&3] >= floor * 0.5, "alloc={}", d.alloc[&3]);
    }

    #[test]
    fn all_arms_penalized_engages_uniform_fallback() {
        let mut c = campaign(10_000.0);
        c.risk_tolerance = 1.0;
        c.variance_limit = 0.0;
        let arms = arms(4);
        let mut posts = BTreeMap::new();
        for id in 1..=4 {
            let mut p = posterior(id, 10.0, 10.0);
            // High reward dispersion: risk_score saturates at 1.0, so the
            // adjusted score is exactly zero for every arm.
            p.reward_sum = 100.0;
            p.reward_sq_sum = 10_000.0;
            posts.insert(id, p);
        }
        let d = run(&c, &arms, &posts, &ctx(5));
        for a in d.alloc.values() {
            assert!((a - 0.25).abs() < 1e-9);
        }
        assert_eq!(d.changes[0].reason, "uniform_fallback");
    }

    #[test]
    fn step_clip_bounds_movement_from_previous_allocation() {
        let c = campaign(10_000.0);
        let arms = arms(2);
        let mut posts = BTreeMap::new();
        posts.insert(1, posterior(1, 999.0, 1.0));
        posts.insert(2, posterior(2, 1.0, 999.0));
        let mut context = ctx(2);
        context.prev_alloc.insert(1, 0.5);
        context.prev_alloc.insert(2, 0.5);
        let d = run(&c, &arms, &posts, &context);
        // Raw Thompson would give arm 1 nearly everything; the clip holds
        // each arm within max_step of 0.5 before renormalization.
        let max_step = DecisionParams::default().max_step;
        assert!(d.alloc[&1] <= 0.5 + max_step + 1e-9);
        assert!(d.alloc[&2] >= 0.5 - max_step - 1e-9);
    }

    #[test]
    fn budget_scaling_matches_remaining_fraction() {
        let c = campaign(500.0);
        let arms = arms(3);
        let posts = BTreeMap::new();
        let mut context = ctx(4);
        context.spend_total = 450.0;
        context.projected_cycle_cost = 150.0;
        let d = run(&c, &arms, &posts, &context);
        assert!((d.budget_scale - 1.0 / 3.0).abs() < 1e-9);
        let sum: f64 = d.alloc.values().sum();
        assert!((sum - 1.0 / 3.0).abs() < 1e-9);
        assert!(!d.completed);
        assert_eq!(d.changes[0].reason, "budget_scaled");
    }

    #[test]
    fn exhausted_budget_completes_campaign_with_final_change() {
        let c = campaign(500.0);
        let arms = arms(2);
        let posts = BTreeMap::new();
        let mut context = ctx(9);
        context.spend_total = 500.0;
        context.prev_alloc.insert(1, 0.6);
        context.prev_alloc.insert(2, 0.4);
        let d = run(&c, &arms, &posts, &context);
        assert!(d.completed);
        assert_eq!(d.budget_scale, 0.0);
        assert!(d.alloc.values().all(|a| *a == 0.0));
        assert!(!d.changes.is_empty());
        assert_eq!(d.changes[0].reason, "budget_exhausted");
    }

    #[test]
    fn disabled_arm_is_pinned_to_zero() {
        let c = campaign(10_000.0);
        let mut arms = arms(3);
        arms[2].disabled = true;
        let mut context = ctx(6);
        context.prev_alloc.insert(3, 0.3);
        let d = run(&c, &arms, &BTreeMap::new(), &context);
        assert_eq!(d.alloc[&3], 0.0);
        assert!(d
            .changes
            .iter()
            .any(|ch| ch.arm_id == 3 && ch.reason == "arm_disabled"));
    }

    #[test]
    fn seasonality_shows_up_in_mmm_factors() {
        let c = campaign(10_000.0);
        let arms = arms(2);
        let mut mmm_cfg = MmmConfig::default();
        mmm_cfg
            .seasonality
            .entry("Q4".to_string())
            .or_default()
            .insert("Search".to_string(), 1.2);
        let mmm = MmmAdjuster::new(mmm_cfg);
        let mut context = ctx(8);
        context.now = Utc.with_ymd_and_hms(2026, 10, 2, 0, 0, 0).unwrap();
        let mut agent = ThompsonBernoulli::with_seed(1);
        let d = decide(&c, &arms, &BTreeMap::new(), &mut agent, &mmm, &context);
        let ch = &d.changes[0];
        assert!((ch.mmm_factors["seasonality"] - 1.2f64.ln()).abs() < 1e-9);
        assert!((ch.factors["mmm_seasonality"] - 1.2f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn changes_are_ordered_by_arm_key() {
        let c = campaign(10_000.0);
        let mut arm_list = arms(3);
        arm_list[0].creative = "Zebra".into();
        arm_list[2].creative = "Alpha".into();
        let d = run(&c, &arm_list, &BTreeMap::new(), &ctx(12));
        let keys: Vec<i64> = d.changes.iter().map(|ch| ch.arm_id).collect();
        // Alpha (id 3) sorts before Creative 1 (id 2) before Zebra (id 1).
        assert_eq!(keys, vec![3, 2, 1]);
    }
}
