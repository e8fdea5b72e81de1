//! Per-campaign decision cycle.
//!
//! One cycle: drain fresh metrics, fold them into the posteriors, snapshot,
//! decide, journal the intended allocation, push bids out, log the changes.
//! Cycles for one campaign are strictly sequential; a slow cycle delays the
//! next tick rather than overlapping it.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use adbandit_connectors::{ArmBinding, PlatformError};
use adbandit_decision::{
    cycle_seed, decide, BanditAgent, DecisionContext, DecisionParams, MmmAdjuster,
    ThompsonBernoulli,
};
use adbandit_ingest::{retry_with_backoff, BackoffPolicy};
use adbandit_models::{
    AllocationChange, Arm, ArmId, CampaignId, CampaignStatus, ErrorClass, Initiator, MmmConfig,
};

use crate::engine::Engine;
use crate::CycleError;

/// Bounded batch of pending metrics folded in per cycle.
const MAX_DRAIN: usize = 1024;

/// Spend slack tolerated before the budget invariant counts as breached.
const BUDGET_SLACK: f64 = 1e-6;

/// What a cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Decision applied; count of emitted changes.
    Applied { changes: usize },
    /// Campaign was not Active; nothing decided.
    Skipped(CampaignStatus),
    /// Budget exhausted; campaign transitioned to Completed.
    Completed,
}

/// Mutable per-campaign state owned by its cycle task.
pub struct CampaignRuntime {
    pub campaign_id: CampaignId,
    tick: u64,
    prev_alloc: BTreeMap<ArmId, f64>,
    agent: Box<dyn BanditAgent>,
    mmm: MmmAdjuster,
    last_spend_total: Option<f64>,
    last_cycle_cost: f64,
}

impl CampaignRuntime {
    pub fn new(campaign_id: CampaignId, mmm_cfg: MmmConfig) -> Self {
        Self {
            campaign_id,
            tick: 0,
            prev_alloc: BTreeMap::new(),
            agent: Box::new(ThompsonBernoulli::with_seed(0)),
            mmm: MmmAdjuster::new(mmm_cfg),
            last_spend_total: None,
            last_cycle_cost: 0.0,
        }
    }

    /// Swap in a different bandit policy (e.g. contextual LinUCB).
    pub fn with_agent(mut self, agent: Box<dyn BanditAgent>) -> Self {
        self.agent = agent;
        self
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn prev_alloc(&self) -> &BTreeMap<ArmId, f64> {
        &self.prev_alloc
    }
}

fn binding_of(arm: &Arm) -> ArmBinding {
    ArmBinding {
        arm_id: arm.id,
        arm_key: arm.arm_key(),
        channel: arm.channel.clone(),
        creative: arm.creative.clone(),
        bid: arm.bid,
    }
}

/// Effective platform bid for an allocation share: the arm's base bid
/// scaled by its share relative to a uniform split, so a uniform
/// allocation leaves base bids untouched.
pub fn bid_from_alloc(base_bid: f64, alloc: f64, enabled_arms: usize) -> f64 {
    (base_bid * alloc * enabled_arms.max(1) as f64).max(0.0)
}

/// Run exactly one decision cycle for a campaign.
pub async fn run_cycle(
    engine: &Engine,
    rt: &mut CampaignRuntime,
) -> Result<CycleOutcome, CycleError> {
    let campaign_id = rt.campaign_id;

    // Observe: fold the fresh batch in first so the decision sees either
    // the full update from this cycle or none of it.
    let fresh = engine.ingestor.drain_for(campaign_id, MAX_DRAIN);
    if !fresh.is_empty() {
        let applied = engine.ingestor.apply_pending(&fresh)?;
        debug!(campaign_id, batch = fresh.len(), applied, "applied pending metrics");
    }

    let snap = engine.store.snapshot(campaign_id)?;
    if snap.campaign.status != CampaignStatus::Active {
        return Ok(CycleOutcome::Skipped(snap.campaign.status));
    }

    let spend_total = snap.spend_total();
    if spend_total > snap.campaign.total_budget + BUDGET_SLACK {
        let detail = format!(
            "spend {spend_total:.2} exceeds budget {:.2}",
            snap.campaign.total_budget
        );
        engine
            .store
            .update_campaign_status(campaign_id, CampaignStatus::Errored)?;
        record_error_change(engine, campaign_id, format!("invariant_breach: {detail}"))?;
        return Err(CycleError::InvariantBreach(detail));
    }

    // Project the coming cycle's cost from the last observed cycle delta.
    if let Some(prev) = rt.last_spend_total {
        let delta = (spend_total - prev).max(0.0);
        if delta > 0.0 {
            rt.last_cycle_cost = delta;
        }
    }
    rt.last_spend_total = Some(spend_total);

    // Decide.
    rt.agent.reseed(cycle_seed(campaign_id, rt.tick));
    let ctx = DecisionContext {
        now: Utc::now(),
        cycle_tick: rt.tick,
        prev_alloc: rt.prev_alloc.clone(),
        spend_total,
        projected_cycle_cost: rt.last_cycle_cost,
        params: DecisionParams::from_config(&engine.cfg),
    };
    let decision = decide(
        &snap.campaign,
        &snap.arms,
        &snap.posteriors,
        rt.agent.as_mut(),
        &rt.mmm,
        &ctx,
    );

    // Journal the intent before the first outbound call, so a crash
    // mid-apply reconciles on restart.
    let intents: Vec<(ArmId, f64)> = decision.alloc.iter().map(|(k, v)| (*k, *v)).collect();
    engine.store.journal_intended(campaign_id, &intents, ctx.now)?;

    // Apply, then log, per changed arm.
    let enabled_arms = snap.arms.iter().filter(|a| !a.disabled).count();
    let mut all_applied = true;
    for change in &decision.changes {
        let arm = snap.arms.iter().find(|a| a.id == change.arm_id);
        let applied = match arm {
            Some(arm) => match apply_bid(engine, arm, change.new_alloc, enabled_arms).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(campaign_id, arm_id = change.arm_id, error = %e, "bid update failed");
                    all_applied = false;
                    false
                }
            },
            None => false,
        };
        if applied {
            engine.store.append_change(change)?;
        }
    }

    if all_applied {
        // Every intended bid is confirmed; the journal entry has served
        // its purpose.
        engine.store.take_intended(campaign_id)?;
    }

    // Feed the ad-stock with this cycle's spend share per channel.
    let mut per_channel: BTreeMap<String, f64> = BTreeMap::new();
    for arm in snap.arms.iter().filter(|a| !a.disabled) {
        let share = decision.alloc.get(&arm.id).copied().unwrap_or(0.0);
        *per_channel.entry(arm.channel.clone()).or_insert(0.0) += share;
    }
    for (channel, share) in per_channel {
        rt.mmm.observe_spend(&channel, share);
    }

    rt.prev_alloc = decision.alloc.clone();
    rt.tick += 1;

    if decision.completed {
        engine
            .store
            .update_campaign_status(campaign_id, CampaignStatus::Completed)?;
        info!(campaign_id, "budget exhausted, campaign completed");
        return Ok(CycleOutcome::Completed);
    }
    Ok(CycleOutcome::Applied {
        changes: decision.changes.len(),
    })
}

/// One bid update with deadline, pacing permit, and bounded retries.
async fn apply_bid(
    engine: &Engine,
    arm: &Arm,
    alloc: f64,
    enabled_arms: usize,
) -> Result<(), CycleError> {
    let Some(platform) = engine.platform(&arm.platform) else {
        // No connector bound: the allocation is still recorded; only the
        // outbound call is skipped.
        debug!(platform = %arm.platform, "no connector registered, skipping bid update");
        return Ok(());
    };
    let permit = match engine.platform_permit(&arm.platform) {
        Some(sem) => Some(sem.clone().acquire_owned().await.map_err(|_| {
            CycleError::Platform(PlatformError::Transient("permit pool closed".into()))
        })?),
        None => None,
    };

    let new_bid = bid_from_alloc(arm.bid, alloc, enabled_arms);
    let binding = binding_of(arm);
    let deadline = engine.cfg.bid_timeout();
    let platform = platform.clone();
    let policy = BackoffPolicy {
        base: Duration::from_millis(500),
        max_retries: 2,
        ..BackoffPolicy::default()
    };
    let result = retry_with_backoff(policy, "set_bid", move || {
        let platform = platform.clone();
        let binding = binding.clone();
        async move {
            match tokio::time::timeout(deadline, platform.set_bid(&binding, new_bid)).await {
                Ok(r) => r,
                Err(_) => Err(PlatformError::Timeout(deadline)),
            }
        }
    })
    .await;
    drop(permit);
    result.map_err(CycleError::Platform)
}

/// Record a non-local error to the change log so the dashboard can render
/// it without guessing.
pub(crate) fn record_error_change(
    engine: &Engine,
    campaign_id: CampaignId,
    reason: String,
) -> Result<(), CycleError> {
    let change = AllocationChange {
        id: 0,
        campaign_id,
        arm_id: 0,
        ts: Utc::now(),
        old_alloc: 0.0,
        new_alloc: 0.0,
        reason,
        factors: BTreeMap::new(),
        mmm_factors: BTreeMap::new(),
        initiated_by: Initiator::Auto,
        state_snapshot: serde_json::Value::Null,
    };
    engine.store.append_change(&change)?;
    Ok(())
}

/// Concurrency failures retry once with a fresh snapshot; the second
/// failure propagates for escalation.
pub async fn run_cycle_with_retry(
    engine: &Engine,
    rt: &mut CampaignRuntime,
) -> Result<CycleOutcome, CycleError> {
    match run_cycle(engine, rt).await {
        Err(e) if e.class() == ErrorClass::Concurrency => {
            warn!(campaign_id = rt.campaign_id, "lock wait timed out, retrying cycle once");
            run_cycle(engine, rt).await
        }
        other => other,
    }
}

/// The long-running loop driving one campaign at its cadence.
///
/// Pausing skips ticks without tearing the task down; terminal states end
/// it. A cycle overrunning the cadence logs a warning and the next cycle
/// starts immediately; ticks are never queued.
pub async fn cycle_loop(
    engine: Arc<Engine>,
    campaign_id: CampaignId,
    mut shutdown: broadcast::Receiver<()>,
) {
    let campaign = match engine.store.get_campaign(campaign_id) {
        Ok(c) => c,
        Err(e) => {
            error!(campaign_id, error = %e, "cannot load campaign, cycle task exiting");
            return;
        }
    };
    let cadence = campaign.cadence();
    let mut rt = CampaignRuntime::new(campaign_id, engine.cfg.mmm.clone());
    let mut wait = Duration::ZERO;

    loop {
        if wait.is_zero() {
            // Overrun path: still honor a pending shutdown signal.
            if shutdown.try_recv().is_ok() {
                info!(campaign_id, "cycle task drained");
                return;
            }
        } else {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(campaign_id, "cycle task drained");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let Ok(_permit) = engine.cycle_permits.acquire().await else {
            return;
        };
        let started = Instant::now();
        match run_cycle_with_retry(&engine, &mut rt).await {
            Ok(CycleOutcome::Applied { changes }) => {
                debug!(campaign_id, changes, tick = rt.tick(), "cycle applied");
            }
            Ok(CycleOutcome::Skipped(status)) => {
                if status.is_terminal() {
                    info!(campaign_id, %status, "campaign reached terminal state");
                    return;
                }
                debug!(campaign_id, %status, "campaign not active, skipping tick");
            }
            Ok(CycleOutcome::Completed) => return,
            Err(e) => match e.class() {
                ErrorClass::Concurrency | ErrorClass::InvariantBreach => {
                    error!(campaign_id, error = %e, "escalating campaign to errored");
                    if e.class() == ErrorClass::Concurrency {
                        let _ = engine
                            .store
                            .update_campaign_status(campaign_id, CampaignStatus::Errored);
                        let _ = record_error_change(
                            &engine,
                            campaign_id,
                            format!("concurrency_escalation: {e}"),
                        );
                    }
                    return;
                }
                ErrorClass::Fatal => {
                    error!(campaign_id, error = %e, "store unreachable, cycle task exiting");
                    return;
                }
                _ => {
                    // Transient and permanent I/O recover locally; the next
                    // tick proceeds.
                    warn!(campaign_id, error = %e, "cycle error, continuing");
                }
            },
        }

        let elapsed = started.elapsed();
        if elapsed > cadence {
            warn!(
                campaign_id,
                elapsed_ms = elapsed.as_millis() as u64,
                cadence_ms = cadence.as_millis() as u64,
                "cycle overran its cadence, proceeding immediately"
            );
            wait = Duration::ZERO;
        } else {
            wait = cadence - elapsed;
        }
    }
}
