//! The supervisor task: campaign lifecycle, intake tasks, webhook server,
//! crash reconciliation, and the graceful drain.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use adbandit_connectors::PlatformCredentials;
use adbandit_ingest::{serve_webhooks, PlatformPoller, WebhookState};
use adbandit_models::{CampaignId, CampaignStatus};

use crate::cycle::{bid_from_alloc, cycle_loop, record_error_change};
use crate::engine::Engine;

/// Lifecycle scan interval.
const SUPERVISOR_TICK: Duration = Duration::from_secs(5);

/// Lifecycle scans between change-log retention sweeps (~1h).
const SWEEP_EVERY_TICKS: u64 = 720;

pub struct Supervisor {
    engine: Arc<Engine>,
}

impl Supervisor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Re-issue journaled bid intentions from a previous crash. `set_bid`
    /// is idempotent by `(arm_binding, bid)`, so re-applying an already
    /// confirmed bid is harmless. Runs before the first new cycle.
    pub async fn reconcile_journal(&self) -> anyhow::Result<usize> {
        let engine = &self.engine;
        let mut reissued = 0usize;
        for campaign_id in engine.store.campaigns_with_intended()? {
            let state = engine.store.load_campaign(campaign_id)?;
            let intents = engine.store.take_intended(campaign_id)?;
            let enabled_arms = state.arms.iter().filter(|a| !a.disabled).count();
            info!(
                campaign_id,
                intents = intents.len(),
                "reconciling journaled allocation from previous run"
            );
            for (arm_id, alloc) in intents {
                let Some(arm) = state.arms.iter().find(|a| a.id == arm_id) else {
                    continue;
                };
                let Some(platform) = engine.platform(&arm.platform) else {
                    continue;
                };
                let binding = adbandit_connectors::ArmBinding {
                    arm_id: arm.id,
                    arm_key: arm.arm_key(),
                    channel: arm.channel.clone(),
                    creative: arm.creative.clone(),
                    bid: arm.bid,
                };
                let bid = bid_from_alloc(arm.bid, alloc, enabled_arms);
                match platform.set_bid(&binding, bid).await {
                    Ok(()) => reissued += 1,
                    Err(e) => {
                        warn!(campaign_id, arm_id, error = %e, "reconcile set_bid failed")
                    }
                }
            }
            record_error_change(
                engine,
                campaign_id,
                "reconciled_intended_allocation".to_string(),
            )
            .map_err(|e| anyhow::anyhow!("recording reconcile note: {e}"))?;
        }
        Ok(reissued)
    }

    /// Run until Ctrl-C, then drain.
    pub async fn run(self) -> anyhow::Result<()> {
        let signal = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        self.run_until(signal).await
    }

    /// Run until `shutdown` resolves, then drain: cycle tasks finish their
    /// current iteration or are cancelled at the drain timeout, then the
    /// store flushes.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let engine = self.engine.clone();
        let (shutdown_tx, _) = broadcast::channel::<()>(8);

        // Boot: reconcile any journaled intentions before ticking.
        let reissued = self.reconcile_journal().await?;
        if reissued > 0 {
            info!(reissued, "crash reconciliation re-issued bids");
        }

        // Webhook server, when any platform has a secret configured.
        let mut secrets = HashMap::new();
        for (name, _) in engine.platforms() {
            if let Some(creds) = PlatformCredentials::from_env(name) {
                if let Some(secret) = creds.webhook_secret {
                    secrets.insert(name.clone(), secret);
                }
            }
        }
        let mut service_tasks: Vec<JoinHandle<()>> = Vec::new();
        if !secrets.is_empty() {
            let state = Arc::new(WebhookState::new(engine.ingestor.clone(), secrets));
            let port = engine.cfg.webhook_port;
            service_tasks.push(tokio::spawn(async move {
                if let Err(e) = serve_webhooks(state, port).await {
                    error!(error = %e, "webhook server exited");
                }
            }));
        }

        // One intake task per configured platform.
        for (name, platform) in engine.platforms() {
            if PlatformCredentials::from_env(name).is_none() && name != "sim" {
                info!(platform = %name, "no credentials, poller disabled");
                continue;
            }
            service_tasks.push(tokio::spawn(poll_loop(
                engine.clone(),
                platform.clone(),
                name.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        // Cycle tasks for campaigns that are Active now or become Active.
        let mut cycle_tasks: HashMap<CampaignId, JoinHandle<()>> = HashMap::new();
        let mut scan_count: u64 = 0;

        tokio::pin!(shutdown);
        loop {
            self.spawn_missing_cycles(&mut cycle_tasks, &shutdown_tx)?;
            scan_count += 1;
            if scan_count % SWEEP_EVERY_TICKS == 0 {
                if let Err(e) = engine.store.sweep_changes(engine.cfg.retention_days) {
                    warn!(error = %e, "retention sweep failed");
                }
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(SUPERVISOR_TICK) => {}
            }
        }

        // Drain.
        info!("shutdown requested, draining cycle tasks");
        let _ = shutdown_tx.send(());
        let drain_deadline = tokio::time::Instant::now() + engine.cfg.drain_timeout();
        for (campaign_id, mut handle) in cycle_tasks {
            match tokio::time::timeout_at(drain_deadline, &mut handle).await {
                Ok(_) => debug!(campaign_id, "cycle task drained"),
                Err(_) => {
                    // The intended allocation was journaled before any bid
                    // went out; the next start reconciles it.
                    handle.abort();
                    warn!(campaign_id, "drain timeout, cancelled cycle task");
                }
            }
        }
        for task in service_tasks {
            task.abort();
        }
        engine.store.flush()?;
        info!("engine stopped");
        Ok(())
    }

    /// Spawn cycle tasks for Active campaigns that have none running.
    /// Store unavailability here is fatal: the process exits non-zero so
    /// the orchestrator restarts it.
    fn spawn_missing_cycles(
        &self,
        cycle_tasks: &mut HashMap<CampaignId, JoinHandle<()>>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> anyhow::Result<()> {
        cycle_tasks.retain(|_, handle| !handle.is_finished());
        let campaigns = self.engine.store.resumable_campaigns()?;
        for campaign in campaigns {
            if campaign.status == CampaignStatus::Active
                && !cycle_tasks.contains_key(&campaign.id)
            {
                info!(campaign_id = campaign.id, name = %campaign.name, "starting cycle task");
                cycle_tasks.insert(
                    campaign.id,
                    tokio::spawn(cycle_loop(
                        self.engine.clone(),
                        campaign.id,
                        shutdown_tx.subscribe(),
                    )),
                );
            }
        }
        Ok(())
    }
}

/// Intake loop for one platform: poll every campaign's bindings at the
/// default cadence, paced by the platform's token bucket.
async fn poll_loop(
    engine: Arc<Engine>,
    platform: Arc<dyn adbandit_connectors::AdPlatform>,
    name: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = Duration::from_millis(engine.cfg.cycle_default_ms.max(1000) as u64);
    let poller = PlatformPoller::new(
        platform,
        engine.ingestor.clone(),
        engine.cfg.poll_rate(&name),
        engine.cfg.fetch_timeout(),
        "default",
    );
    let mut since = Utc::now() - ChronoDuration::milliseconds(engine.cfg.cycle_default_ms);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(platform = %name, "poll task drained");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        let window_start = since;
        since = Utc::now();
        let campaigns = match engine.store.resumable_campaigns() {
            Ok(c) => c,
            Err(e) => {
                error!(platform = %name, error = %e, "store unreachable in poll loop");
                return;
            }
        };
        for campaign in campaigns.iter().filter(|c| c.status == CampaignStatus::Active) {
            let arms = match engine.store.arms_for_campaign(campaign.id) {
                Ok(a) => a,
                Err(e) => {
                    warn!(campaign_id = campaign.id, error = %e, "cannot load arms");
                    continue;
                }
            };
            let bindings = engine.bindings_for(arms.iter(), &name);
            if bindings.is_empty() {
                continue;
            }
            match poller.poll_once(campaign.id, &bindings, window_start).await {
                Ok(n) => debug!(platform = %name, campaign_id = campaign.id, n, "polled"),
                Err(e) => warn!(platform = %name, campaign_id = campaign.id, error = %e, "poll failed"),
            }
        }
    }
}
