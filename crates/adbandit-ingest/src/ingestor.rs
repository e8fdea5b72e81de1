//! The single validation pipeline both intake paths feed.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use adbandit_connectors::NormalizedMetric;
use adbandit_models::{
    arm_key_of, AllocationChange, ArmId, CampaignId, Initiator, Metric, MetricQuality,
    MetricSource, PosteriorUpdate,
};
use adbandit_store::{PosteriorStore, RecordOutcome};

use crate::pending::{PendingMetric, PendingQueue, PushOutcome};
use crate::validate::MetricValidator;
use crate::IngestError;

/// Days of history backing the anomaly baseline.
const BASELINE_DAYS: i64 = 7;

/// Bound on the hint-applied marker set.
const MAX_HINT_MARKERS: usize = 10_000;

/// What happened to an ingested metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Persisted and queued for the next cycle's posterior batch.
    Recorded,
    /// Persisted with `quality=suspect`; excluded from posterior updates.
    RecordedSuspect,
    /// Idempotency key already present; nothing changed.
    Duplicate,
    /// Webhook hint exceeded the threshold: posterior updated out-of-cycle.
    HintApplied,
}

/// Validates, dedups, persists, and stages posterior updates.
pub struct Ingestor {
    store: Arc<PosteriorStore>,
    validator: MetricValidator,
    queue: Arc<PendingQueue>,
    max_trials_per_cycle: u64,
    webhook_hint_threshold: f64,
    /// Windows already applied via the webhook hint path; the authoritative
    /// poll row for the same window skips its posterior contribution.
    hint_applied: Mutex<HashSet<(ArmId, i64)>>,
}

impl Ingestor {
    pub fn new(
        store: Arc<PosteriorStore>,
        validator: MetricValidator,
        queue: Arc<PendingQueue>,
        max_trials_per_cycle: u64,
        webhook_hint_threshold: f64,
    ) -> Self {
        Self {
            store,
            validator,
            queue,
            max_trials_per_cycle,
            webhook_hint_threshold,
            hint_applied: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Resolve a normalized payload to its arm and ingest it.
    pub fn ingest_normalized(&self, nm: NormalizedMetric) -> Result<IngestOutcome, IngestError> {
        let key = arm_key_of(&nm.platform, &nm.channel, &nm.creative, nm.bid);
        let (campaign_id, arm_id) = self
            .store
            .resolve_arm(&key)?
            .ok_or_else(|| IngestError::UnknownArm(key))?;
        let metric = Metric {
            arm_id,
            ts: nm.ts,
            impressions: nm.impressions,
            clicks: nm.clicks,
            conversions: nm.conversions,
            cost: nm.cost,
            revenue: nm.revenue,
            source: MetricSource::Webhook,
            quality: MetricQuality::Ok,
        };
        self.ingest(campaign_id, metric)
    }

    /// Run one candidate through validation, dedup, and staging.
    pub fn ingest(
        &self,
        campaign_id: CampaignId,
        mut metric: Metric,
    ) -> Result<IngestOutcome, IngestError> {
        // V1/V2: hard rules reject outright, no state change.
        metric.validate()?;

        // V3/V4: plausibility and anomaly assessment against the rolling
        // baseline. Flags mark, never drop.
        let since = metric.ts - ChronoDuration::days(BASELINE_DAYS);
        let history = self.store.metric_history(metric.arm_id, since)?;
        let assessment = self.validator.assess(&metric, &history);
        metric.quality = assessment.quality;

        match self.store.record_metric(&metric)? {
            RecordOutcome::DuplicateIgnored => return Ok(IngestOutcome::Duplicate),
            RecordOutcome::Inserted => {}
        }

        if metric.quality == MetricQuality::Suspect {
            let detail = assessment.flags.join("; ");
            warn!(arm_id = metric.arm_id, %detail, "metric flagged suspect");
            self.record_ingest_note(
                campaign_id,
                metric.arm_id,
                format!("metric_flagged_suspect: {detail}"),
            )?;
            return Ok(IngestOutcome::RecordedSuspect);
        }

        if metric.source == MetricSource::Webhook {
            return self.stage_webhook(campaign_id, metric);
        }

        // Poll and backfill rows are authoritative; they are never dropped.
        let item = PendingMetric { campaign_id, metric };
        match self.queue.push(item.clone()) {
            PushOutcome::Queued | PushOutcome::QueuedAfterDrop => Ok(IngestOutcome::Recorded),
            PushOutcome::RejectedFull => {
                // Bypass the queue rather than lose an authoritative row.
                debug!(queue_len = self.queue.len(), "intake queue full, applying poll row directly");
                self.apply_one(std::slice::from_ref(&item))?;
                Ok(IngestOutcome::Recorded)
            }
        }
    }

    fn stage_webhook(
        &self,
        campaign_id: CampaignId,
        metric: Metric,
    ) -> Result<IngestOutcome, IngestError> {
        let posterior = self.store.get_posterior(metric.arm_id)?;
        let baseline = posterior.as_ref().map(|p| p.mean_reward()).unwrap_or(0.0);
        let delta = (metric.roas() - baseline).abs();
        if delta > self.webhook_hint_threshold {
            let update = PosteriorUpdate::from_window(
                metric.conversions,
                metric.clicks,
                metric.cost,
                metric.revenue,
                self.max_trials_per_cycle,
            );
            self.store.update_posterior(metric.arm_id, &update)?;
            self.mark_hint_applied(metric.arm_id, metric.ts.timestamp_micros());
            info!(
                arm_id = metric.arm_id,
                delta, "webhook hint triggered out-of-cycle posterior update"
            );
            return Ok(IngestOutcome::HintApplied);
        }
        // Below the threshold the row is informational; it may be evicted
        // under backpressure.
        self.queue.push(PendingMetric { campaign_id, metric });
        Ok(IngestOutcome::Recorded)
    }

    fn mark_hint_applied(&self, arm_id: ArmId, ts_us: i64) {
        let mut markers = self.hint_applied.lock().unwrap_or_else(|p| p.into_inner());
        if markers.len() >= MAX_HINT_MARKERS {
            markers.clear();
        }
        markers.insert((arm_id, ts_us));
    }

    fn consume_hint_marker(&self, arm_id: ArmId, ts_us: i64) -> bool {
        self.hint_applied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(arm_id, ts_us))
    }

    /// Drain pending metrics for one campaign. Non-blocking, bounded batch.
    pub fn drain_for(&self, campaign_id: CampaignId, max: usize) -> Vec<PendingMetric> {
        self.queue.drain_for(campaign_id, max)
    }

    /// Apply a drained batch to the posteriors, one store transaction per
    /// arm. Only authoritative rows (poll, backfill) contribute; webhook
    /// entries below the hint threshold were informational.
    pub fn apply_pending(&self, batch: &[PendingMetric]) -> Result<usize, IngestError> {
        self.apply_one(batch)
    }

    fn apply_one(&self, batch: &[PendingMetric]) -> Result<usize, IngestError> {
        let mut per_arm: BTreeMap<ArmId, PosteriorUpdate> = BTreeMap::new();
        for item in batch {
            let m = &item.metric;
            if m.quality == MetricQuality::Suspect {
                continue;
            }
            if m.source == MetricSource::Webhook {
                continue;
            }
            if self.consume_hint_marker(m.arm_id, m.ts.timestamp_micros()) {
                debug!(arm_id = m.arm_id, "window already applied via webhook hint");
                continue;
            }
            let update = PosteriorUpdate::from_window(
                m.conversions,
                m.clicks,
                m.cost,
                m.revenue,
                self.max_trials_per_cycle,
            );
            per_arm
                .entry(m.arm_id)
                .and_modify(|u| u.merge(&update))
                .or_insert(update);
        }
        let mut applied = 0;
        for (arm_id, update) in per_arm {
            self.store.update_posterior(arm_id, &update)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Record a non-local ingest problem to the change log so the dashboard
    /// can surface it without guessing.
    pub fn record_ingest_note(
        &self,
        campaign_id: CampaignId,
        arm_id: ArmId,
        reason: String,
    ) -> Result<(), IngestError> {
        let change = AllocationChange {
            id: 0,
            campaign_id,
            arm_id,
            ts: Utc::now(),
            old_alloc: 0.0,
            new_alloc: 0.0,
            reason,
            factors: BTreeMap::new(),
            mmm_factors: BTreeMap::new(),
            initiated_by: Initiator::Auto,
            state_snapshot: serde_json::Value::Null,
        };
        self.store.append_change(&change)?;
        Ok(())
    }
}
