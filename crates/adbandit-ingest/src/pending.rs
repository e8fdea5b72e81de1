//! Bounded intake queue between ingestion and the decision loop.
//!
//! Drop policy under backpressure: oldest webhook entries go first (they
//! are hints), poll results are never evicted. When no webhook entry can
//! be evicted the push is rejected and the caller signals backpressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use adbandit_models::{CampaignId, Metric, MetricSource};

/// One validated metric waiting for posterior application.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMetric {
    pub campaign_id: CampaignId,
    pub metric: Metric,
}

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest webhook entry.
    QueuedAfterDrop,
    /// Queue full of poll entries; the caller must handle the item itself.
    RejectedFull,
}

/// Fixed-capacity FIFO with the webhook-first eviction policy.
pub struct PendingQueue {
    inner: Mutex<VecDeque<PendingMetric>>,
    capacity: usize,
    dropped_webhooks: AtomicU64,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped_webhooks: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: PendingMetric) -> PushOutcome {
        let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if q.len() < self.capacity {
            q.push_back(item);
            return PushOutcome::Queued;
        }
        // Evict the oldest webhook entry if one exists.
        if let Some(pos) = q
            .iter()
            .position(|p| p.metric.source == MetricSource::Webhook)
        {
            q.remove(pos);
            self.dropped_webhooks.fetch_add(1, Ordering::Relaxed);
            q.push_back(item);
            return PushOutcome::QueuedAfterDrop;
        }
        PushOutcome::RejectedFull
    }

    /// Remove up to `max` entries for one campaign, oldest first.
    /// Non-blocking.
    pub fn drain_for(&self, campaign_id: CampaignId, max: usize) -> Vec<PendingMetric> {
        let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        let mut i = 0;
        while i < q.len() && out.len() < max {
            if q[i].campaign_id == campaign_id {
                if let Some(item) = q.remove(i) {
                    out.push(item);
                    continue;
                }
            }
            i += 1;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_webhooks(&self) -> u64 {
        self.dropped_webhooks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbandit_models::MetricQuality;
    use chrono::Utc;

    fn item(campaign_id: CampaignId, arm_id: i64, source: MetricSource) -> PendingMetric {
        PendingMetric {
            campaign_id,
            metric: Metric {
                arm_id,
                ts: Utc::now(),
                impressions: 10,
                clicks: 1,
                conversions: 0,
                cost: 1.0,
                revenue: 0.0,
                source,
                quality: MetricQuality::Ok,
            },
        }
    }

    #[test]
    fn webhook_entries_are_evicted_before_poll_entries() {
        let q = PendingQueue::new(3);
        q.push(item(1, 1, MetricSource::Poll));
        q.push(item(1, 2, MetricSource::Webhook));
        q.push(item(1, 3, MetricSource::Poll));
        let outcome = q.push(item(1, 4, MetricSource::Poll));
        assert_eq!(outcome, PushOutcome::QueuedAfterDrop);
        assert_eq!(q.dropped_webhooks(), 1);
        let drained = q.drain_for(1, 10);
        assert!(drained.iter().all(|p| p.metric.arm_id != 2));
    }

    #[test]
    fn full_queue_of_poll_entries_rejects() {
        let q = PendingQueue::new(2);
        q.push(item(1, 1, MetricSource::Poll));
        q.push(item(1, 2, MetricSource::Poll));
        assert_eq!(q.push(item(1, 3, MetricSource::Poll)), PushOutcome::RejectedFull);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn drain_is_per_campaign_and_bounded() {
        let q = PendingQueue::new(10);
        q.push(item(1, 1, MetricSource::Poll));
        q.push(item(2, 2, MetricSource::Poll));
        q.push(item(1, 3, MetricSource::Poll));
        q.push(item(1, 4, MetricSource::Poll));
        let drained = q.drain_for(1, 2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].metric.arm_id, 1);
        assert_eq!(drained[1].metric.arm_id, 3);
        // Campaign 2's entry and the overflow item remain.
        assert_eq!(q.len(), 2);
    }
}
