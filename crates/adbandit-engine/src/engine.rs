//! The top-level engine value.
//!
//! Everything that used to be a process-wide singleton in systems like this
//! (config, store handle, platform registry) is an explicit field here,
//! constructed once at boot and threaded into each component.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use adbandit_connectors::{AdPlatform, ArmBinding};
use adbandit_ingest::{Ingestor, MetricValidator, PendingQueue};
use adbandit_models::{Arm, EngineConfig};
use adbandit_store::PosteriorStore;

pub struct Engine {
    pub cfg: EngineConfig,
    pub store: Arc<PosteriorStore>,
    pub ingestor: Arc<Ingestor>,
    platforms: HashMap<String, Arc<dyn AdPlatform>>,
    /// Caps concurrently running cycle tasks.
    pub cycle_permits: Arc<Semaphore>,
    /// Caps concurrent in-flight calls per platform.
    platform_permits: HashMap<String, Arc<Semaphore>>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, store: Arc<PosteriorStore>) -> Self {
        let queue = Arc::new(PendingQueue::new(cfg.pending_capacity));
        let validator = MetricValidator {
            anomaly_z: cfg.anomaly_z,
            roas_max: cfg.roas_plausible_max,
            ..MetricValidator::default()
        };
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            validator,
            queue,
            cfg.max_trials_per_cycle,
            cfg.webhook_hint_threshold,
        ));
        let cycle_permits = Arc::new(Semaphore::new(cfg.effective_cycle_cap()));
        Self {
            cfg,
            store,
            ingestor,
            platforms: HashMap::new(),
            cycle_permits,
            platform_permits: HashMap::new(),
        }
    }

    /// Register a platform connector under its stable name.
    pub fn register_platform(&mut self, platform: Arc<dyn AdPlatform>) {
        let name = platform.name().to_string();
        self.platform_permits.insert(
            name.clone(),
            Arc::new(Semaphore::new(self.cfg.platform_concurrency)),
        );
        self.platforms.insert(name, platform);
    }

    pub fn platform(&self, name: &str) -> Option<&Arc<dyn AdPlatform>> {
        self.platforms.get(name)
    }

    pub fn platforms(&self) -> impl Iterator<Item = (&String, &Arc<dyn AdPlatform>)> {
        self.platforms.iter()
    }

    pub fn platform_permit(&self, name: &str) -> Option<&Arc<Semaphore>> {
        self.platform_permits.get(name)
    }

    /// Bindings for the subset of a campaign's arms served by one platform.
    pub fn bindings_for<'a>(
        &self,
        arms: impl IntoIterator<Item = &'a Arm>,
        platform: &str,
    ) -> Vec<ArmBinding> {
        arms.into_iter()
            .filter(|a| a.platform == platform && !a.disabled)
            .map(|a| ArmBinding {
                arm_id: a.id,
                arm_key: a.arm_key(),
                channel: a.channel.clone(),
                creative: a.creative.clone(),
                bid: a.bid,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbandit_connectors::SimPlatform;

    #[test]
    fn bindings_exclude_other_platforms_and_disabled_arms() {
        let store = Arc::new(PosteriorStore::open_in_memory().unwrap());
        let mut engine = Engine::new(EngineConfig::default(), store);
        engine.register_platform(Arc::new(SimPlatform::new("sim", 0, 100)));

        let mut a = Arm::new(1, "sim", "Search", "A", 1.0);
        a.id = 1;
        let mut b = Arm::new(1, "other", "Search", "B", 1.0);
        b.id = 2;
        let mut c = Arm::new(1, "sim", "Search", "C", 1.0);
        c.id = 3;
        c.disabled = true;

        let arms = [a, b, c];
        let bindings = engine.bindings_for(arms.iter(), "sim");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].arm_id, 1);
        assert!(engine.platform("sim").is_some());
        assert!(engine.platform_permit("sim").is_some());
    }
}
