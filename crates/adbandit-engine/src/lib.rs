//! # AdBandit Engine
//!
//! The continuous optimization service. A supervisor task owns every timer
//! and task in the process:
//! - one cycle task per Active campaign, strictly sequential per campaign
//! - one intake task per configured platform driving polling
//! - one webhook server task
//!
//! Shutdown is a drain: cycle tasks finish their current iteration or are
//! cancelled at the drain timeout; intended allocations are journaled
//! before bids go out, so a restart reconciles by re-issuing `set_bid`
//! idempotently before the first new cycle.

pub mod cycle;
pub mod engine;
pub mod supervisor;

pub use cycle::{run_cycle, CampaignRuntime, CycleOutcome};
pub use engine::Engine;
pub use supervisor::Supervisor;

use adbandit_connectors::PlatformError;
use adbandit_ingest::IngestError;
use adbandit_models::ErrorClass;
use adbandit_store::StoreError;
use thiserror::Error;

/// Cycle-level failures, classified for the propagation policy in the
/// supervisor: concurrency retries once, invariant breaches error the
/// campaign, fatal store failures abort the process.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("invariant breach: {0}")]
    InvariantBreach(String),
}

impl CycleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CycleError::Store(e) => e.class(),
            CycleError::Ingest(e) => e.class(),
            CycleError::Platform(e) => e.class(),
            CycleError::InvariantBreach(_) => ErrorClass::InvariantBreach,
        }
    }
}
