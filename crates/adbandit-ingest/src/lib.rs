//! # AdBandit Metric Ingestor
//!
//! Two intake paths, one pipeline:
//! - **Polling**: the scheduler calls [`PlatformPoller::poll_once`] per
//!   platform, paced by a token bucket and retried with capped backoff.
//! - **Webhooks**: signed POSTs land on the [`webhook`] server and join
//!   the same validation pipeline as poll results.
//!
//! Every candidate row passes required-field and funnel checks, ROAS
//! plausibility bounds, and a rolling z-score anomaly gate, then dedups on
//! `(arm_id, ts, source)`. Poll rows are authoritative for posterior
//! updates; webhook rows are hints that may trigger an out-of-cycle update
//! when the implied reward moves far enough.

pub mod backoff;
pub mod ingestor;
pub mod limiter;
pub mod pending;
pub mod poller;
pub mod validate;
pub mod webhook;

pub use backoff::{retry_with_backoff, BackoffPolicy};
pub use ingestor::{IngestOutcome, Ingestor};
pub use limiter::TokenBucket;
pub use pending::{PendingMetric, PendingQueue, PushOutcome};
pub use poller::PlatformPoller;
pub use validate::{Assessment, MetricValidator};
pub use webhook::{serve_webhooks, WebhookState};

use adbandit_models::{ErrorClass, ValidationError};
use adbandit_store::StoreError;
use thiserror::Error;

/// Ingest failures, classified for the propagation policy.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no arm bound to key `{0}`")]
    UnknownArm(String),

    #[error("intake queue is full")]
    Backpressure,

    #[error(transparent)]
    Platform(#[from] adbandit_connectors::PlatformError),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Validation(_) => ErrorClass::Validation,
            IngestError::Store(e) => e.class(),
            IngestError::UnknownArm(_) => ErrorClass::Permanent,
            IngestError::Backpressure => ErrorClass::Transient,
            IngestError::Platform(e) => e.class(),
        }
    }
}
