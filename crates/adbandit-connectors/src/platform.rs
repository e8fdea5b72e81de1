//! The `AdPlatform` capability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use adbandit_models::{ArmId, ErrorClass, Metric};

/// How an engine arm maps onto a platform-side entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmBinding {
    pub arm_id: ArmId,
    pub arm_key: String,
    pub channel: String,
    pub creative: String,
    pub bid: f64,
}

/// A campaign as the remote platform reports it (discovery only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCampaign {
    pub remote_id: String,
    pub name: String,
    pub status: String,
}

/// Platform call failures, classified for the retry policy.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// Network failures, 5xx, 429, 408. Retried with capped backoff.
    #[error("transient platform error: {0}")]
    Transient(String),

    /// 4xx (other than 408/429), schema mismatch. Never retried.
    #[error("permanent platform error: {0}")]
    Permanent(String),

    /// Deadline exceeded; treated as transient.
    #[error("platform call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Credentials missing; the platform's poller is disabled.
    #[error("platform `{0}` is not configured")]
    Unconfigured(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_) | PlatformError::Timeout(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::Transient(_) | PlatformError::Timeout(_) => ErrorClass::Transient,
            PlatformError::Permanent(_) => ErrorClass::Permanent,
            PlatformError::Unconfigured(_) => ErrorClass::Validation,
        }
    }

    /// Classify an HTTP status the way the retry policy expects:
    /// 5xx, 429 and 408 retry; other 4xx are permanent.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if status >= 500 || status == 429 || status == 408 {
            PlatformError::Transient(format!("http {status}: {detail}"))
        } else {
            PlatformError::Permanent(format!("http {status}: {detail}"))
        }
    }
}

/// Capability every ad vendor integration provides.
///
/// `fetch_metrics` must be idempotent for a `(bindings, since)` pair;
/// `set_bid` must be idempotent by `(arm_binding, bid)` so the engine may
/// retry or re-issue it during crash reconciliation.
#[async_trait]
pub trait AdPlatform: Send + Sync {
    /// Stable lowercase platform name ("google", "meta", ...).
    fn name(&self) -> &str;

    async fn fetch_metrics(
        &self,
        account_id: &str,
        bindings: &[ArmBinding],
        since: DateTime<Utc>,
    ) -> Result<Vec<Metric>, PlatformError>;

    async fn set_bid(&self, binding: &ArmBinding, new_bid: f64) -> Result<(), PlatformError>;

    async fn list_campaigns(&self, account_id: &str)
        -> Result<Vec<RemoteCampaign>, PlatformError>;
}
