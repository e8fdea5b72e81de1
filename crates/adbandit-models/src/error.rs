//! Engine-wide error taxonomy.
//!
//! Every failure in the system maps to one [`ErrorClass`], which drives the
//! propagation policy: transient failures retry with backoff, permanent
//! failures are logged and skipped, concurrency failures retry once,
//! invariant breaches error the campaign, fatal failures abort the process.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronously rejected inputs. Never cause state changes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("bid must be positive, got {0}")]
    NonPositiveBid(f64),

    #[error("duplicate arm key `{0}` in campaign")]
    DuplicateArmKey(String),

    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("funnel constraint violated: {detail}")]
    FunnelViolation { detail: String },

    #[error("unknown value `{value}` for `{field}`")]
    UnknownEnumValue { field: &'static str, value: String },

    #[error("webhook signature verification failed")]
    BadSignature,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Failure classification used for retry policy and change-log reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rejected input; surfaced synchronously, no state change.
    Validation,
    /// Network, 5xx, 429, deadline. Retried with capped backoff.
    Transient,
    /// 4xx (other than 408/429), schema mismatch. Not retried.
    Permanent,
    /// Failed plausibility or anomaly checks; row kept as suspect.
    DataQuality,
    /// Lock-wait timeout in the store. Retried once.
    Concurrency,
    /// A data invariant no longer holds; campaign goes to Errored.
    InvariantBreach,
    /// The store is unreachable; the process must exit.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::DataQuality => "data_quality",
            ErrorClass::Concurrency => "concurrency",
            ErrorClass::InvariantBreach => "invariant_breach",
            ErrorClass::Fatal => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_field() {
        let e = ValidationError::OutOfRange { field: "risk_tolerance", value: 2.0 };
        assert!(e.to_string().contains("risk_tolerance"));
        let e = ValidationError::DuplicateArmKey("Google|Search|A|1.0000".into());
        assert!(e.to_string().contains("Google|Search"));
    }
}
