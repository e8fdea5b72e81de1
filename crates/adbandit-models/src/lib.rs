//! # AdBandit Models
//!
//! Canonical entity types shared across the optimization engine:
//! - `Campaign` and `Arm` definitions with construction-time validation
//! - `Metric` time-series rows with field-level validity rules
//! - `ArmPosterior` Beta-posterior state plus reward statistics
//! - `AllocationChange` append-only decision records
//! - `EngineConfig` configuration surface
//! - The engine-wide error taxonomy
//!
//! This crate is a leaf: no I/O, no async, no platform specifics.

pub mod arm;
pub mod campaign;
pub mod change;
pub mod config;
pub mod error;
pub mod metric;
pub mod posterior;

pub use arm::{arm_key_of, Arm, ArmId};
pub use campaign::{Campaign, CampaignId, CampaignStatus, PrimaryKpi};
pub use change::{AllocationChange, Initiator};
pub use config::{EngineConfig, MmmConfig};
pub use error::{ErrorClass, ValidationError};
pub use metric::{Metric, MetricQuality, MetricSource};
pub use posterior::{ArmPosterior, PosteriorUpdate};
