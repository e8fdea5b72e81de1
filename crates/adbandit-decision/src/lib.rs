//! # AdBandit Decision Core
//!
//! The pure decision pipeline: given a campaign, its arm posteriors, and a
//! decision context, produce a new allocation vector and the change records
//! that explain it. No I/O happens here; everything is deterministic given
//! the cycle seed, so any decision can be replayed exactly in tests.
//!
//! Pipeline per cycle:
//! 1. Thompson-sample each arm's success probability
//! 2. Discount by the risk filter (variance vs. the campaign limit)
//! 3. Multiply by marketing-mix factors (seasonality, ad-stock, external)
//! 4. Normalize, apply the exploration floor, clamp the per-cycle step
//! 5. Scale down if projected spend would breach the budget
//! 6. Emit one `AllocationChange` per materially moved arm

pub mod agent;
pub mod decide;
pub mod linucb;
pub mod mmm;
pub mod seed;
pub mod thompson;

pub use agent::BanditAgent;
pub use decide::{decide, Decision, DecisionContext, DecisionParams};
pub use linucb::{ContextualLinUcb, LinUcbConfig};
pub use mmm::{MmmAdjuster, MmmMultipliers};
pub use seed::cycle_seed;
pub use thompson::ThompsonBernoulli;
