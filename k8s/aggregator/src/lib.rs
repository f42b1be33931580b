//! The aggregator's reconcile engine and the admission-history ledger.
//!
//! One reconcile recomputes this worker cluster's cell from the source
//! provider's pod samples, merges it into the protector's status without
//! disturbing foreign cells, compacts the admission bucket this cluster owns,
//! and writes the result back to the central cluster with optimistic
//! concurrency. The ledger operations are shared with the deletion webhook,
//! which appends to the same buckets this engine compacts.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ledger;
mod metrics;
mod reconcile;


pub use self::metrics::AggregatorMetrics;
pub use self::reconcile::{fold, next_status, Aggregator, ReconcileError};
