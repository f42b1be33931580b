#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod pool;
pub mod worker;

pub use self::pool::{DrainStats, PendingPool};
pub use self::worker::{Observe, Queue, QueueParams, Retry, WorkError};
