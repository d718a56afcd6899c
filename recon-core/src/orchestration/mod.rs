//! Scan orchestration: job state machine, store, aggregation, scheduling and
//! the control plane on top of them.

pub mod aggregator;
pub mod config;
pub mod control;
pub mod events;
pub mod job;
pub mod persistence;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use aggregator::*;
pub use config::*;
pub use control::*;
pub use events::*;
pub use job::*;
pub use persistence::*;
pub use runtime::*;
pub use scheduler::*;
pub use store::*;
