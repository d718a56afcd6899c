//! In-process runtime for the scan orchestrator: the event bus subscribers
//! read from and the supervisor that owns dispatch and worker tasks.

mod event_bus;
mod supervisor;

pub use event_bus::*;
pub use supervisor::*;
