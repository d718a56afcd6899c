//! Core data model definitions shared across ReconWhisper crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod finding;
pub mod ids;
pub mod scan;
pub mod target;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use finding::{Finding, FindingDraft, SeverityCounts};
pub use ids::{FindingId, JobId};
pub use scan::{FailureReason, JobStatus, ScanType, Severity};
pub use target::Target;
