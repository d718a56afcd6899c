use recon_model::{JobId, JobStatus, ModelError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid target {input:?}: {reason}")]
    InvalidTarget { input: String, reason: String },

    #[error("unknown scan type: {0}")]
    UnknownScanType(String),

    #[error("scan job not found: {0}")]
    NotFound(JobId),

    #[error("invalid transition for job {job_id}: {attempted} not allowed while {status}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        attempted: &'static str,
    },

    #[error("progress rejected for job {job_id}: {reason}")]
    ProgressRejected { job_id: JobId, reason: String },

    #[error(transparent)]
    Model(ModelError),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ModelError> for ReconError {
    fn from(value: ModelError) -> Self {
        match value {
            ModelError::InvalidTarget { input, reason } => {
                ReconError::InvalidTarget { input, reason }
            }
            ModelError::UnknownScanType(name) => ReconError::UnknownScanType(name),
            other => ReconError::Model(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconError>;
