use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidTarget { input: String, reason: String },
    UnknownScanType(String),
    UnknownSeverity(String),
    UnknownStatus(String),
}

impl ModelError {
    pub fn invalid_target(input: &str, reason: impl Into<String>) -> Self {
        ModelError::InvalidTarget {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidTarget { input, reason } => {
                write!(f, "invalid target {input:?}: {reason}")
            }
            ModelError::UnknownScanType(name) => {
                write!(f, "unknown scan type: {name}")
            }
            ModelError::UnknownSeverity(name) => {
                write!(f, "unknown severity: {name}")
            }
            ModelError::UnknownStatus(name) => {
                write!(f, "unknown job status: {name}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
