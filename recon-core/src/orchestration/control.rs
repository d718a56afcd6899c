use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_model::{
    FailureReason, JobId, JobStatus, ModelError, ScanType, Severity, SeverityCounts, Target,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::ReconError;

use super::aggregator::AggregateSummary;
use super::events::EventFilter;
use super::job::ScanJob;
use super::runtime::{EventStream, ScanRuntime};
use super::store::JobFilter;

/// Listing view of a job. Findings are summarized, not included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub scan_type: ScanType,
    pub target: Target,
    pub status: JobStatus,
    pub progress: u8,
    pub severity: Option<Severity>,
    pub severity_counts: SeverityCounts,
    pub finding_count: usize,
    pub attempts: u32,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&ScanJob> for JobSnapshot {
    fn from(job: &ScanJob) -> Self {
        Self {
            id: job.id,
            scan_type: job.scan_type,
            target: job.target.clone(),
            status: job.status,
            progress: job.progress,
            severity: job.severity,
            severity_counts: job.severity_counts,
            finding_count: job.findings.len(),
            attempts: job.attempts,
            failure_reason: job.failure_reason.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanControlError {
    InvalidTarget { input: String, reason: String },
    UnknownScanType(String),
    ScanNotFound(JobId),
    InvalidTransition { status: JobStatus, attempted: &'static str },
    SchedulerUnavailable,
    Internal(String),
}

impl ScanControlError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ScanControlError::InvalidTarget { .. } => "invalid_target",
            ScanControlError::UnknownScanType(_) => "unknown_scan_type",
            ScanControlError::ScanNotFound(_) => "scan_not_found",
            ScanControlError::InvalidTransition { .. } => "invalid_transition",
            ScanControlError::SchedulerUnavailable => "scheduler_unavailable",
            ScanControlError::Internal(_) => "internal",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ScanControlError::InvalidTarget { input, reason } => {
                format!("invalid_target: {input:?} ({reason})")
            }
            ScanControlError::UnknownScanType(name) => format!("unknown_scan_type: {name}"),
            ScanControlError::ScanNotFound(job_id) => format!("scan_not_found: {job_id}"),
            ScanControlError::InvalidTransition { status, attempted } => {
                format!("invalid_transition: cannot {attempted} a {status} scan")
            }
            ScanControlError::SchedulerUnavailable => "scheduler_unavailable".into(),
            ScanControlError::Internal(reason) => reason.clone(),
        }
    }
}

impl fmt::Display for ScanControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ScanControlError {}

impl From<ReconError> for ScanControlError {
    fn from(err: ReconError) -> Self {
        match err {
            ReconError::InvalidTarget { input, reason } => {
                ScanControlError::InvalidTarget { input, reason }
            }
            ReconError::UnknownScanType(name) => ScanControlError::UnknownScanType(name),
            ReconError::NotFound(job_id) => ScanControlError::ScanNotFound(job_id),
            ReconError::InvalidTransition {
                status, attempted, ..
            } => ScanControlError::InvalidTransition { status, attempted },
            ReconError::Cancelled(_) => ScanControlError::SchedulerUnavailable,
            other => ScanControlError::Internal(other.to_string()),
        }
    }
}

impl From<ModelError> for ScanControlError {
    fn from(err: ModelError) -> Self {
        ReconError::from(err).into()
    }
}

/// Entry points exposed to callers (CLI, embedding applications).
///
/// Validation failures come back synchronously. Execution failures never do:
/// they are recorded on the job and published on the event bus.
#[derive(Clone, Debug)]
pub struct ScanControlPlane {
    runtime: Arc<ScanRuntime>,
}

impl ScanControlPlane {
    pub fn new(runtime: Arc<ScanRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<ScanRuntime> {
        &self.runtime
    }

    /// Parses `target` and queues a scan. Returns the new job's id.
    #[instrument(skip(self, options), fields(scan_type = %scan_type))]
    pub async fn submit_scan(
        &self,
        target: &str,
        scan_type: ScanType,
        options: BTreeMap<String, String>,
    ) -> Result<JobId, ScanControlError> {
        let target = Target::parse(target)?;
        let job = self.runtime.submit(target, scan_type, options).await?;
        info!(target: "recon::scheduler", job = %job.id, target = %job.target, "scan submitted");
        Ok(job.id)
    }

    /// Like [`ScanControlPlane::submit_scan`] with the scan type given by its
    /// key (`port_scan`, `dns_enumeration`, ...).
    #[instrument(skip(self, options))]
    pub async fn submit_scan_named(
        &self,
        target: &str,
        scan_type: &str,
        options: BTreeMap<String, String>,
    ) -> Result<JobId, ScanControlError> {
        let scan_type: ScanType = scan_type.parse()?;
        self.submit_scan(target, scan_type, options).await
    }

    #[instrument(skip(self))]
    pub async fn cancel_scan(&self, job_id: JobId) -> Result<(), ScanControlError> {
        self.runtime.cancel(job_id).await?;
        Ok(())
    }

    pub async fn list_scans(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.runtime
            .store()
            .list(filter)
            .await
            .iter()
            .map(JobSnapshot::from)
            .collect()
    }

    /// Full job record, findings included.
    pub async fn get_scan(&self, job_id: JobId) -> Result<ScanJob, ScanControlError> {
        Ok(self.runtime.store().get(job_id).await?)
    }

    pub async fn aggregate_summary(&self) -> AggregateSummary {
        self.runtime.store().summary().await
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.runtime.subscribe(filter)
    }

    /// Deletes a terminal job.
    #[instrument(skip(self))]
    pub async fn remove_scan(&self, job_id: JobId) -> Result<(), ScanControlError> {
        self.runtime.store().remove(job_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let job_id = JobId::new();
        let cases = [
            (
                ReconError::InvalidTarget {
                    input: "".into(),
                    reason: "empty".into(),
                },
                "invalid_target",
            ),
            (ReconError::UnknownScanType("nmap".into()), "unknown_scan_type"),
            (ReconError::NotFound(job_id), "scan_not_found"),
            (
                ReconError::InvalidTransition {
                    job_id,
                    status: JobStatus::Completed,
                    attempted: "cancel",
                },
                "invalid_transition",
            ),
            (ReconError::Cancelled("stopped".into()), "scheduler_unavailable"),
            (ReconError::Internal("boom".into()), "internal"),
        ];
        for (err, code) in cases {
            assert_eq!(ScanControlError::from(err).code(), code);
        }
    }

    #[test]
    fn display_uses_message() {
        let err = ScanControlError::InvalidTransition {
            status: JobStatus::Completed,
            attempted: "cancel",
        };
        assert_eq!(err.to_string(), err.message());
        assert!(err.to_string().starts_with("invalid_transition"));
    }
}
