use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use recon_model::{
    FailureReason, Finding, JobId, JobStatus, ScanType, Severity, SeverityCounts, Target,
};
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

use super::events::ScanEventKind;

/// Creation payload for a job. Journaled verbatim so replay rebuilds the same
/// record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSeed {
    pub scan_type: ScanType,
    pub target: Target,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

/// Record and state machine for one scan instance.
///
/// Jobs only change through [`ScanJob::apply`], which the store calls while
/// holding the job's lock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: JobId,
    pub scan_type: ScanType,
    pub target: Target,
    pub options: BTreeMap<String, String>,
    /// Monotonic creation order, used as the final FIFO tie-break.
    pub sequence: u64,
    pub status: JobStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub findings: Vec<Finding>,
    /// Maximum severity over `findings`; `None` while there are none.
    pub severity: Option<Severity>,
    pub severity_counts: SeverityCounts,
    pub attempts: u32,
    pub failure_reason: Option<FailureReason>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Incremented by every accepted mutation. Creation is revision 1.
    pub revision: u64,
}

/// One atomic change to a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JobMutation {
    Start {
        at: DateTime<Utc>,
    },
    Progress {
        value: u8,
    },
    AddFinding {
        finding: Finding,
    },
    Complete {
        at: DateTime<Utc>,
    },
    Fail {
        reason: FailureReason,
        at: DateTime<Utc>,
    },
    RequestCancel {
        at: DateTime<Utc>,
    },
    Cancel {
        at: DateTime<Utc>,
    },
    RetryScheduled {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
}

impl JobMutation {
    pub fn name(&self) -> &'static str {
        match self {
            JobMutation::Start { .. } => "start",
            JobMutation::Progress { .. } => "progress",
            JobMutation::AddFinding { .. } => "add_finding",
            JobMutation::Complete { .. } => "complete",
            JobMutation::Fail { .. } => "fail",
            JobMutation::RequestCancel { .. } => "request_cancel",
            JobMutation::Cancel { .. } => "cancel",
            JobMutation::RetryScheduled { .. } => "retry_scheduled",
        }
    }
}

impl ScanJob {
    pub(crate) fn from_seed(id: JobId, seed: JobSeed) -> Self {
        Self {
            id,
            scan_type: seed.scan_type,
            target: seed.target,
            options: seed.options,
            sequence: seed.sequence,
            status: JobStatus::Queued,
            progress: 0,
            created_at: seed.created_at,
            started_at: None,
            finished_at: None,
            findings: Vec::new(),
            severity: None,
            severity_counts: SeverityCounts::default(),
            attempts: 0,
            failure_reason: None,
            cancel_requested_at: None,
            revision: 1,
        }
    }

    pub fn seed(&self) -> JobSeed {
        JobSeed {
            scan_type: self.scan_type,
            target: self.target.clone(),
            options: self.options.clone(),
            sequence: self.sequence,
            created_at: self.created_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn invalid(&self, mutation: &JobMutation) -> ReconError {
        ReconError::InvalidTransition {
            job_id: self.id,
            status: self.status,
            attempted: mutation.name(),
        }
    }

    fn transition(&mut self, new: JobStatus, reason: Option<FailureReason>) -> ScanEventKind {
        let old = self.status;
        self.status = new;
        ScanEventKind::JobStatusChanged { old, new, reason }
    }

    /// Validates and applies `mutation`. On error the job is left untouched.
    pub fn apply(&mut self, mutation: JobMutation) -> Result<ScanEventKind> {
        let kind = match (self.status, &mutation) {
            (JobStatus::Queued, JobMutation::Start { at }) => {
                self.started_at = Some(*at);
                self.attempts = 1;
                self.transition(JobStatus::Running, None)
            }
            (JobStatus::Running, JobMutation::Progress { value }) => {
                let value = *value;
                if value > 100 {
                    return Err(ReconError::ProgressRejected {
                        job_id: self.id,
                        reason: format!("{value} exceeds 100"),
                    });
                }
                if value < self.progress {
                    return Err(ReconError::ProgressRejected {
                        job_id: self.id,
                        reason: format!("{value} is below current {}", self.progress),
                    });
                }
                self.progress = value;
                ScanEventKind::ProgressUpdated { value }
            }
            (JobStatus::Running, JobMutation::AddFinding { finding }) => {
                if self.cancel_requested_at.is_some() {
                    return Err(ReconError::Cancelled(format!(
                        "finding discarded for job {} after cancellation request",
                        self.id
                    )));
                }
                if finding.job_id != self.id {
                    return Err(ReconError::Internal(format!(
                        "finding for job {} offered to job {}",
                        finding.job_id, self.id
                    )));
                }
                self.severity_counts.add(finding.severity);
                self.severity = self.severity_counts.max();
                self.findings.push(finding.clone());
                ScanEventKind::FindingAdded {
                    finding: finding.clone(),
                }
            }
            (JobStatus::Running, JobMutation::Complete { at }) => {
                self.progress = 100;
                self.finished_at = Some(*at);
                self.transition(JobStatus::Completed, None)
            }
            (JobStatus::Running, JobMutation::Fail { reason, at }) => {
                self.finished_at = Some(*at);
                self.failure_reason = Some(reason.clone());
                self.transition(JobStatus::Failed, Some(reason.clone()))
            }
            (JobStatus::Running, JobMutation::RequestCancel { at }) => {
                if self.cancel_requested_at.is_some() {
                    return Err(self.invalid(&mutation));
                }
                self.cancel_requested_at = Some(*at);
                ScanEventKind::CancellationRequested
            }
            (JobStatus::Queued | JobStatus::Running, JobMutation::Cancel { at }) => {
                self.finished_at = Some(*at);
                self.transition(JobStatus::Cancelled, None)
            }
            (
                JobStatus::Running,
                JobMutation::RetryScheduled {
                    attempt,
                    delay_ms,
                    error,
                },
            ) => {
                if *attempt <= self.attempts {
                    return Err(self.invalid(&mutation));
                }
                self.attempts = *attempt;
                ScanEventKind::RetryScheduled {
                    attempt: *attempt,
                    delay_ms: *delay_ms,
                    error: error.clone(),
                }
            }
            _ => return Err(self.invalid(&mutation)),
        };
        self.revision += 1;
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use recon_model::FindingDraft;

    use super::*;

    fn job() -> ScanJob {
        ScanJob::from_seed(
            JobId::new(),
            JobSeed {
                scan_type: ScanType::PortScan,
                target: Target::parse("10.0.0.5").unwrap(),
                options: BTreeMap::new(),
                sequence: 0,
                created_at: Utc::now(),
            },
        )
    }

    fn finding(job: &ScanJob, severity: Severity) -> JobMutation {
        JobMutation::AddFinding {
            finding: Finding::from_draft(job.id, FindingDraft::new("x", severity), Utc::now()),
        }
    }

    #[test]
    fn happy_path_forces_progress_to_100() {
        let mut job = job();
        assert_eq!(job.revision, 1);
        job.apply(JobMutation::Start { at: Utc::now() }).unwrap();
        job.apply(JobMutation::Progress { value: 30 }).unwrap();
        job.apply(JobMutation::Progress { value: 30 }).unwrap();
        job.apply(JobMutation::Complete { at: Utc::now() }).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.revision, 5);
    }

    #[test]
    fn progress_regressions_are_rejected_without_change() {
        let mut job = job();
        assert!(matches!(
            job.apply(JobMutation::Progress { value: 10 }),
            Err(ReconError::InvalidTransition { .. })
        ));
        job.apply(JobMutation::Start { at: Utc::now() }).unwrap();
        job.apply(JobMutation::Progress { value: 50 }).unwrap();
        let before = job.clone();
        assert!(matches!(
            job.apply(JobMutation::Progress { value: 49 }),
            Err(ReconError::ProgressRejected { .. })
        ));
        assert!(matches!(
            job.apply(JobMutation::Progress { value: 101 }),
            Err(ReconError::ProgressRejected { .. })
        ));
        assert_eq!(job, before);
    }

    #[test]
    fn terminal_jobs_are_frozen() {
        let mut job = job();
        job.apply(JobMutation::Cancel { at: Utc::now() }).unwrap();
        let frozen = job.clone();
        for mutation in [
            JobMutation::Start { at: Utc::now() },
            JobMutation::Progress { value: 10 },
            finding(&frozen, Severity::High),
            JobMutation::Complete { at: Utc::now() },
            JobMutation::Cancel { at: Utc::now() },
        ] {
            assert!(matches!(
                job.apply(mutation),
                Err(ReconError::InvalidTransition { .. })
            ));
        }
        assert_eq!(job, frozen);
    }

    #[test]
    fn severity_is_max_of_findings() {
        let mut job = job();
        job.apply(JobMutation::Start { at: Utc::now() }).unwrap();
        assert_eq!(job.severity, None);
        for severity in [Severity::Low, Severity::Critical, Severity::Medium] {
            let mutation = finding(&job, severity);
            job.apply(mutation).unwrap();
        }
        assert_eq!(job.severity, Some(Severity::Critical));
        assert_eq!(job.severity_counts.total(), 3);
    }

    #[test]
    fn findings_are_discarded_after_cancel_request() {
        let mut job = job();
        job.apply(JobMutation::Start { at: Utc::now() }).unwrap();
        let kept = finding(&job, Severity::Low);
        job.apply(kept).unwrap();
        job.apply(JobMutation::RequestCancel { at: Utc::now() }).unwrap();
        let late = finding(&job, Severity::High);
        assert!(matches!(job.apply(late), Err(ReconError::Cancelled(_))));
        job.apply(JobMutation::Cancel { at: Utc::now() }).unwrap();
        assert_eq!(job.findings.len(), 1);
        assert_eq!(job.severity, Some(Severity::Low));
    }

    #[test]
    fn retry_bumps_attempts() {
        let mut job = job();
        job.apply(JobMutation::Start { at: Utc::now() }).unwrap();
        job.apply(JobMutation::RetryScheduled {
            attempt: 2,
            delay_ms: 100,
            error: "reset".into(),
        })
        .unwrap();
        assert_eq!(job.attempts, 2);
        assert!(
            job.apply(JobMutation::RetryScheduled {
                attempt: 2,
                delay_ms: 100,
                error: "reset".into(),
            })
            .is_err()
        );
    }
}
