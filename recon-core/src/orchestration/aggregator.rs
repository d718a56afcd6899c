use std::collections::HashMap;
use std::fmt;

use recon_model::{JobId, JobStatus, SeverityCounts, Target};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::job::ScanJob;

/// Job counts per lifecycle status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    fn slot(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|status| self.get(*status)).sum()
    }
}

/// Dashboard-level view over every job in the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub jobs_by_status: StatusCounts,
    pub findings_by_severity: SeverityCounts,
    pub distinct_targets: u64,
}

impl AggregateSummary {
    /// Queued plus running.
    pub fn active_scans(&self) -> u64 {
        self.jobs_by_status.queued + self.jobs_by_status.running
    }

    pub fn total_jobs(&self) -> u64 {
        self.jobs_by_status.total()
    }

    /// Full recomputation. The incremental aggregator must always agree with
    /// this.
    pub fn from_jobs<'a, I>(jobs: I) -> Self
    where
        I: IntoIterator<Item = &'a ScanJob>,
    {
        let mut summary = AggregateSummary::default();
        let mut targets = std::collections::HashSet::new();
        for job in jobs {
            *summary.jobs_by_status.slot(job.status) += 1;
            summary.findings_by_severity.add_all(&job.severity_counts);
            targets.insert(job.target.clone());
        }
        summary.distinct_targets = targets.len() as u64;
        summary
    }
}

#[derive(Debug)]
struct Contribution {
    revision: u64,
    status: JobStatus,
    severity_counts: SeverityCounts,
    target: Target,
}

#[derive(Debug, Default)]
struct AggregatorState {
    summary: AggregateSummary,
    contributions: HashMap<JobId, Contribution>,
    target_refs: HashMap<Target, u64>,
}

impl AggregatorState {
    fn retract(&mut self, contribution: &Contribution) {
        let slot = self.summary.jobs_by_status.slot(contribution.status);
        *slot = slot.saturating_sub(1);
        self.summary
            .findings_by_severity
            .subtract_all(&contribution.severity_counts);
    }

    fn release_target(&mut self, target: &Target) {
        if let Some(refs) = self.target_refs.get_mut(target) {
            *refs = refs.saturating_sub(1);
            if *refs == 0 {
                self.target_refs.remove(target);
            }
        }
        self.summary.distinct_targets = self.target_refs.len() as u64;
    }
}

/// Incrementally maintained [`AggregateSummary`].
///
/// Each job's last applied contribution is remembered with its revision, so
/// a delta is O(1) and re-delivering an old revision changes nothing.
#[derive(Default)]
pub struct FindingAggregator {
    state: Mutex<AggregatorState>,
}

impl fmt::Debug for FindingAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("FindingAggregator");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("summary", &state.summary)
                    .field("tracked_jobs", &state.contributions.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl FindingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the job's previous contribution with its current state.
    /// Returns `false` when `job.revision` was already applied.
    pub async fn apply(&self, job: &ScanJob) -> bool {
        let mut state = self.state.lock().await;

        match state.contributions.remove(&job.id) {
            Some(previous) if previous.revision >= job.revision => {
                state.contributions.insert(job.id, previous);
                return false;
            }
            Some(previous) => state.retract(&previous),
            None => {
                *state.target_refs.entry(job.target.clone()).or_default() += 1;
                state.summary.distinct_targets = state.target_refs.len() as u64;
            }
        }

        *state.summary.jobs_by_status.slot(job.status) += 1;
        state
            .summary
            .findings_by_severity
            .add_all(&job.severity_counts);
        state.contributions.insert(
            job.id,
            Contribution {
                revision: job.revision,
                status: job.status,
                severity_counts: job.severity_counts,
                target: job.target.clone(),
            },
        );
        true
    }

    /// Drops a removed job's contribution. Returns `false` if it was unknown.
    pub async fn remove(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock().await;
        let Some(contribution) = state.contributions.remove(&job_id) else {
            return false;
        };
        state.retract(&contribution);
        state.release_target(&contribution.target);
        true
    }

    pub async fn snapshot(&self) -> AggregateSummary {
        self.state.lock().await.summary.clone()
    }

    pub(crate) async fn reset(&self) {
        *self.state.lock().await = AggregatorState::default();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use recon_model::{Finding, FindingDraft, ScanType, Severity};

    use super::*;
    use crate::orchestration::job::{JobMutation, JobSeed};

    fn job(target: &str, sequence: u64) -> ScanJob {
        ScanJob::from_seed(
            JobId::new(),
            JobSeed {
                scan_type: ScanType::PortScan,
                target: Target::parse(target).unwrap(),
                options: BTreeMap::new(),
                sequence,
                created_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn duplicate_revisions_are_ignored() {
        let aggregator = FindingAggregator::new();
        let mut job = job("10.0.0.1", 0);
        assert!(aggregator.apply(&job).await);
        assert!(!aggregator.apply(&job).await);

        job.apply(JobMutation::Start { at: Utc::now() }).unwrap();
        let finding = Finding::from_draft(job.id, FindingDraft::new("x", Severity::High), Utc::now());
        job.apply(JobMutation::AddFinding { finding }).unwrap();
        assert!(aggregator.apply(&job).await);
        let once = aggregator.snapshot().await;
        assert!(!aggregator.apply(&job).await);
        assert_eq!(aggregator.snapshot().await, once);
        assert_eq!(once, AggregateSummary::from_jobs([&job]));
    }

    #[tokio::test]
    async fn removal_releases_targets() {
        let aggregator = FindingAggregator::new();
        let a = job("example.com", 0);
        let b = job("example.com", 1);
        aggregator.apply(&a).await;
        aggregator.apply(&b).await;
        assert_eq!(aggregator.snapshot().await.distinct_targets, 1);

        assert!(aggregator.remove(a.id).await);
        assert!(!aggregator.remove(a.id).await);
        assert_eq!(aggregator.snapshot().await.distinct_targets, 1);
        aggregator.remove(b.id).await;
        assert_eq!(aggregator.snapshot().await, AggregateSummary::default());
    }

    #[tokio::test]
    async fn incremental_matches_full_recompute_under_random_histories() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let targets = ["10.0.0.1", "10.0.0.2", "example.com", "scanme.example.org"];

        for _ in 0..50 {
            let aggregator = FindingAggregator::new();
            let mut jobs: Vec<ScanJob> = (0..6)
                .map(|i| job(targets[rng.random_range(0..targets.len())], i))
                .collect();
            for job in &jobs {
                aggregator.apply(job).await;
            }

            for _ in 0..40 {
                let idx = rng.random_range(0..jobs.len());
                let job = &mut jobs[idx];
                let mutation = match rng.random_range(0..6) {
                    0 => JobMutation::Start { at: Utc::now() },
                    1 => JobMutation::Progress {
                        value: rng.random_range(0..=100),
                    },
                    2 | 3 => {
                        let severity = Severity::ALL[rng.random_range(0..4)];
                        JobMutation::AddFinding {
                            finding: Finding::from_draft(
                                job.id,
                                FindingDraft::new("f", severity),
                                Utc::now(),
                            ),
                        }
                    }
                    4 => JobMutation::Complete { at: Utc::now() },
                    _ => JobMutation::Cancel { at: Utc::now() },
                };
                if job.apply(mutation).is_ok() {
                    aggregator.apply(job).await;
                    // Duplicate delivery.
                    if rng.random_bool(0.3) {
                        aggregator.apply(job).await;
                    }
                }
                if let Some(max) = job.findings.iter().map(|f| f.severity).max() {
                    assert_eq!(job.severity, Some(max));
                }
            }

            assert_eq!(aggregator.snapshot().await, AggregateSummary::from_jobs(&jobs));
        }
    }
}
