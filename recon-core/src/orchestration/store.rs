use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use recon_model::{FailureReason, JobId, JobStatus, ScanType, Severity, Target};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::{ReconError, Result};

use super::aggregator::{AggregateSummary, FindingAggregator};
use super::events::{ScanEvent, ScanEventKind, ScanEventPublisher};
use super::job::{JobMutation, JobSeed, ScanJob};
use super::persistence::{JournalEntry, JournalRecord, MutationJournal};

type JobHandle = Arc<Mutex<ScanJob>>;

/// Query over stored jobs. Unset fields match everything; set fields are ANDed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub scan_type: Option<ScanType>,
    pub target: Option<Target>,
    /// Jobs without findings never match a severity floor.
    pub min_severity: Option<Severity>,
}

impl JobFilter {
    pub fn matches(&self, job: &ScanJob) -> bool {
        self.status.is_none_or(|status| status == job.status)
            && self.scan_type.is_none_or(|t| t == job.scan_type)
            && self.target.as_ref().is_none_or(|t| *t == job.target)
            && self
                .min_severity
                .is_none_or(|floor| job.severity.is_some_and(|s| s >= floor))
    }
}

/// Outcome of replaying a journal into an empty store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub records_applied: usize,
    pub records_skipped: usize,
    /// Queued jobs, oldest first, ready to be handed back to the scheduler.
    pub requeued: Vec<JobId>,
    /// Jobs that were running when the journal ended and were closed out.
    pub interrupted: Vec<JobId>,
}

/// Concurrency-safe owner of every scan job.
///
/// Mutations for one job are serialized by that job's lock. While the lock is
/// held the store applies the change, feeds the aggregator, appends to the
/// journal and publishes the event, so subscribers see per-job changes in
/// order.
pub struct ScanStore {
    jobs: RwLock<HashMap<JobId, JobHandle>>,
    next_sequence: AtomicU64,
    /// Latest `created_at` handed out. Held while a sequence number is taken so
    /// creation timestamps never run backwards against submission order.
    last_created: StdMutex<Option<DateTime<Utc>>>,
    anomalies: AtomicU64,
    aggregator: Arc<FindingAggregator>,
    events: Arc<dyn ScanEventPublisher>,
    journal: Option<Arc<dyn MutationJournal>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ScanStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let job_count = self
            .jobs
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();

        f.debug_struct("ScanStore")
            .field("job_count", &job_count)
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .field("anomalies", &self.anomalies.load(Ordering::Relaxed))
            .field("aggregator", &self.aggregator)
            .field("journal", &self.journal)
            .field("clock", &self.clock)
            .finish()
    }
}

impl ScanStore {
    pub fn new(
        aggregator: Arc<FindingAggregator>,
        events: Arc<dyn ScanEventPublisher>,
        journal: Option<Arc<dyn MutationJournal>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            last_created: StdMutex::new(None),
            anomalies: AtomicU64::new(0),
            aggregator,
            events,
            journal,
            clock,
        }
    }

    pub fn aggregator(&self) -> Arc<FindingAggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    async fn handle(&self, job_id: JobId) -> Result<JobHandle> {
        let guard = self.jobs.read().await;
        guard.get(&job_id).cloned().ok_or(ReconError::NotFound(job_id))
    }

    /// Persists and announces a change that has already been applied to `job`.
    /// Called with the job's lock held.
    async fn commit(&self, job: &ScanJob, entry: JournalEntry, kind: ScanEventKind) -> ScanEvent {
        let at = self.clock.utc_now();
        self.aggregator.apply(job).await;

        if let Some(journal) = &self.journal {
            let record = JournalRecord {
                job_id: job.id,
                revision: job.revision,
                recorded_at: at,
                entry,
            };
            if let Err(err) = journal.append(&record).await {
                error!(target: "recon::journal", job = %job.id, revision = job.revision, error = %err, "journal append failed");
            }
        }

        let event = ScanEvent {
            job_id: job.id,
            scan_type: job.scan_type,
            target: job.target.clone(),
            revision: job.revision,
            at,
            kind,
        };
        if let Err(err) = self.events.publish(event.clone()).await {
            warn!(target: "recon::store", job = %job.id, error = %err, "event publish failed");
        }
        event
    }

    /// Next submission sequence and its creation time. A wall clock stepping
    /// back is clamped to the previous submission.
    fn stamp_submission(&self) -> (u64, DateTime<Utc>) {
        let mut last = self
            .last_created
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.utc_now();
        let created_at = match *last {
            Some(previous) if previous > now => {
                warn!(target: "recon::store", %previous, %now, "wall clock stepped back; keeping submission order");
                previous
            }
            _ => now,
        };
        *last = Some(created_at);
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        (sequence, created_at)
    }

    /// Creates a `Queued` job. The only way jobs come into existence.
    pub async fn create(
        &self,
        scan_type: ScanType,
        target: Target,
        options: BTreeMap<String, String>,
    ) -> ScanJob {
        let (sequence, created_at) = self.stamp_submission();
        let seed = JobSeed {
            scan_type,
            target,
            options,
            sequence,
            created_at,
        };
        let job = ScanJob::from_seed(JobId::new(), seed.clone());
        let handle: JobHandle = Arc::new(Mutex::new(job.clone()));
        let guard = handle.lock().await;
        self.jobs.write().await.insert(job.id, Arc::clone(&handle));

        debug!(target: "recon::store", job = %job.id, scan_type = %job.scan_type, target = %job.target, "job created");
        self.commit(&guard, JournalEntry::Created(seed), ScanEventKind::JobCreated)
            .await;
        job
    }

    pub async fn get(&self, job_id: JobId) -> Result<ScanJob> {
        let handle = self.handle(job_id).await?;
        let job = handle.lock().await;
        Ok(job.clone())
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatus> {
        let handle = self.handle(job_id).await?;
        let job = handle.lock().await;
        Ok(job.status)
    }

    /// Jobs matching `filter`, in creation order.
    pub async fn list(&self, filter: &JobFilter) -> Vec<ScanJob> {
        let handles: Vec<JobHandle> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            let job = handle.lock().await;
            if filter.matches(&job) {
                jobs.push(job.clone());
            }
        }
        jobs.sort_by_key(|job| job.sequence);
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Applies one mutation atomically and returns the published event.
    /// Rejected mutations leave the job untouched and publish nothing.
    pub async fn mutate(&self, job_id: JobId, mutation: JobMutation) -> Result<ScanEvent> {
        let handle = self.handle(job_id).await?;
        let mut job = handle.lock().await;

        let kind = job.apply(mutation.clone())?;
        if let ScanEventKind::JobStatusChanged { old, new, reason } = &kind {
            debug!(target: "recon::store", job = %job_id, %old, %new, reason = ?reason, "status changed");
        }
        Ok(self.commit(&job, JournalEntry::Mutated(mutation), kind).await)
    }

    /// Deletes a terminal job and withdraws it from the summary.
    pub async fn remove(&self, job_id: JobId) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let handle = jobs
            .get(&job_id)
            .cloned()
            .ok_or(ReconError::NotFound(job_id))?;
        let mut job = handle.lock().await;
        if !job.is_terminal() {
            return Err(ReconError::InvalidTransition {
                job_id,
                status: job.status,
                attempted: "remove",
            });
        }
        jobs.remove(&job_id);
        drop(jobs);

        job.revision += 1;
        self.aggregator.remove(job_id).await;
        let at = self.clock.utc_now();
        if let Some(journal) = &self.journal {
            let record = JournalRecord {
                job_id,
                revision: job.revision,
                recorded_at: at,
                entry: JournalEntry::Removed,
            };
            if let Err(err) = journal.append(&record).await {
                error!(target: "recon::journal", job = %job_id, error = %err, "journal append failed");
            }
        }
        let event = ScanEvent {
            job_id,
            scan_type: job.scan_type,
            target: job.target.clone(),
            revision: job.revision,
            at,
            kind: ScanEventKind::JobRemoved,
        };
        if let Err(err) = self.events.publish(event).await {
            warn!(target: "recon::store", job = %job_id, error = %err, "event publish failed");
        }
        debug!(target: "recon::store", job = %job_id, "job removed");
        Ok(())
    }

    /// Counts and logs an invariant violation reported by an adapter.
    pub fn record_anomaly(&self, job_id: JobId, err: &ReconError) {
        let total = self.anomalies.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(target: "recon::anomaly", job = %job_id, error = %err, total, "adapter report rejected");
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    pub async fn summary(&self) -> AggregateSummary {
        self.aggregator.snapshot().await
    }

    /// Full recomputation of the summary from the stored jobs.
    pub async fn recompute_summary(&self) -> AggregateSummary {
        let jobs = self.list(&JobFilter::default()).await;
        AggregateSummary::from_jobs(&jobs)
    }

    /// Rebuilds state from journal records, in recorded order.
    ///
    /// Replay itself is silent (no events, no journal writes). Afterwards jobs
    /// that were `Running` are closed out through the normal mutation path:
    /// `Cancelled` if a cancel had been requested, otherwise
    /// `Failed(Interrupted)`.
    pub async fn restore(&self, records: Vec<JournalRecord>) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        let mut max_sequence = None;
        let mut max_created = None;

        {
            let mut jobs = self.jobs.write().await;
            for record in records {
                match record.entry {
                    JournalEntry::Created(seed) => {
                        max_sequence = max_sequence.max(Some(seed.sequence));
                        max_created = max_created.max(Some(seed.created_at));
                        let job = ScanJob::from_seed(record.job_id, seed);
                        jobs.insert(record.job_id, Arc::new(Mutex::new(job)));
                        report.records_applied += 1;
                    }
                    JournalEntry::Mutated(mutation) => {
                        let Some(handle) = jobs.get(&record.job_id) else {
                            warn!(target: "recon::journal", job = %record.job_id, "mutation for unknown job skipped");
                            report.records_skipped += 1;
                            continue;
                        };
                        let mut job = handle.lock().await;
                        match job.apply(mutation) {
                            Ok(_) => report.records_applied += 1,
                            Err(err) => {
                                warn!(target: "recon::journal", job = %record.job_id, error = %err, "journal mutation rejected on replay");
                                report.records_skipped += 1;
                            }
                        }
                    }
                    JournalEntry::Removed => {
                        if jobs.remove(&record.job_id).is_some() {
                            report.records_applied += 1;
                        } else {
                            report.records_skipped += 1;
                        }
                    }
                }
            }
        }

        if let Some(max) = max_sequence {
            self.next_sequence.fetch_max(max + 1, Ordering::SeqCst);
        }
        if max_created.is_some() {
            let mut last = self
                .last_created
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *last = (*last).max(max_created);
        }

        self.aggregator.reset().await;
        let jobs = self.list(&JobFilter::default()).await;
        for job in &jobs {
            self.aggregator.apply(job).await;
        }

        for job in jobs {
            match job.status {
                JobStatus::Queued => report.requeued.push(job.id),
                JobStatus::Running => {
                    let at = self.clock.utc_now();
                    let mutation = if job.cancel_requested_at.is_some() {
                        JobMutation::Cancel { at }
                    } else {
                        JobMutation::Fail {
                            reason: FailureReason::Interrupted,
                            at,
                        }
                    };
                    self.mutate(job.id, mutation).await?;
                    report.interrupted.push(job.id);
                }
                _ => {}
            }
        }

        debug!(
            target: "recon::journal",
            applied = report.records_applied,
            skipped = report.records_skipped,
            requeued = report.requeued.len(),
            interrupted = report.interrupted.len(),
            "journal replayed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use chrono::TimeZone;

    use super::*;
    use crate::clock::Sleep;
    use crate::orchestration::runtime::InProcEventBus;

    /// Wall clock that replays scripted timestamps, including backward steps.
    /// Each `create` reads the clock twice: once for the job, once for its event.
    #[derive(Debug)]
    struct ScriptedWallClock {
        stamps: StdMutex<Vec<DateTime<Utc>>>,
    }

    impl Clock for ScriptedWallClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn utc_now(&self) -> DateTime<Utc> {
            let mut stamps = self.stamps.lock().unwrap();
            if stamps.len() > 1 {
                stamps.remove(0)
            } else {
                stamps[0]
            }
        }

        fn sleep(&self, _duration: Duration) -> Sleep {
            Box::pin(std::future::pending())
        }
    }

    fn store_with(stamps: Vec<DateTime<Utc>>) -> ScanStore {
        ScanStore::new(
            Arc::new(FindingAggregator::new()),
            Arc::new(InProcEventBus::new(16)),
            None,
            Arc::new(ScriptedWallClock {
                stamps: StdMutex::new(stamps),
            }),
        )
    }

    #[tokio::test]
    async fn creation_times_never_run_backwards() {
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let earlier = noon - chrono::Duration::minutes(5);
        let later = noon + chrono::Duration::seconds(1);
        let store = store_with(vec![noon, noon, earlier, earlier, later, later]);
        let target = Target::parse("example.com").unwrap();

        let first = store
            .create(ScanType::PortScan, target.clone(), BTreeMap::new())
            .await;
        let second = store
            .create(ScanType::PortScan, target.clone(), BTreeMap::new())
            .await;
        let third = store
            .create(ScanType::PortScan, target, BTreeMap::new())
            .await;

        assert_eq!(
            [first.sequence, second.sequence, third.sequence],
            [0, 1, 2]
        );
        assert_eq!(first.created_at, noon);
        assert_eq!(second.created_at, noon);
        assert_eq!(third.created_at, later);
    }
}
