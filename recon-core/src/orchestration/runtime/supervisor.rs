use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use recon_model::{FailureReason, FindingDraft, JobId, JobStatus, ScanType, Target};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterError, AdapterRegistry, ProgressSink, ScanAdapter, ScanContext};
use crate::clock::Clock;
use crate::error::{ReconError, Result};
use crate::orchestration::aggregator::FindingAggregator;
use crate::orchestration::config::{OrchestratorConfig, ScanTypePolicy};
use crate::orchestration::events::{EventFilter, ScanEventPublisher};
use crate::orchestration::job::{JobMutation, ScanJob};
use crate::orchestration::persistence::{JournalRecord, JsonlJournal, MutationJournal};
use crate::orchestration::scheduler::{DispatchPlanner, QueuedEntry};
use crate::orchestration::store::{RestoreReport, ScanStore};

use super::event_bus::{EventStream, InProcEventBus};

/// Messages handled by the control loop.
#[derive(Debug)]
enum SchedulerCommand {
    Enqueue(QueuedEntry),
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    WorkerFinished {
        job_id: JobId,
    },
}

/// Owns the store, event bus and control loop for one process.
///
/// A single control task makes every dispatch decision. Each running job gets
/// its own worker task, bounded by `max_concurrent`.
pub struct ScanRuntime {
    config: Arc<OrchestratorConfig>,
    registry: Arc<AdapterRegistry>,
    store: Arc<ScanStore>,
    events: Arc<InProcEventBus>,
    journal: Option<Arc<dyn MutationJournal>>,
    clock: Arc<dyn Clock>,
    mailbox_tx: mpsc::UnboundedSender<SchedulerCommand>,
    mailbox_rx: Mutex<Option<mpsc::UnboundedReceiver<SchedulerCommand>>>,
    shutdown_token: CancellationToken,
    control_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ScanRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let started = self
            .mailbox_rx
            .try_lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true);

        f.debug_struct("ScanRuntime")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("store", &self.store)
            .field("events", &self.events)
            .field("journal", &self.journal)
            .field("clock", &self.clock)
            .field("started", &started)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl ScanRuntime {
    pub fn new(
        config: OrchestratorConfig,
        registry: AdapterRegistry,
        clock: Arc<dyn Clock>,
        journal: Option<Arc<dyn MutationJournal>>,
    ) -> Self {
        let events = Arc::new(InProcEventBus::new(config.event_buffer));
        let store = Arc::new(ScanStore::new(
            Arc::new(FindingAggregator::new()),
            Arc::clone(&events) as Arc<dyn ScanEventPublisher>,
            journal.clone(),
            Arc::clone(&clock),
        ));
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            store,
            events,
            journal,
            clock,
            mailbox_tx,
            mailbox_rx: Mutex::new(Some(mailbox_rx)),
            shutdown_token: CancellationToken::new(),
            control_handle: Mutex::new(None),
        }
    }

    /// Builds a runtime from configuration. When a journal path is configured
    /// the existing journal is replayed first and then reopened for appending.
    pub async fn open(
        config: OrchestratorConfig,
        registry: AdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RestoreReport)> {
        let Some(path) = config.journal.path.clone() else {
            return Ok((Self::new(config, registry, clock, None), RestoreReport::default()));
        };

        let records = JsonlJournal::load(&path).await?;
        let journal: Arc<dyn MutationJournal> = Arc::new(JsonlJournal::open(&path).await?);
        let runtime = Self::new(config, registry, clock, Some(journal));
        let report = runtime.restore(records).await?;
        info!(
            target: "recon::journal",
            path = %path.display(),
            requeued = report.requeued.len(),
            interrupted = report.interrupted.len(),
            "state restored from journal"
        );
        Ok((runtime, report))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<ScanStore> {
        Arc::clone(&self.store)
    }

    pub fn events(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.events)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.events.subscribe(filter)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Spawns the control loop. Calling it twice is an error.
    pub async fn start(&self) -> Result<()> {
        let Some(mailbox_rx) = self.mailbox_rx.lock().await.take() else {
            return Err(ReconError::Internal("scan runtime already started".into()));
        };

        let control = ControlLoop {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            journal: self.journal.clone(),
            clock: Arc::clone(&self.clock),
            planner: DispatchPlanner::new(
                self.config.max_concurrent,
                self.config.max_per_target,
            ),
            workers: HashMap::new(),
            mailbox_tx: self.mailbox_tx.clone(),
            shutdown: self.shutdown_token.clone(),
        };
        let handle = tokio::spawn(control.run(mailbox_rx));
        *self.control_handle.lock().await = Some(handle);
        info!(
            target: "recon::scheduler",
            max_concurrent = self.config.max_concurrent,
            max_per_target = ?self.config.max_per_target,
            adapters = ?self.registry.registered_types(),
            "scan scheduler started"
        );
        Ok(())
    }

    fn send(&self, command: SchedulerCommand) -> Result<()> {
        self.mailbox_tx
            .send(command)
            .map_err(|_| ReconError::Cancelled("scan scheduler has stopped".into()))
    }

    fn queued_entry(&self, job: &ScanJob) -> QueuedEntry {
        QueuedEntry {
            job_id: job.id,
            target: job.target.clone(),
            created_at: job.created_at,
            priority_weight: self.config.policy_for(job.scan_type).priority_weight,
            sequence: job.sequence,
        }
    }

    /// Validates and enqueues a scan. The job exists in the store as `Queued`
    /// when this returns.
    pub async fn submit(
        &self,
        target: Target,
        scan_type: ScanType,
        options: BTreeMap<String, String>,
    ) -> Result<ScanJob> {
        if self.is_shutting_down() {
            return Err(ReconError::Cancelled("scan scheduler is shutting down".into()));
        }
        if !self.registry.contains(scan_type) {
            return Err(ReconError::UnknownScanType(scan_type.key().to_string()));
        }

        let job = self.store.create(scan_type, target, options).await;
        self.send(SchedulerCommand::Enqueue(self.queued_entry(&job)))?;
        Ok(job)
    }

    /// Cancels a queued or running job. Repeated cancels of a running job are
    /// accepted; cancelling a terminal job is an `InvalidTransition`.
    ///
    /// Resolved by the control loop, so it waits for [`ScanRuntime::start`].
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(SchedulerCommand::Cancel { job_id, reply })?;
        response
            .await
            .map_err(|_| ReconError::Cancelled("scan scheduler has stopped".into()))?
    }

    /// Replays journal records into the store and queues the surviving
    /// `Queued` jobs in their original order.
    pub async fn restore(&self, records: Vec<JournalRecord>) -> Result<RestoreReport> {
        let report = self.store.restore(records).await?;
        for job_id in &report.requeued {
            let job = self.store.get(*job_id).await?;
            self.send(SchedulerCommand::Enqueue(self.queued_entry(&job)))?;
        }
        Ok(report)
    }

    /// Stops dispatching, cancels running jobs (each bounded by the cancel
    /// grace), waits for workers and flushes the journal. Queued jobs stay
    /// `Queued`.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();
        let handle = self.control_handle.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|err| ReconError::Internal(format!("control loop panicked: {err}"))),
            None => {
                if let Some(journal) = &self.journal {
                    journal.flush().await?;
                }
                Ok(())
            }
        }
    }
}

struct WorkerSlot {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ControlLoop {
    config: Arc<OrchestratorConfig>,
    registry: Arc<AdapterRegistry>,
    store: Arc<ScanStore>,
    journal: Option<Arc<dyn MutationJournal>>,
    clock: Arc<dyn Clock>,
    planner: DispatchPlanner,
    workers: HashMap<JobId, WorkerSlot>,
    mailbox_tx: mpsc::UnboundedSender<SchedulerCommand>,
    shutdown: CancellationToken,
}

impl ControlLoop {
    async fn run(mut self, mut mailbox_rx: mpsc::UnboundedReceiver<SchedulerCommand>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = mailbox_rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
            self.dispatch().await;
        }
        self.drain().await;
    }

    async fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Enqueue(entry) => {
                debug!(target: "recon::scheduler", job = %entry.job_id, target = %entry.target, "job queued");
                self.planner.enqueue(entry);
            }
            SchedulerCommand::Cancel { job_id, reply } => {
                let result = self.cancel(job_id).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::WorkerFinished { job_id } => {
                self.planner.release(job_id);
                self.workers.remove(&job_id);
                debug!(
                    target: "recon::scheduler",
                    job = %job_id,
                    running = self.planner.running_len(),
                    queued = self.planner.queued_len(),
                    "worker slot released"
                );
            }
        }
    }

    async fn cancel(&mut self, job_id: JobId) -> Result<()> {
        let at = self.clock.utc_now();

        if self.planner.remove_queued(job_id) {
            self.store.mutate(job_id, JobMutation::Cancel { at }).await?;
            info!(target: "recon::scheduler", job = %job_id, "queued job cancelled");
            return Ok(());
        }

        if let Some(slot) = self.workers.get(&job_id) {
            let job = self.store.get(job_id).await?;
            if job.is_terminal() {
                return Err(ReconError::InvalidTransition {
                    job_id,
                    status: job.status,
                    attempted: "cancel",
                });
            }
            if job.cancel_requested_at.is_none() {
                self.store
                    .mutate(job_id, JobMutation::RequestCancel { at })
                    .await?;
                info!(target: "recon::scheduler", job = %job_id, "cancellation requested");
            }
            slot.cancel.cancel();
            return Ok(());
        }

        let job = self.store.get(job_id).await?;
        match job.status {
            JobStatus::Queued => {
                self.store.mutate(job_id, JobMutation::Cancel { at }).await?;
                Ok(())
            }
            status => Err(ReconError::InvalidTransition {
                job_id,
                status,
                attempted: "cancel",
            }),
        }
    }

    async fn dispatch(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        while let Some(entry) = self.planner.next_dispatch() {
            let job_id = entry.job_id;
            let at = self.clock.utc_now();
            if let Err(err) = self.store.mutate(job_id, JobMutation::Start { at }).await {
                debug!(target: "recon::scheduler", job = %job_id, error = %err, "skipping stale queue entry");
                self.planner.release(job_id);
                continue;
            }
            let job = match self.store.get(job_id).await {
                Ok(job) => job,
                Err(err) => {
                    warn!(target: "recon::scheduler", job = %job_id, error = %err, "started job vanished");
                    self.planner.release(job_id);
                    continue;
                }
            };

            let Some(adapter) = self.registry.get(job.scan_type) else {
                let reason = FailureReason::AdapterUnavailable {
                    message: format!("no adapter registered for {}", job.scan_type),
                };
                if let Err(err) = self
                    .store
                    .mutate(job_id, JobMutation::Fail { reason, at })
                    .await
                {
                    warn!(target: "recon::scheduler", job = %job_id, error = %err, "failed to close job without adapter");
                }
                self.planner.release(job_id);
                continue;
            };

            let cancel = CancellationToken::new();
            let worker = Worker {
                policy: self.config.policy_for(job.scan_type).clone(),
                cancel_grace: self.config.cancel_grace(),
                job,
                adapter,
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
                cancel: cancel.clone(),
            };
            let mailbox = self.mailbox_tx.clone();
            let handle = tokio::spawn(async move {
                worker.run().await;
                let _ = mailbox.send(SchedulerCommand::WorkerFinished { job_id });
            });
            self.workers.insert(job_id, WorkerSlot { cancel, handle });
            debug!(
                target: "recon::scheduler",
                job = %job_id,
                running = self.planner.running_len(),
                queued = self.planner.queued_len(),
                "job dispatched"
            );
        }
    }

    async fn drain(&mut self) {
        info!(
            target: "recon::scheduler",
            running = self.workers.len(),
            queued = self.planner.queued_len(),
            "scan scheduler shutting down"
        );

        let at = self.clock.utc_now();
        for (job_id, slot) in &self.workers {
            if let Err(err) = self
                .store
                .mutate(*job_id, JobMutation::RequestCancel { at })
                .await
            {
                debug!(target: "recon::scheduler", job = %job_id, error = %err, "cancel request on shutdown skipped");
            }
            slot.cancel.cancel();
        }

        for (job_id, slot) in self.workers.drain() {
            if let Err(err) = slot.handle.await {
                error!(target: "recon::scheduler", job = %job_id, error = %err, "worker task failed");
            }
        }

        if let Some(journal) = &self.journal
            && let Err(err) = journal.flush().await
        {
            error!(target: "recon::journal", error = %err, "journal flush failed");
        }
    }
}

enum Outcome {
    Completed(Vec<FindingDraft>),
    Failed(FailureReason),
    Cancelled,
}

/// Runs one job from `Running` to a terminal status.
struct Worker {
    job: ScanJob,
    adapter: Arc<dyn ScanAdapter>,
    policy: ScanTypePolicy,
    cancel_grace: Duration,
    store: Arc<ScanStore>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let sink = ProgressSink::new(self.job.id, Arc::clone(&self.store), Arc::clone(&self.clock));
        // Handed to the adapter; cancelled on every exit path.
        let attempt_token = self.cancel.child_token();

        let execution = self.execute(&sink, &attempt_token);
        tokio::pin!(execution);
        let deadline = self.deadline();
        tokio::pin!(deadline);
        let watchdog = self.watchdog(&sink);
        tokio::pin!(watchdog);

        let outcome = tokio::select! {
            outcome = &mut execution => outcome,
            _ = &mut deadline => Outcome::Failed(FailureReason::Timeout),
            _ = &mut watchdog => Outcome::Failed(FailureReason::Stalled),
            _ = self.cancel.cancelled() => {
                tokio::select! {
                    _ = &mut execution => {
                        debug!(target: "recon::worker", job = %self.job.id, "adapter acknowledged cancellation");
                    }
                    _ = self.clock.sleep(self.cancel_grace) => {
                        warn!(target: "recon::worker", job = %self.job.id, grace_ms = self.cancel_grace.as_millis() as u64, "adapter ignored cancellation, forcing");
                    }
                }
                Outcome::Cancelled
            }
        };
        attempt_token.cancel();

        let outcome = if self.cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            outcome
        };
        self.finish(&sink, outcome).await;
    }

    async fn deadline(&self) {
        match self.policy.timeout() {
            Some(limit) => self.clock.sleep(limit).await,
            None => std::future::pending().await,
        }
    }

    async fn watchdog(&self, sink: &ProgressSink) {
        let Some(limit) = self.policy.liveness_timeout() else {
            return std::future::pending().await;
        };
        loop {
            let Some(last) = sink.last_activity() else {
                sink.resumed().await;
                continue;
            };
            let idle = self.clock.now().saturating_duration_since(last);
            if idle >= limit {
                return;
            }
            self.clock.sleep(limit - idle).await;
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let base = self.policy.backoff_for(retry);
        let ratio = self.policy.jitter_ratio.clamp(0.0, 1.0);
        if ratio <= 0.0 {
            return base;
        }
        let factor = rand::rng().random_range(0.0..=ratio as f64);
        base + base.mul_f64(factor)
    }

    async fn execute(&self, sink: &ProgressSink, token: &CancellationToken) -> Outcome {
        let job_id = self.job.id;

        if let Err(err) = self.adapter.check_available().await {
            return Outcome::Failed(FailureReason::AdapterUnavailable {
                message: err.message().to_string(),
            });
        }

        let mut attempt = 1u32;
        loop {
            let ctx = ScanContext::new(
                job_id,
                self.job.scan_type,
                self.job.target.clone(),
                self.job.options.clone(),
                attempt,
                token.clone(),
                sink.clone(),
                Arc::clone(&self.clock),
            );

            let error = match self.adapter.run(&ctx).await {
                Ok(findings) => return Outcome::Completed(findings),
                Err(AdapterError::Retryable(message)) => message,
                Err(AdapterError::Fatal(message)) => {
                    return Outcome::Failed(FailureReason::AdapterError { message });
                }
                Err(AdapterError::Unavailable(message)) => {
                    return Outcome::Failed(FailureReason::AdapterUnavailable { message });
                }
                Err(AdapterError::Cancelled) => return Outcome::Cancelled,
            };

            if attempt > self.policy.max_retries {
                return Outcome::Failed(FailureReason::RetriesExhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.backoff(attempt);
            warn!(
                target: "recon::worker",
                job = %job_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retryable adapter error"
            );
            let mutation = JobMutation::RetryScheduled {
                attempt: attempt + 1,
                delay_ms: delay.as_millis() as u64,
                error,
            };
            if let Err(err) = self.store.mutate(job_id, mutation).await {
                warn!(target: "recon::worker", job = %job_id, error = %err, "failed to record retry");
            }
            // Backoff is not adapter silence.
            sink.pause();
            tokio::select! {
                _ = token.cancelled() => return Outcome::Cancelled,
                _ = self.clock.sleep(delay) => {}
            }
            sink.touch();
            attempt += 1;
        }
    }

    async fn finish(&self, sink: &ProgressSink, outcome: Outcome) {
        let job_id = self.job.id;
        let mutation = match outcome {
            Outcome::Completed(findings) => {
                for draft in findings {
                    sink.finding(draft).await;
                }
                JobMutation::Complete {
                    at: self.clock.utc_now(),
                }
            }
            Outcome::Failed(reason) => JobMutation::Fail {
                reason,
                at: self.clock.utc_now(),
            },
            Outcome::Cancelled => JobMutation::Cancel {
                at: self.clock.utc_now(),
            },
        };

        match self.store.mutate(job_id, mutation).await {
            Ok(_) => {
                let status = self.store.status(job_id).await.ok();
                info!(target: "recon::worker", job = %job_id, status = ?status, "job finished");
            }
            Err(err) => {
                warn!(target: "recon::worker", job = %job_id, error = %err, "failed to record job outcome");
            }
        }
    }
}
