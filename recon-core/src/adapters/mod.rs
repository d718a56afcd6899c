//! Pluggable scan executors.
//!
//! Each [`ScanType`] is backed by at most one [`ScanAdapter`]. The runtime
//! hands adapters a [`ScanContext`] per attempt; adapters stream progress and
//! findings through it and watch its cancellation token.

pub mod dns;
pub mod tcp_connect;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use recon_model::{Finding, FindingDraft, JobId, ScanType, Target};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::ReconError;
use crate::orchestration::job::JobMutation;
use crate::orchestration::store::ScanStore;

pub use dns::DnsEnumerationAdapter;
pub use tcp_connect::TcpConnectAdapter;

/// Outcome classification for a failed adapter run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Transient failure; the runtime may retry with backoff.
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
    /// The tool behind the adapter cannot run on this host.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The adapter observed cancellation and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn message(&self) -> &str {
        match self {
            AdapterError::Retryable(message)
            | AdapterError::Fatal(message)
            | AdapterError::Unavailable(message) => message,
            AdapterError::Cancelled => "cancelled",
        }
    }
}

/// Contract implemented by every scan executor.
#[async_trait]
pub trait ScanAdapter: Send + Sync + fmt::Debug {
    fn scan_type(&self) -> ScanType;

    /// Probed once per job, right before the first attempt.
    async fn check_available(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Executes one attempt. Findings may be streamed through
    /// [`ScanContext::emit_finding`] or returned in bulk; both end up on the job.
    async fn run(&self, ctx: &ScanContext) -> Result<Vec<FindingDraft>, AdapterError>;
}

/// Per-attempt execution context handed to adapters.
#[derive(Clone)]
pub struct ScanContext {
    pub job_id: JobId,
    pub scan_type: ScanType,
    pub target: Target,
    pub options: BTreeMap<String, String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
    progress: ProgressSink,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanContext")
            .field("job_id", &self.job_id)
            .field("scan_type", &self.scan_type)
            .field("target", &self.target)
            .field("options", &self.options)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ScanContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_id: JobId,
        scan_type: ScanType,
        target: Target,
        options: BTreeMap<String, String>,
        attempt: u32,
        cancel: CancellationToken,
        progress: ProgressSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            job_id,
            scan_type,
            target,
            options,
            attempt,
            cancel,
            progress,
            clock,
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Sleeps on the runtime clock; returns `Err(Cancelled)` if cancellation
    /// arrives first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), AdapterError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AdapterError::Cancelled),
            _ = self.clock.sleep(duration) => Ok(()),
        }
    }

    /// Reports percentage progress. Regressions are dropped and counted as
    /// anomalies; they never fail the adapter.
    pub async fn report_progress(&self, value: u8) {
        self.progress.report(value).await;
    }

    pub async fn emit_finding(&self, draft: FindingDraft) {
        self.progress.finding(draft).await;
    }
}

/// Routes adapter reports into the store for a single job.
#[derive(Clone)]
pub struct ProgressSink {
    job_id: JobId,
    store: Arc<ScanStore>,
    clock: Arc<dyn Clock>,
    /// `None` while the worker waits between attempts.
    last_activity: Arc<Mutex<Option<Instant>>>,
    resumed: Arc<Notify>,
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink")
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl ProgressSink {
    pub(crate) fn new(job_id: JobId, store: Arc<ScanStore>, clock: Arc<dyn Clock>) -> Self {
        let last_activity = Arc::new(Mutex::new(Some(clock.now())));
        Self {
            job_id,
            store,
            clock,
            last_activity,
            resumed: Arc::new(Notify::new()),
        }
    }

    /// Instant of the last accepted progress report, or `None` while paused.
    pub(crate) fn last_activity(&self) -> Option<Instant> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records activity now and ends any pause.
    pub(crate) fn touch(&self) {
        let now = self.clock.now();
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.resumed.notify_one();
    }

    /// Stops the liveness clock until the next [`ProgressSink::touch`].
    pub(crate) fn pause(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Resolves after the next [`ProgressSink::touch`] (or a stored one).
    pub(crate) async fn resumed(&self) {
        self.resumed.notified().await;
    }

    pub async fn report(&self, value: u8) {
        match self
            .store
            .mutate(self.job_id, JobMutation::Progress { value })
            .await
        {
            Ok(_) => self.touch(),
            Err(err) => self.store.record_anomaly(self.job_id, &err),
        }
    }

    pub async fn finding(&self, draft: FindingDraft) {
        let finding = Finding::from_draft(self.job_id, draft, self.clock.utc_now());
        match self
            .store
            .mutate(self.job_id, JobMutation::AddFinding { finding })
            .await
        {
            Ok(_) => {}
            Err(ReconError::Cancelled(reason)) => {
                tracing::debug!(target: "recon::worker", job = %self.job_id, "{reason}");
            }
            Err(err) => self.store.record_anomaly(self.job_id, &err),
        }
    }
}

/// Scan type to adapter mapping. Built once before the runtime starts.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ScanType, Arc<dyn ScanAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("registered", &self.registered_types())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the TCP connect and DNS enumeration adapters.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TcpConnectAdapter::default()));
        registry.register(Arc::new(DnsEnumerationAdapter::default()));
        registry
    }

    /// Registers `adapter` under its own scan type, returning any adapter it
    /// replaced.
    pub fn register(&mut self, adapter: Arc<dyn ScanAdapter>) -> Option<Arc<dyn ScanAdapter>> {
        self.adapters.insert(adapter.scan_type(), adapter)
    }

    pub fn get(&self, scan_type: ScanType) -> Option<Arc<dyn ScanAdapter>> {
        self.adapters.get(&scan_type).cloned()
    }

    pub fn contains(&self, scan_type: ScanType) -> bool {
        self.adapters.contains_key(&scan_type)
    }

    pub fn registered_types(&self) -> Vec<ScanType> {
        let mut types: Vec<_> = self.adapters.keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoopAdapter(ScanType);

    #[async_trait]
    impl ScanAdapter for NoopAdapter {
        fn scan_type(&self) -> ScanType {
            self.0
        }

        async fn run(&self, _ctx: &ScanContext) -> Result<Vec<FindingDraft>, AdapterError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn registry_replaces_by_scan_type() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.register(Arc::new(NoopAdapter(ScanType::WebCrawl))).is_none());
        assert!(registry.register(Arc::new(NoopAdapter(ScanType::WebCrawl))).is_some());
        assert!(registry.contains(ScanType::WebCrawl));
        assert!(!registry.contains(ScanType::OsintGathering));
    }

    #[test]
    fn builtin_registry_covers_port_and_dns() {
        let registry = AdapterRegistry::with_builtin();
        assert_eq!(
            registry.registered_types(),
            vec![ScanType::PortScan, ScanType::DnsEnumeration]
        );
    }
}
