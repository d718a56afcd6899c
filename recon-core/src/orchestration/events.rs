use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_model::{FailureReason, Finding, JobId, JobStatus, ScanType, Target};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Change carried by a [`ScanEvent`]. Every successful store mutation
/// produces exactly one of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEventKind {
    JobCreated,
    JobStatusChanged {
        old: JobStatus,
        new: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<FailureReason>,
    },
    ProgressUpdated {
        value: u8,
    },
    FindingAdded {
        finding: Finding,
    },
    RetryScheduled {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    CancellationRequested,
    JobRemoved,
}

impl ScanEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScanEventKind::JobCreated => "job_created",
            ScanEventKind::JobStatusChanged { .. } => "job_status_changed",
            ScanEventKind::ProgressUpdated { .. } => "progress_updated",
            ScanEventKind::FindingAdded { .. } => "finding_added",
            ScanEventKind::RetryScheduled { .. } => "retry_scheduled",
            ScanEventKind::CancellationRequested => "cancellation_requested",
            ScanEventKind::JobRemoved => "job_removed",
        }
    }
}

/// Fully qualified event. `revision` is the job's mutation counter after the
/// change, so per-job order can be checked by subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub job_id: JobId,
    pub scan_type: ScanType,
    pub target: Target,
    pub revision: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ScanEventKind,
}

/// Item yielded by a subscription stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum BusMessage {
    Event(ScanEvent),
    /// The subscriber fell behind and the oldest `skipped` events were dropped.
    Lagging { skipped: u64 },
}

/// Subscription filter. Unset fields match everything; set fields are ANDed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub job_id: Option<JobId>,
    pub scan_type: Option<ScanType>,
    pub target: Option<Target>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn with_scan_type(mut self, scan_type: ScanType) -> Self {
        self.scan_type = Some(scan_type);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn matches(&self, event: &ScanEvent) -> bool {
        self.job_id.is_none_or(|id| id == event.job_id)
            && self.scan_type.is_none_or(|t| t == event.scan_type)
            && self.target.as_ref().is_none_or(|t| *t == event.target)
    }
}

#[async_trait]
pub trait ScanEventPublisher: Send + Sync {
    async fn publish(&self, event: ScanEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(scan_type: ScanType, target: &str) -> ScanEvent {
        ScanEvent {
            job_id: JobId::new(),
            scan_type,
            target: Target::parse(target).unwrap(),
            revision: 1,
            at: Utc::now(),
            kind: ScanEventKind::JobCreated,
        }
    }

    #[test]
    fn filter_fields_are_anded() {
        let port = event(ScanType::PortScan, "10.0.0.1");
        let dns = event(ScanType::DnsEnumeration, "example.com");

        let by_type = EventFilter::all().with_scan_type(ScanType::PortScan);
        assert!(by_type.matches(&port));
        assert!(!by_type.matches(&dns));

        let narrowed = by_type.with_target(Target::parse("10.0.0.2").unwrap());
        assert!(!narrowed.matches(&port));

        assert!(EventFilter::for_job(dns.job_id).matches(&dns));
        assert!(!EventFilter::for_job(dns.job_id).matches(&port));
    }

    #[test]
    fn events_serialize_with_flat_type_tag() {
        let mut ev = event(ScanType::WebCrawl, "example.org");
        ev.kind = ScanEventKind::ProgressUpdated { value: 40 };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "progress_updated");
        assert_eq!(value["value"], 40);
        assert_eq!(value["scan_type"], "web_crawl");
    }
}
