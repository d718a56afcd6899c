use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{FindingId, JobId};
use crate::scan::Severity;

/// A discrete result produced by a scan job. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub job_id: JobId,
    pub description: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub evidence: serde_json::Value,
    pub discovered_at: DateTime<Utc>,
}

impl Finding {
    pub fn from_draft(job_id: JobId, draft: FindingDraft, discovered_at: DateTime<Utc>) -> Self {
        Finding {
            id: FindingId::new(),
            job_id,
            description: draft.description,
            severity: draft.severity,
            evidence: draft.evidence,
            discovered_at,
        }
    }
}

/// Finding content as emitted by an adapter, before the store assigns
/// identity and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingDraft {
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub evidence: serde_json::Value,
}

impl FindingDraft {
    pub fn new(description: impl Into<String>, severity: Severity) -> Self {
        FindingDraft {
            description: description.into(),
            severity,
            evidence: serde_json::Value::Null,
        }
    }

    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Per-severity finding counters indexed by [`Severity::index`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl SeverityCounts {
    pub fn get(&self, severity: Severity) -> u64 {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }

    fn slot(&mut self, severity: Severity) -> &mut u64 {
        match severity {
            Severity::Low => &mut self.low,
            Severity::Medium => &mut self.medium,
            Severity::High => &mut self.high,
            Severity::Critical => &mut self.critical,
        }
    }

    pub fn add(&mut self, severity: Severity) {
        *self.slot(severity) += 1;
    }

    pub fn add_all(&mut self, other: &SeverityCounts) {
        for severity in Severity::ALL {
            *self.slot(severity) += other.get(severity);
        }
    }

    /// Subtracts `other`, saturating at zero.
    pub fn subtract_all(&mut self, other: &SeverityCounts) {
        for severity in Severity::ALL {
            let slot = self.slot(severity);
            *slot = slot.saturating_sub(other.get(severity));
        }
    }

    pub fn total(&self) -> u64 {
        self.low + self.medium + self.high + self.critical
    }

    /// Highest severity with a non-zero count.
    pub fn max(&self) -> Option<Severity> {
        Severity::ALL
            .into_iter()
            .rev()
            .find(|severity| self.get(*severity) > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_maximum_severity() {
        let mut counts = SeverityCounts::default();
        assert_eq!(counts.max(), None);

        counts.add(Severity::Low);
        counts.add(Severity::High);
        counts.add(Severity::Low);
        assert_eq!(counts.max(), Some(Severity::High));
        assert_eq!(counts.get(Severity::Low), 2);
        assert_eq!(counts.total(), 3);

        let mut other = SeverityCounts::default();
        other.add(Severity::Critical);
        counts.add_all(&other);
        assert_eq!(counts.max(), Some(Severity::Critical));

        counts.subtract_all(&other);
        counts.subtract_all(&other);
        assert_eq!(counts.critical, 0);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn finding_from_draft_keeps_content() {
        let job_id = JobId::new();
        let draft = FindingDraft::new("open port 22/tcp", Severity::Low)
            .with_evidence(serde_json::json!({ "port": 22 }));
        let finding = Finding::from_draft(job_id, draft, Utc::now());
        assert_eq!(finding.job_id, job_id);
        assert_eq!(finding.severity, Severity::Low);
        assert_eq!(finding.evidence["port"], 22);
    }
}
