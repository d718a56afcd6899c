use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Reconnaissance operations the orchestrator knows how to schedule.
///
/// The set is closed; a type only becomes runnable once an adapter for it is
/// registered with the runtime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    PortScan,
    VulnerabilityScan,
    DnsEnumeration,
    WebCrawl,
    OsintGathering,
}

impl ScanType {
    pub const ALL: [ScanType; 5] = [
        ScanType::PortScan,
        ScanType::VulnerabilityScan,
        ScanType::DnsEnumeration,
        ScanType::WebCrawl,
        ScanType::OsintGathering,
    ];

    /// Stable machine-readable key, identical to the serde representation.
    pub fn key(&self) -> &'static str {
        match self {
            ScanType::PortScan => "port_scan",
            ScanType::VulnerabilityScan => "vulnerability_scan",
            ScanType::DnsEnumeration => "dns_enumeration",
            ScanType::WebCrawl => "web_crawl",
            ScanType::OsintGathering => "osint_gathering",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScanType::PortScan => "Port Scan",
            ScanType::VulnerabilityScan => "Vulnerability Scan",
            ScanType::DnsEnumeration => "DNS Enumeration",
            ScanType::WebCrawl => "Web Crawl",
            ScanType::OsintGathering => "OSINT Gathering",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ScanType {
    type Err = ModelError;

    /// Accepts `port_scan`, `port-scan` and `Port Scan` style spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .flat_map(char::to_lowercase)
            .collect();

        match folded.as_str() {
            "portscan" => Ok(ScanType::PortScan),
            "vulnerabilityscan" => Ok(ScanType::VulnerabilityScan),
            "dnsenumeration" => Ok(ScanType::DnsEnumeration),
            "webcrawl" => Ok(ScanType::WebCrawl),
            "osintgathering" => Ok(ScanType::OsintGathering),
            _ => Err(ModelError::UnknownScanType(s.to_string())),
        }
    }
}

/// Lifecycle status of a scan job. Completed, Failed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Queued | JobStatus::Running => false,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ModelError::UnknownStatus(s.to_string()))
    }
}

/// Ordinal risk classification of a finding. `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Dense index usable for fixed-size counter arrays.
    pub fn index(&self) -> usize {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|severity| severity.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ModelError::UnknownSeverity(s.to_string()))
    }
}

/// Why a job ended in `Failed`. Recorded on the job and carried by the
/// status-change event; never raised across the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    /// The per-type execution timeout elapsed.
    Timeout,
    /// No progress was reported within the liveness window.
    Stalled,
    AdapterUnavailable {
        message: String,
    },
    AdapterError {
        message: String,
    },
    RetriesExhausted {
        attempts: u32,
        last_error: String,
    },
    /// The job was running when the process stopped; set during journal replay.
    Interrupted,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Stalled => "stalled",
            FailureReason::AdapterUnavailable { .. } => "adapter_unavailable",
            FailureReason::AdapterError { .. } => "adapter_error",
            FailureReason::RetriesExhausted { .. } => "retries_exhausted",
            FailureReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout
            | FailureReason::Stalled
            | FailureReason::Interrupted => f.write_str(self.code()),
            FailureReason::AdapterUnavailable { message }
            | FailureReason::AdapterError { message } => {
                write!(f, "{}: {message}", self.code())
            }
            FailureReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "{} after {attempts} attempts: {last_error}",
                self.code()
            ),
        }
    }
}
