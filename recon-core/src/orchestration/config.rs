use std::path::PathBuf;
use std::time::Duration;

use recon_model::ScanType;
use serde::{Deserialize, Serialize};

/// Global knobs that tune orchestrator behaviour. Read once at startup.
///
/// All fields carry defaults so a configuration file only needs to mention
/// what it overrides.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker slots shared by every scan type.
    pub max_concurrent: usize,
    /// Running jobs allowed against a single target. `None` disables the cap.
    pub max_per_target: Option<usize>,
    /// How long a running adapter gets to acknowledge cancellation before the
    /// job is forced to `Cancelled`.
    pub cancel_grace_ms: u64,
    /// Ring size for each event subscriber.
    pub event_buffer: usize,
    pub journal: JournalConfig,
    pub per_type: PerTypePolicies,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_per_target: Some(2),
            cancel_grace_ms: 5_000,
            event_buffer: 512,
            journal: JournalConfig::default(),
            per_type: PerTypePolicies::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn policy_for(&self, scan_type: ScanType) -> &ScanTypePolicy {
        self.per_type.policy_for(scan_type)
    }

    pub fn policy_for_mut(&mut self, scan_type: ScanType) -> &mut ScanTypePolicy {
        self.per_type.policy_for_mut(scan_type)
    }

    /// Applies `policy` to every scan type.
    pub fn with_uniform_policy(mut self, policy: ScanTypePolicy) -> Self {
        for scan_type in ScanType::ALL {
            *self.policy_for_mut(scan_type) = policy.clone();
        }
        self
    }
}

/// Optional append-only mutation log.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct JournalConfig {
    pub path: Option<PathBuf>,
}

/// Execution policy per scan type. Keyed by field rather than a map so config
/// files read `[per_type.port_scan]`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PerTypePolicies {
    pub port_scan: ScanTypePolicy,
    pub vulnerability_scan: ScanTypePolicy,
    pub dns_enumeration: ScanTypePolicy,
    pub web_crawl: ScanTypePolicy,
    pub osint_gathering: ScanTypePolicy,
}

impl PerTypePolicies {
    pub fn policy_for(&self, scan_type: ScanType) -> &ScanTypePolicy {
        match scan_type {
            ScanType::PortScan => &self.port_scan,
            ScanType::VulnerabilityScan => &self.vulnerability_scan,
            ScanType::DnsEnumeration => &self.dns_enumeration,
            ScanType::WebCrawl => &self.web_crawl,
            ScanType::OsintGathering => &self.osint_gathering,
        }
    }

    pub fn policy_for_mut(&mut self, scan_type: ScanType) -> &mut ScanTypePolicy {
        match scan_type {
            ScanType::PortScan => &mut self.port_scan,
            ScanType::VulnerabilityScan => &mut self.vulnerability_scan,
            ScanType::DnsEnumeration => &mut self.dns_enumeration,
            ScanType::WebCrawl => &mut self.web_crawl,
            ScanType::OsintGathering => &mut self.osint_gathering,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ScanType, &ScanTypePolicy)> {
        ScanType::ALL
            .into_iter()
            .map(move |scan_type| (scan_type, self.policy_for(scan_type)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanTypePolicy {
    /// Wall time budget measured from `Running`, covering every attempt and
    /// backoff wait. `None` disables the timeout.
    pub timeout_ms: Option<u64>,
    /// Maximum silence between progress reports before the job is failed as
    /// stalled. `None` disables the watchdog.
    pub liveness_timeout_ms: Option<u64>,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Proportional jitter added to each backoff delay, in `[0, 1]`.
    pub jitter_ratio: f32,
    /// Tie-break weight among jobs queued at the same instant; higher first.
    pub priority_weight: u32,
}

impl Default for ScanTypePolicy {
    fn default() -> Self {
        Self {
            timeout_ms: Some(15 * 60 * 1_000),
            liveness_timeout_ms: None,
            max_retries: 2,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.0,
            priority_weight: 1,
        }
    }
}

impl ScanTypePolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_ms.map(Duration::from_millis)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Un-jittered delay before retry `retry` (1-based):
    /// `min(base * 2^(retry - 1), max)`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = ScanTypePolicy {
            backoff_base_ms: 500,
            backoff_max_ms: 3_000,
            ..ScanTypePolicy::default()
        };
        let delays: Vec<u64> = (1..=5)
            .map(|retry| policy.backoff_for(retry).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000]);
        assert_eq!(policy.backoff_for(200), Duration::from_millis(3_000));
    }

    #[test]
    fn uniform_policy_applies_to_every_type() {
        let policy = ScanTypePolicy {
            max_retries: 7,
            ..ScanTypePolicy::default()
        };
        let config = OrchestratorConfig::default().with_uniform_policy(policy);
        assert!(config.per_type.iter().all(|(_, p)| p.max_retries == 7));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{ "max_concurrent": 8, "per_type": { "web_crawl": { "max_retries": 0 } } }"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.max_per_target, Some(2));
        assert_eq!(config.policy_for(ScanType::WebCrawl).max_retries, 0);
        assert_eq!(config.policy_for(ScanType::PortScan).max_retries, 2);
    }
}
