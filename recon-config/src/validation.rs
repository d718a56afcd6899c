use recon_model::ScanType;
use thiserror::Error;

use crate::models::ReconConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigGuardRailError {
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,
    #[error("max_per_target must be at least 1 when set")]
    ZeroPerTargetCap,
    #[error("event_buffer must be at least 1")]
    ZeroEventBuffer,
    #[error("per_type.{scan_type}: {reason}")]
    InvalidPolicy {
        scan_type: &'static str,
        reason: String,
    },
    #[error("adapters.{adapter}: {reason}")]
    InvalidAdapterSettings {
        adapter: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(config: &ReconConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let orchestrator = &config.orchestrator;

    if orchestrator.max_concurrent == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrency);
    }
    match orchestrator.max_per_target {
        Some(0) => return Err(ConfigGuardRailError::ZeroPerTargetCap),
        Some(cap) if cap > orchestrator.max_concurrent => warnings.push_with_hint(
            format!(
                "max_per_target ({cap}) exceeds max_concurrent ({}); the per-target cap never binds",
                orchestrator.max_concurrent
            ),
            "Lower max_per_target or remove it",
        ),
        _ => {}
    }
    if orchestrator.event_buffer == 0 {
        return Err(ConfigGuardRailError::ZeroEventBuffer);
    }

    for (scan_type, policy) in orchestrator.per_type.iter() {
        let invalid = |reason: String| ConfigGuardRailError::InvalidPolicy {
            scan_type: scan_type.key(),
            reason,
        };

        if policy.backoff_base_ms > policy.backoff_max_ms {
            return Err(invalid(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                policy.backoff_base_ms, policy.backoff_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&policy.jitter_ratio) {
            return Err(invalid(format!(
                "jitter_ratio {} is outside [0, 1]",
                policy.jitter_ratio
            )));
        }
        if policy.priority_weight == 0 {
            return Err(invalid("priority_weight must be at least 1".into()));
        }
        if let (Some(liveness), Some(timeout)) = (policy.liveness_timeout_ms, policy.timeout_ms)
            && liveness >= timeout
        {
            warnings.push_with_hint(
                format!(
                    "per_type.{}: liveness_timeout_ms ({liveness}) is not shorter than timeout_ms ({timeout})",
                    scan_type.key()
                ),
                "The overall timeout will always fire first; lower liveness_timeout_ms",
            );
        }
        if policy.timeout_ms.is_none() && scan_type == ScanType::VulnerabilityScan {
            warnings.push(
                "per_type.vulnerability_scan has no timeout; a hung scanner holds its slot forever",
            );
        }
    }

    let tcp = &config.adapters.tcp_connect;
    if tcp.concurrency == 0 {
        return Err(ConfigGuardRailError::InvalidAdapterSettings {
            adapter: "tcp_connect",
            reason: "concurrency must be at least 1".into(),
        });
    }
    if tcp.connect_timeout_ms == 0 {
        return Err(ConfigGuardRailError::InvalidAdapterSettings {
            adapter: "tcp_connect",
            reason: "connect_timeout_ms must be at least 1".into(),
        });
    }
    if config
        .adapters
        .dns
        .wordlist
        .as_ref()
        .is_some_and(|words| words.iter().all(|word| word.trim().is_empty()))
    {
        return Err(ConfigGuardRailError::InvalidAdapterSettings {
            adapter: "dns",
            reason: "wordlist is set but empty".into(),
        });
    }

    if orchestrator.journal.path.is_none() {
        warnings.push_with_hint(
            "No journal configured; scan state is lost on restart",
            "Set journal.path to keep an append-only mutation log",
        );
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn journaled() -> ReconConfig {
        let mut config = ReconConfig::default();
        config.orchestrator.journal.path = Some(PathBuf::from("state/recon.jsonl"));
        config
    }

    #[test]
    fn defaults_with_journal_pass_cleanly() {
        let warnings = apply_guard_rails(&journaled()).unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn missing_journal_is_only_a_warning() {
        let warnings = apply_guard_rails(&ReconConfig::default()).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings.items[0].hint.is_some());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = journaled();
        config.orchestrator.max_concurrent = 0;
        assert_eq!(
            apply_guard_rails(&config).unwrap_err(),
            ConfigGuardRailError::ZeroConcurrency
        );

        let mut config = journaled();
        config.orchestrator.max_per_target = Some(0);
        assert_eq!(
            apply_guard_rails(&config).unwrap_err(),
            ConfigGuardRailError::ZeroPerTargetCap
        );

        let mut config = journaled();
        config.orchestrator.event_buffer = 0;
        assert_eq!(
            apply_guard_rails(&config).unwrap_err(),
            ConfigGuardRailError::ZeroEventBuffer
        );

        let mut config = journaled();
        config.adapters.tcp_connect.concurrency = 0;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::InvalidAdapterSettings { adapter: "tcp_connect", .. })
        ));
    }

    #[test]
    fn policy_violations_name_the_scan_type() {
        let mut config = journaled();
        let policy = config.orchestrator.policy_for_mut(ScanType::WebCrawl);
        policy.backoff_base_ms = 60_000;
        policy.backoff_max_ms = 1_000;
        let err = apply_guard_rails(&config).unwrap_err();
        assert!(err.to_string().starts_with("per_type.web_crawl"), "{err}");

        let mut config = journaled();
        config.orchestrator.policy_for_mut(ScanType::PortScan).jitter_ratio = 1.5;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::InvalidPolicy { scan_type: "port_scan", .. })
        ));

        let mut config = journaled();
        config.orchestrator.policy_for_mut(ScanType::OsintGathering).priority_weight = 0;
        assert!(apply_guard_rails(&config).is_err());
    }

    #[test]
    fn soft_problems_become_warnings() {
        let mut config = journaled();
        config.orchestrator.max_concurrent = 2;
        config.orchestrator.max_per_target = Some(3);
        let policy = config.orchestrator.policy_for_mut(ScanType::DnsEnumeration);
        policy.timeout_ms = Some(10_000);
        policy.liveness_timeout_ms = Some(20_000);

        let warnings = apply_guard_rails(&config).unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.items[0].message.contains("max_per_target"));
        assert!(warnings.items[1].message.contains("dns_enumeration"));
    }
}
