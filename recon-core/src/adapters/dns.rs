use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use recon_model::{FindingDraft, ScanType, Severity};
use serde_json::json;
use tracing::debug;

use super::{AdapterError, ScanAdapter, ScanContext};

const DEFAULT_WORDLIST: &[&str] = &[
    "www", "mail", "ftp", "dev", "api", "vpn", "staging", "admin", "test", "portal",
];

/// Labels that usually point at non-production or administrative surfaces.
const SENSITIVE_LABELS: &[&str] = &["dev", "staging", "test", "admin", "vpn"];

/// Subdomain enumerator driven by the system resolver.
///
/// Options:
/// - `subdomains`: comma separated labels to try instead of the built-in list
#[derive(Debug, Clone)]
pub struct DnsEnumerationAdapter {
    pub wordlist: Vec<String>,
}

impl Default for DnsEnumerationAdapter {
    fn default() -> Self {
        Self {
            wordlist: DEFAULT_WORDLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn severity_for(label: &str) -> Severity {
    if SENSITIVE_LABELS.contains(&label) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

async fn lookup(name: &str) -> Option<BTreeSet<IpAddr>> {
    let addrs = tokio::net::lookup_host((name, 0)).await.ok()?;
    let ips: BTreeSet<IpAddr> = addrs.map(|addr| addr.ip()).collect();
    (!ips.is_empty()).then_some(ips)
}

#[async_trait]
impl ScanAdapter for DnsEnumerationAdapter {
    fn scan_type(&self) -> ScanType {
        ScanType::DnsEnumeration
    }

    async fn run(&self, ctx: &ScanContext) -> Result<Vec<FindingDraft>, AdapterError> {
        if ctx.target.is_ip() {
            return Err(AdapterError::Fatal(format!(
                "{} is an address, DNS enumeration needs a domain",
                ctx.target
            )));
        }
        let domain = ctx.target.as_str();
        let labels: Vec<String> = match ctx.option("subdomains") {
            Some(list) => list
                .split(',')
                .map(|label| label.trim().to_ascii_lowercase())
                .filter(|label| !label.is_empty())
                .collect(),
            None => self.wordlist.clone(),
        };
        if labels.is_empty() {
            return Err(AdapterError::Fatal("empty subdomain list".into()));
        }

        let mut findings = Vec::new();
        for (index, label) in labels.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(AdapterError::Cancelled);
            }

            let name = format!("{label}.{domain}");
            let resolved = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(AdapterError::Cancelled),
                resolved = lookup(&name) => resolved,
            };

            if let Some(ips) = resolved {
                debug!(target: "recon::worker", job = %ctx.job_id, %name, "subdomain resolved");
                findings.push(
                    FindingDraft::new(format!("subdomain {name} resolves"), severity_for(label))
                        .with_evidence(json!({
                            "name": name,
                            "addresses": ips.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        })),
                );
            }

            let percent = ((index + 1) * 99 / labels.len()) as u8;
            ctx.report_progress(percent).await;
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_hosts_rank_above_www() {
        assert_eq!(severity_for("staging"), Severity::Medium);
        assert_eq!(severity_for("www"), Severity::Low);
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let ips = lookup("localhost").await.expect("localhost resolves");
        assert!(ips.iter().any(IpAddr::is_loopback));
    }
}
