use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use recon_model::{FindingDraft, ScanType, Severity};
use serde_json::json;
use tokio::net::TcpStream;
use tracing::debug;

use super::{AdapterError, ScanAdapter, ScanContext};

const DEFAULT_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 143, 443, 445, 3306, 3389, 5432, 6379, 8080, 8443, 27017,
];

/// Plain TCP connect scanner. A port is reported open when the three-way
/// handshake completes within the connect timeout.
///
/// Options:
/// - `ports`: comma separated ports and inclusive ranges (`22,80,8000-8100`)
/// - `connect_timeout_ms`: per-port connect timeout
/// - `concurrency`: simultaneous connection attempts
#[derive(Debug, Clone)]
pub struct TcpConnectAdapter {
    pub connect_timeout: Duration,
    pub concurrency: usize,
}

impl Default for TcpConnectAdapter {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1_000),
            concurrency: 64,
        }
    }
}

/// Parses a port specification such as `22,80,443` or `1-1024`.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>, AdapterError> {
    let mut ports = BTreeSet::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_port(start)?;
                let end = parse_port(end)?;
                if start > end {
                    return Err(AdapterError::Fatal(format!("inverted port range {part}")));
                }
                ports.extend(start..=end);
            }
            None => {
                ports.insert(parse_port(part)?);
            }
        }
    }
    if ports.is_empty() {
        return Err(AdapterError::Fatal("no ports to scan".into()));
    }
    Ok(ports.into_iter().collect())
}

fn parse_port(raw: &str) -> Result<u16, AdapterError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(AdapterError::Fatal(format!("invalid port {raw:?}"))),
        Ok(port) => Ok(port),
    }
}

fn classify_port(port: u16) -> (Severity, &'static str) {
    match port {
        23 => (Severity::High, "telnet"),
        445 => (Severity::High, "smb"),
        3389 => (Severity::High, "rdp"),
        21 => (Severity::Medium, "ftp"),
        3306 => (Severity::Medium, "mysql"),
        5432 => (Severity::Medium, "postgresql"),
        6379 => (Severity::Medium, "redis"),
        27017 => (Severity::Medium, "mongodb"),
        22 => (Severity::Low, "ssh"),
        25 => (Severity::Low, "smtp"),
        53 => (Severity::Low, "dns"),
        80 | 8080 => (Severity::Low, "http"),
        443 | 8443 => (Severity::Low, "https"),
        110 => (Severity::Low, "pop3"),
        143 => (Severity::Low, "imap"),
        _ => (Severity::Low, "unknown"),
    }
}

async fn resolve(ctx: &ScanContext) -> Result<IpAddr, AdapterError> {
    if let Some(ip) = ctx.target.ip() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((ctx.target.as_str(), 0))
        .await
        .map_err(|err| AdapterError::Retryable(format!("resolve {}: {err}", ctx.target)))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| AdapterError::Fatal(format!("{} has no addresses", ctx.target)))
}

#[async_trait]
impl ScanAdapter for TcpConnectAdapter {
    fn scan_type(&self) -> ScanType {
        ScanType::PortScan
    }

    async fn run(&self, ctx: &ScanContext) -> Result<Vec<FindingDraft>, AdapterError> {
        let ports = match ctx.option("ports") {
            Some(spec) => parse_ports(spec)?,
            None => DEFAULT_PORTS.to_vec(),
        };
        let connect_timeout = ctx
            .option("connect_timeout_ms")
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.connect_timeout);
        let concurrency = ctx
            .option("concurrency")
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(self.concurrency)
            .max(1);

        let ip = resolve(ctx).await?;
        let total = ports.len();
        debug!(target: "recon::worker", job = %ctx.job_id, %ip, ports = total, "tcp connect scan");

        let mut probes = futures::stream::iter(ports)
            .map(|port| async move {
                let addr = SocketAddr::new(ip, port);
                let open = tokio::select! {
                    result = TcpStream::connect(addr) => result.is_ok(),
                    _ = ctx.clock().sleep(connect_timeout) => false,
                };
                (port, open)
            })
            .buffer_unordered(concurrency);

        let mut done = 0usize;
        let mut open_ports = Vec::new();
        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(AdapterError::Cancelled),
                next = probes.next() => next,
            };
            let Some((port, open)) = next else { break };
            done += 1;

            if open {
                let (severity, service) = classify_port(port);
                let draft = FindingDraft::new(format!("open port {port}/tcp ({service})"), severity)
                    .with_evidence(json!({
                        "address": ip.to_string(),
                        "port": port,
                        "protocol": "tcp",
                        "service": service,
                    }));
                ctx.emit_finding(draft).await;
                open_ports.push(port);
            }

            // 100 is reserved for completion.
            let percent = (done * 99 / total) as u8;
            ctx.report_progress(percent).await;
        }

        debug!(target: "recon::worker", job = %ctx.job_id, open = ?open_ports, "tcp connect scan finished");
        Ok(Vec::new())
    }
}
