use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use recon_core::adapters::{AdapterRegistry, DnsEnumerationAdapter, TcpConnectAdapter};
use recon_core::orchestration::OrchestratorConfig;
use serde::{Deserialize, Serialize};

/// Source that produced the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReconConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl std::fmt::Display for ReconConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconConfigSource::Default => f.write_str("built-in defaults"),
            ReconConfigSource::EnvPath(path) => {
                write!(f, "$RECON_CONFIG_PATH ({})", path.display())
            }
            ReconConfigSource::EnvInline => f.write_str("$RECON_CONFIG_JSON"),
            ReconConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Top-level settings. Orchestrator knobs sit at the top level of the file;
/// built-in adapter tuning lives under `[adapters]`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconConfig {
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    pub adapters: AdapterSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub tcp_connect: TcpConnectSettings,
    pub dns: DnsSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConnectSettings {
    /// Per-port connect timeout.
    pub connect_timeout_ms: u64,
    /// Simultaneous connection attempts per job.
    pub concurrency: usize,
}

impl Default for TcpConnectSettings {
    fn default() -> Self {
        let adapter = TcpConnectAdapter::default();
        Self {
            connect_timeout_ms: adapter.connect_timeout.as_millis() as u64,
            concurrency: adapter.concurrency,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Subdomain labels to probe. `None` keeps the built-in list.
    pub wordlist: Option<Vec<String>>,
}

impl AdapterSettings {
    /// Registry with the built-in adapters tuned from these settings.
    pub fn registry(&self) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(TcpConnectAdapter {
            connect_timeout: Duration::from_millis(self.tcp_connect.connect_timeout_ms),
            concurrency: self.tcp_connect.concurrency,
        }));
        let mut dns = DnsEnumerationAdapter::default();
        if let Some(wordlist) = &self.dns.wordlist {
            dns.wordlist = wordlist.clone();
        }
        registry.register(Arc::new(dns));
        registry
    }
}

impl ReconConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read recon config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid recon config {}", path.display())),
            Some("toml") | Some("tml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid recon config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // TOML first, then JSON.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse recon config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid recon config json: {err}"))
    }

    pub fn registry(&self) -> AdapterRegistry {
        self.adapters.registry()
    }
}
