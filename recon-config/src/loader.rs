use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};

use crate::models::{ReconConfig, ReconConfigSource};
use crate::validation::{ConfigWarnings, apply_guard_rails};

pub const CONFIG_PATH_VAR: &str = "RECON_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "RECON_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &[
    "recon.toml",
    "recon.json",
    "config/recon.toml",
    "config/recon.json",
];

/// Raw inputs consulted while resolving configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    /// Directory searched for the default config files.
    pub search_root: PathBuf,
}

/// A resolved, guard-railed configuration.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: ReconConfig,
    pub source: ReconConfigSource,
    pub warnings: ConfigWarnings,
}

impl ConfigSources {
    pub fn from_env() -> Self {
        Self {
            config_path: env::var(CONFIG_PATH_VAR)
                .ok()
                .filter(|raw| !raw.trim().is_empty())
                .map(PathBuf::from),
            config_json: env::var(CONFIG_JSON_VAR)
                .ok()
                .filter(|raw| !raw.trim().is_empty()),
            search_root: PathBuf::from("."),
        }
    }

    /// Sources with an explicit file, as passed on the command line.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Evaluation order:
    /// 1) the explicit config path (`$RECON_CONFIG_PATH`), TOML or JSON,
    /// 2) inline JSON (`$RECON_CONFIG_JSON`),
    /// 3) the first default file found under `search_root`,
    /// 4) built-in defaults.
    pub fn resolve(&self) -> anyhow::Result<(ReconConfig, ReconConfigSource)> {
        if let Some(path) = &self.config_path {
            let config = ReconConfig::load_from_file(path)?;
            return Ok((config, ReconConfigSource::EnvPath(path.clone())));
        }

        if let Some(raw) = &self.config_json {
            let config = ReconConfig::parse_json(raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
            return Ok((config, ReconConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = ReconConfig::load_from_file(&path)?;
            return Ok((config, ReconConfigSource::File(path)));
        }

        Ok((ReconConfig::default(), ReconConfigSource::Default))
    }

    /// Resolves the configuration and runs the guard rails. Warnings are
    /// logged and returned.
    pub fn load(&self) -> anyhow::Result<ConfigLoad> {
        let (config, source) = self.resolve()?;
        let warnings = apply_guard_rails(&config)
            .with_context(|| format!("configuration from {source} rejected"))?;

        for warning in &warnings.items {
            match &warning.hint {
                Some(hint) => {
                    warn!(message = %warning.message, hint = %hint, "configuration warning")
                }
                None => warn!(message = %warning.message, "configuration warning"),
            }
        }
        info!(%source, max_concurrent = config.orchestrator.max_concurrent, "configuration loaded");

        Ok(ConfigLoad {
            config,
            source,
            warnings,
        })
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| self.search_root.join(Path::new(candidate)))
            .find(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources_in(root: &Path) -> ConfigSources {
        ConfigSources {
            search_root: root.to_path_buf(),
            ..ConfigSources::default()
        }
    }

    #[test]
    fn explicit_path_beats_inline_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "max_concurrent = 3\n").unwrap();

        let sources = ConfigSources {
            config_path: Some(path.clone()),
            config_json: Some(r#"{"max_concurrent": 9}"#.into()),
            search_root: dir.path().to_path_buf(),
        };
        let (config, source) = sources.resolve().unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 3);
        assert_eq!(source, ReconConfigSource::EnvPath(path));
    }

    #[test]
    fn inline_json_beats_default_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("recon.toml"), "max_concurrent = 3\n").unwrap();

        let sources = ConfigSources {
            config_json: Some(r#"{"max_concurrent": 9}"#.into()),
            ..sources_in(dir.path())
        };
        let (config, source) = sources.resolve().unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 9);
        assert_eq!(source, ReconConfigSource::EnvInline);
    }

    #[test]
    fn default_files_are_searched_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(
            dir.path().join("config").join("recon.json"),
            r#"{"max_concurrent": 6}"#,
        )
        .unwrap();

        let (config, source) = sources_in(dir.path()).resolve().unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 6);
        assert_eq!(
            source,
            ReconConfigSource::File(dir.path().join("config/recon.json"))
        );
    }

    #[test]
    fn falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, source) = sources_in(dir.path()).resolve().unwrap();
        assert_eq!(config, ReconConfig::default());
        assert_eq!(source, ReconConfigSource::Default);
    }

    #[test]
    fn load_rejects_guard_rail_violations() {
        let dir = tempfile::tempdir().unwrap();
        let sources = ConfigSources {
            config_json: Some(r#"{"max_concurrent": 0}"#.into()),
            ..sources_in(dir.path())
        };
        let err = sources.load().unwrap_err();
        assert!(format!("{err:#}").contains("max_concurrent"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sources = ConfigSources::with_path(dir.path().join("absent.toml"));
        assert!(sources.resolve().is_err());
    }
}
