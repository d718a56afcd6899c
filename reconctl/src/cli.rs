use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use recon_model::{JobStatus, Severity};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "reconctl", version)]
#[command(about = "Run reconnaissance scans through the ReconWhisper orchestrator")]
pub struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, global = true, env = "RECON_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit one scan, stream its events and print the result
    Scan(ScanArgs),
    /// List scan types and whether an adapter is available for them
    Types,
    /// Inspect the resolved configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Replay a mutation journal and print the jobs it describes
    Journal(JournalArgs),
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Host name, IP address or URL to scan
    #[arg(long)]
    pub target: String,

    /// Scan type key, e.g. port_scan or dns_enumeration
    #[arg(long = "type", value_name = "TYPE")]
    pub scan_type: String,

    /// Adapter option as key=value; repeatable (e.g. --option ports=22,80)
    #[arg(long = "option", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub options: Vec<(String, String)>,

    /// Emit events and the final job as JSON lines
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Cancel the scan if it has not finished after this long (e.g. 30s, 2m)
    #[arg(long)]
    pub timeout: Option<humantime::Duration>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Load the configuration and run the guard rails
    Check,
    /// Print the effective configuration as TOML
    Show,
}

#[derive(Debug, Args)]
pub struct JournalArgs {
    /// Journal file (JSON lines)
    pub path: PathBuf,

    /// Only list jobs in this status
    #[arg(long)]
    pub status: Option<JobStatus>,

    /// Only list jobs with a finding at or above this severity
    #[arg(long)]
    pub min_severity: Option<Severity>,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option key in `{raw}`"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn options_split_on_first_equals() {
        assert_eq!(
            parse_key_val("subdomains=www,mail").unwrap(),
            ("subdomains".to_string(), "www,mail".to_string())
        );
        assert_eq!(
            parse_key_val("filter=a=b").unwrap(),
            ("filter".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("ports").is_err());
        assert!(parse_key_val("=80").is_err());
    }

    #[test]
    fn scan_arguments_parse() {
        let cli = Cli::try_parse_from([
            "reconctl",
            "scan",
            "--target",
            "example.com",
            "--type",
            "dns_enumeration",
            "--option",
            "subdomains=www",
            "--timeout",
            "90s",
        ])
        .unwrap();
        let Command::Scan(args) = cli.command else {
            panic!("expected scan command");
        };
        assert_eq!(args.scan_type, "dns_enumeration");
        assert_eq!(args.options.len(), 1);
        assert_eq!(
            args.timeout.map(std::time::Duration::from),
            Some(std::time::Duration::from_secs(90))
        );
    }
}
