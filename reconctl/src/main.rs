//! `reconctl`: submit scans to an in-process ReconWhisper runtime and watch
//! them finish.

mod cli;
mod output;

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use futures::StreamExt;
use recon_config::{ConfigLoad, ConfigSources, ReconConfig};
use recon_core::adapters::AdapterRegistry;
use recon_core::clock::{Clock, SystemClock};
use recon_core::orchestration::{
    BusMessage, EventFilter, FindingAggregator, InProcEventBus, JobFilter, JsonlJournal,
    ScanControlPlane, ScanEventKind, ScanRuntime, ScanStore,
};
use recon_model::{JobStatus, ScanType};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command, ConfigCommand, JournalArgs, ScanArgs};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Scheduler decisions stay visible by default. Override via RUST_LOG.
                "info,recon::scheduler=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let sources = match cli.config {
        Some(path) => ConfigSources {
            config_path: Some(path),
            ..ConfigSources::from_env()
        },
        None => ConfigSources::from_env(),
    };

    match cli.command {
        Command::Scan(args) => run_scan(args, &sources).await,
        Command::Types => {
            list_types(&sources)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config(ConfigCommand::Check) => {
            check_config(&sources)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config(ConfigCommand::Show) => {
            let ConfigLoad { config, .. } =
                sources.load().context("failed to load configuration")?;
            print!("{}", render_config(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Journal(args) => {
            inspect_journal(args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_scan(args: ScanArgs, sources: &ConfigSources) -> anyhow::Result<ExitCode> {
    let ConfigLoad { config, .. } = sources.load().context("failed to load configuration")?;
    let registry = config.registry();
    let (runtime, report) = ScanRuntime::open(config.orchestrator, registry, Arc::new(SystemClock))
        .await
        .context("failed to open scan runtime")?;
    if !report.requeued.is_empty() {
        info!(
            requeued = report.requeued.len(),
            "resuming queued scans from journal"
        );
    }

    let runtime = Arc::new(runtime);
    runtime.start().await.context("failed to start scheduler")?;
    let control = ScanControlPlane::new(Arc::clone(&runtime));
    let mut events = control.subscribe(EventFilter::all());

    let options: BTreeMap<String, String> = args.options.into_iter().collect();
    let job_id = match control
        .submit_scan_named(&args.target, &args.scan_type, options)
        .await
    {
        Ok(job_id) => job_id,
        Err(err) => {
            runtime.shutdown().await?;
            return Err(anyhow!(err)).context("scan rejected");
        }
    };

    let deadline = async {
        match args.timeout {
            Some(limit) => tokio::time::sleep(limit.into()).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            message = events.next() => {
                let Some(message) = message else { break };
                match message {
                    BusMessage::Event(event) if event.job_id == job_id => {
                        output::print_event(&event, args.json)?;
                        if let ScanEventKind::JobStatusChanged { new, .. } = &event.kind
                            && new.is_terminal()
                        {
                            break;
                        }
                    }
                    BusMessage::Event(_) => {}
                    BusMessage::Lagging { skipped } => {
                        warn!(skipped, "event stream lagging; some updates were not shown");
                        if runtime.store().status(job_id).await?.is_terminal() {
                            break;
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                warn!(job = %job_id, "interrupted, cancelling scan");
                if let Err(err) = control.cancel_scan(job_id).await {
                    warn!(job = %job_id, error = %err, "cancel failed");
                }
            }
            _ = &mut deadline, if !cancel_sent => {
                cancel_sent = true;
                warn!(job = %job_id, "scan timeout reached, cancelling");
                if let Err(err) = control.cancel_scan(job_id).await {
                    warn!(job = %job_id, error = %err, "cancel failed");
                }
            }
        }
    }

    let job = control.get_scan(job_id).await?;
    output::print_job(&job, args.json)?;
    runtime.shutdown().await.context("scheduler shutdown failed")?;

    Ok(match job.status {
        JobStatus::Completed => ExitCode::SUCCESS,
        JobStatus::Cancelled => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    })
}

fn list_types(sources: &ConfigSources) -> anyhow::Result<()> {
    let registry = match sources.resolve() {
        Ok((config, _)) => config.registry(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "using built-in adapters");
            AdapterRegistry::with_builtin()
        }
    };
    for scan_type in ScanType::ALL {
        let availability = if registry.contains(scan_type) {
            "available"
        } else {
            "no adapter"
        };
        println!(
            "{:<20} {:<20} {availability}",
            scan_type.key(),
            scan_type.label()
        );
    }
    Ok(())
}

fn check_config(sources: &ConfigSources) -> anyhow::Result<()> {
    let ConfigLoad {
        config,
        source,
        warnings,
    } = sources.load().context("failed to load configuration")?;

    println!("configuration OK ({source})");
    println!(
        "max_concurrent = {}, max_per_target = {}, journal = {}",
        config.orchestrator.max_concurrent,
        config
            .orchestrator
            .max_per_target
            .map(|cap| cap.to_string())
            .unwrap_or_else(|| "unlimited".into()),
        config
            .orchestrator
            .journal
            .path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "none".into()),
    );
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => println!("warning: {} (hint: {hint})", warning.message),
            None => println!("warning: {}", warning.message),
        }
    }
    Ok(())
}

fn render_config(config: &ReconConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).context("failed to render configuration")
}

async fn inspect_journal(args: JournalArgs) -> anyhow::Result<()> {
    let records = JsonlJournal::load(&args.path)
        .await
        .with_context(|| format!("failed to read journal {}", args.path.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = ScanStore::new(
        Arc::new(FindingAggregator::new()),
        Arc::new(InProcEventBus::new(1)),
        None,
        clock,
    );
    let report = store
        .restore(records)
        .await
        .context("failed to replay journal")?;

    let filter = JobFilter {
        status: args.status,
        min_severity: args.min_severity,
        ..JobFilter::default()
    };
    for job in store.list(&filter).await {
        output::print_job_line(&job);
    }
    println!(
        "replayed {} records ({} skipped); {} queued, {} interrupted",
        report.records_applied,
        report.records_skipped,
        report.requeued.len(),
        report.interrupted.len()
    );
    output::print_summary(&store.summary().await);
    Ok(())
}
