use recon_core::orchestration::{AggregateSummary, ScanEvent, ScanEventKind, ScanJob};
use recon_model::JobStatus;

pub fn print_event(event: &ScanEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let line = match &event.kind {
        ScanEventKind::JobCreated => format!("queued {} scan of {}", event.scan_type, event.target),
        ScanEventKind::JobStatusChanged { old, new, reason } => match reason {
            Some(reason) => format!("{old} -> {new} ({reason})"),
            None => format!("{old} -> {new}"),
        },
        ScanEventKind::ProgressUpdated { value } => format!("progress {value}%"),
        ScanEventKind::FindingAdded { finding } => {
            format!("[{}] {}", finding.severity, finding.description)
        }
        ScanEventKind::RetryScheduled {
            attempt,
            delay_ms,
            error,
        } => format!("attempt {attempt} in {delay_ms}ms after: {error}"),
        ScanEventKind::CancellationRequested => "cancellation requested".to_string(),
        ScanEventKind::JobRemoved => "removed".to_string(),
    };
    println!("{} {line}", event.at.format("%H:%M:%S%.3f"));
    Ok(())
}

pub fn print_job(job: &ScanJob, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(job)?);
        return Ok(());
    }

    println!();
    println!("job       {}", job.id);
    println!("target    {} ({})", job.target, job.scan_type);
    match &job.failure_reason {
        Some(reason) => println!("status    {} ({reason})", job.status),
        None => println!("status    {}", job.status),
    }
    println!("attempts  {}", job.attempts);
    if let (Some(started), Some(finished)) = (job.started_at, job.finished_at) {
        let elapsed = (finished - started).to_std().unwrap_or_default();
        println!("elapsed   {}", humantime::format_duration(elapsed));
    }

    let mut findings: Vec<_> = job.findings.iter().collect();
    findings.sort_by(|a, b| b.severity.cmp(&a.severity));
    println!("findings  {}", findings.len());
    for finding in findings {
        println!("  [{:>8}] {}", finding.severity.to_string(), finding.description);
    }
    Ok(())
}

/// One line per job, oldest first.
pub fn print_job_line(job: &ScanJob) {
    let severity = job
        .severity
        .map(|severity| severity.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<9}  {:<18}  {:>3}%  {:>8}  {}",
        job.id,
        job.status.as_str(),
        job.scan_type.key(),
        job.progress,
        severity,
        job.target
    );
}

pub fn print_summary(summary: &AggregateSummary) {
    let jobs = &summary.jobs_by_status;
    let findings = &summary.findings_by_severity;
    println!(
        "jobs: {} total, {} queued, {} running, {} completed, {} failed, {} cancelled",
        summary.total_jobs(),
        jobs.get(JobStatus::Queued),
        jobs.get(JobStatus::Running),
        jobs.get(JobStatus::Completed),
        jobs.get(JobStatus::Failed),
        jobs.get(JobStatus::Cancelled),
    );
    println!(
        "findings: {} critical, {} high, {} medium, {} low across {} targets",
        findings.critical, findings.high, findings.medium, findings.low, summary.distinct_targets
    );
}
