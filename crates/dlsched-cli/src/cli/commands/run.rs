//! `dlsched run` – submit URLs, show progress, print perf and session summaries.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dlsched_core::metrics::{PerfSnapshot, PlatformPerf, SessionSnapshot};
use dlsched_core::rate_limit::Admission;
use dlsched_core::{
    JobId, JobSpec, Priority, ProgressEvent, ProgressSnapshot, ProgressSubscription, RetryHint,
    Scheduler, SchedulerConfig,
};

use crate::fetch::CurlExecutor;

const MIB: f64 = 1_048_576.0;

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub user: i64,
    pub admin: bool,
    pub size_mb: Option<u64>,
    pub platform: Option<String>,
    pub out_dir: PathBuf,
    pub urls: Vec<String>,
}

impl RunArgs {
    fn job_spec(&self, url: &str) -> JobSpec {
        let mut spec = JobSpec::new(self.user, url);
        if self.admin {
            spec = spec.with_priority(Priority::Admin);
        }
        if let Some(mb) = self.size_mb {
            spec = spec.with_size_hint(mb.saturating_mul(1024 * 1024));
        }
        if let Some(platform) = &self.platform {
            spec = spec.with_platform(platform.clone());
        }
        spec
    }
}

pub async fn run_downloads(cfg: SchedulerConfig, args: RunArgs) -> Result<()> {
    let exe = std::env::current_exe().context("locate dlsched executable")?;
    let worker_args = vec![
        "worker".to_string(),
        "--out".to_string(),
        args.out_dir.display().to_string(),
    ];
    let grace = cfg.cancel_grace();
    let sched = Scheduler::builder(cfg, Arc::new(CurlExecutor::new(&args.out_dir)))
        .isolated_worker(exe, worker_args)
        .start()?;

    let mut accepted: Vec<(JobId, String)> = Vec::new();
    for url in &args.urls {
        match sched.submit(args.job_spec(url)) {
            Ok(ticket) => {
                let note = match ticket.admission {
                    Admission::Accepted => String::new(),
                    Admission::QueuedWithDelay { running } => {
                        format!(", waits for {} running job(s) of this user", running)
                    }
                };
                println!(
                    "job {} queued at position {} of {} ({} workers){}  {}",
                    ticket.job_id, ticket.position, ticket.queue_len, ticket.active_workers, note, url
                );
                accepted.push((ticket.job_id, url.clone()));
            }
            Err(e) => println!("rejected {}: {} ({})", url, e, retry_advice(e.retry_hint())),
        }
    }

    let printers: Vec<_> = accepted
        .iter()
        .filter_map(|(id, _)| sched.subscribe_progress(*id).map(|sub| (*id, sub)))
        .map(|(id, sub)| tokio::spawn(print_progress(id, sub)))
        .collect();

    let interrupt = {
        let sched = sched.clone();
        let ids: Vec<JobId> = accepted.iter().map(|(id, _)| *id).collect();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupted, cancelling {} job(s)", ids.len());
                for id in ids {
                    let _ = sched.cancel(id);
                }
            }
        })
    };

    let mut failed = 0usize;
    for (id, url) in &accepted {
        match sched.outcome(*id).await {
            Some(Ok(artifact)) => println!(
                "job {} done: {} ({:.1} MiB)",
                id,
                artifact.location,
                artifact.bytes as f64 / MIB
            ),
            Some(Err(e)) => {
                failed += 1;
                println!(
                    "job {} {} [{}]: {} ({})  {}",
                    id,
                    e.terminal_state().as_str(),
                    e.as_code(),
                    e,
                    retry_advice(e.retry_hint()),
                    url
                );
            }
            None => {
                failed += 1;
                println!("job {} vanished before finishing  {}", id, url);
            }
        }
    }
    interrupt.abort();
    for printer in printers {
        let _ = printer.await;
    }

    print!("{}", format_perf(&sched.perf_snapshot()));
    print!("{}", format_session(&sched.session_snapshot()));
    sched.shutdown(grace).await;

    let rejected = args.urls.len() - accepted.len();
    if failed + rejected > 0 {
        anyhow::bail!(
            "{} of {} download(s) did not succeed",
            failed + rejected,
            args.urls.len()
        );
    }
    Ok(())
}

async fn print_progress(job_id: JobId, mut sub: ProgressSubscription) {
    while let Some(event) = sub.next().await {
        match event {
            ProgressEvent::Started { isolated: true } => {
                println!("  job {}: running in isolated worker", job_id)
            }
            ProgressEvent::Progress(snapshot) => println!("{}", format_progress(&snapshot)),
            _ => {}
        }
    }
}

fn retry_advice(hint: RetryHint) -> &'static str {
    match hint {
        RetryHint::Now => "retry now",
        RetryHint::Later => "retry later",
        RetryHint::Never => "do not retry",
    }
}

fn fmt_duration(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}

/// One progress line: bytes, percent, rate and ETA.
pub fn format_progress(s: &ProgressSnapshot) -> String {
    let done_mib = s.bytes_done as f64 / MIB;
    let total = s
        .total_bytes
        .map(|t| format!("{:.1}", t as f64 / MIB))
        .unwrap_or_else(|| "?".to_string());
    let pct = s
        .percent()
        .map(|p| format!("{:.1}%", p))
        .unwrap_or_else(|| "?%".to_string());
    let eta = s
        .eta_secs
        .map(|e| format!("{:.0}s", e))
        .unwrap_or_else(|| "?".to_string());
    format!(
        "  job {}: {:.1} / {} MiB ({})  {:.2} MiB/s  ETA {}",
        s.job_id,
        done_mib,
        total,
        pct,
        s.bytes_per_sec / MIB,
        eta
    )
}

fn perf_line(out: &mut String, label: &str, p: &PlatformPerf) {
    let _ = writeln!(
        out,
        "  {:<12} {:>5}  p50 {:>8}  p95 {:>8}  wait p50 {:>8}  wait p95 {:>8}",
        label,
        p.count,
        fmt_duration(p.processing_p50),
        fmt_duration(p.processing_p95),
        fmt_duration(p.wait_p50),
        fmt_duration(p.wait_p95)
    );
}

/// `/perf` summary: per-platform latency percentiles.
pub fn format_perf(perf: &PerfSnapshot) -> String {
    let mut out = String::from("perf:\n");
    perf_line(&mut out, "all", &perf.overall);
    for (platform, p) in &perf.platforms {
        perf_line(&mut out, platform, p);
    }
    out
}

/// `/session` summary: totals since start (or last reset).
pub fn format_session(s: &SessionSnapshot) -> String {
    let mut out = String::from("session:\n");
    let _ = writeln!(out, "  uptime     {}", fmt_duration(s.uptime));
    let _ = writeln!(
        out,
        "  downloads  {} ({:.1} MiB)  videos {}  audio {}  other {}",
        s.total_jobs,
        s.total_bytes as f64 / MIB,
        s.videos,
        s.audio,
        s.other
    );
    let _ = writeln!(out, "  failed     {}  cancelled {}", s.failed, s.cancelled);
    for (platform, totals) in &s.by_platform {
        let _ = writeln!(
            out,
            "  {:<12} {:>5}  {:.1} MiB",
            platform,
            totals.count,
            totals.bytes as f64 / MIB
        );
    }
    out
}
