//! Tests for the progress, perf and session lines printed by `run`.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::cli::commands::{format_perf, format_progress, format_session};
use dlsched_core::metrics::{PerfSnapshot, PlatformPerf, PlatformTotals, SessionSnapshot};
use dlsched_core::ProgressSnapshot;

#[test]
fn progress_line_shows_percent_rate_and_eta() {
    let line = format_progress(&ProgressSnapshot {
        job_id: 3,
        bytes_done: 5 * 1_048_576,
        total_bytes: Some(20 * 1_048_576),
        bytes_per_sec: 2.0 * 1_048_576.0,
        eta_secs: Some(7.6),
    });
    assert_eq!(line, "  job 3: 5.0 / 20.0 MiB (25.0%)  2.00 MiB/s  ETA 8s");
}

#[test]
fn progress_line_with_unknown_total() {
    let line = format_progress(&ProgressSnapshot {
        job_id: 1,
        bytes_done: 1_048_576,
        total_bytes: None,
        bytes_per_sec: 0.0,
        eta_secs: None,
    });
    assert_eq!(line, "  job 1: 1.0 / ? MiB (?%)  0.00 MiB/s  ETA ?");
}

#[test]
fn perf_lists_overall_then_platforms() {
    let p = PlatformPerf {
        count: 4,
        processing_p50: Duration::from_millis(1500),
        processing_p95: Duration::from_secs(3),
        wait_p50: Duration::from_millis(10),
        wait_p95: Duration::from_millis(250),
    };
    let mut platforms = BTreeMap::new();
    platforms.insert("youtube".to_string(), p.clone());
    let out = format_perf(&PerfSnapshot {
        overall: p,
        platforms,
    });
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "perf:");
    assert!(lines[1].trim_start().starts_with("all"));
    assert!(lines[2].trim_start().starts_with("youtube"));
    assert!(lines[1].contains("p50    1.50s"), "{}", lines[1]);
    assert!(lines[1].contains("wait p95    0.25s"), "{}", lines[1]);
}

#[test]
fn session_reports_totals_and_platforms() {
    let mut by_platform = BTreeMap::new();
    by_platform.insert(
        "tiktok".to_string(),
        PlatformTotals {
            count: 2,
            bytes: 3 * 1_048_576,
        },
    );
    let out = format_session(&SessionSnapshot {
        uptime: Duration::from_secs(90),
        total_jobs: 2,
        total_bytes: 3 * 1_048_576,
        videos: 1,
        audio: 1,
        other: 0,
        failed: 1,
        cancelled: 0,
        by_platform,
    });
    assert!(out.starts_with("session:\n"));
    assert!(out.contains("downloads  2 (3.0 MiB)  videos 1  audio 1  other 0"), "{}", out);
    assert!(out.contains("failed     1  cancelled 0"), "{}", out);
    assert!(out.contains("tiktok"), "{}", out);
}
