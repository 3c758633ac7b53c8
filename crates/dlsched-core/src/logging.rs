//! Tracing setup for the scheduler host and the isolated worker.
//!
//! The host logs to `$XDG_STATE_HOME/dlsched/dlsched.log`. The worker logs to
//! stderr only, since its stdout carries the result protocol.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,dlsched=debug,dlsched_core=debug";

/// Where log lines end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDestination {
    StateFile,
    Stderr,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn log_file_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dlsched")?;
    Ok(xdg_dirs.place_state_file("dlsched.log")?)
}

fn open_log_file() -> Result<(PathBuf, File)> {
    let path = log_file_path()?;
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

fn install(writer: BoxMakeWriter) {
    // A subscriber installed earlier (tests, embedding host) stays in place.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
}

/// Install the global subscriber for `wanted`, falling back to stderr when the
/// log file cannot be opened. Returns the destination actually in use.
pub fn init(wanted: LogDestination) -> LogDestination {
    if wanted == LogDestination::Stderr {
        install(BoxMakeWriter::new(io::stderr));
        return LogDestination::Stderr;
    }
    match open_log_file() {
        Ok((path, file)) => {
            install(BoxMakeWriter::new(Mutex::new(file)));
            tracing::info!(path = %path.display(), "dlsched logging initialized");
            LogDestination::StateFile
        }
        Err(e) => {
            install(BoxMakeWriter::new(io::stderr));
            tracing::warn!("log file unavailable, logging to stderr: {:#}", e);
            LogDestination::Stderr
        }
    }
}
