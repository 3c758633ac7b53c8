//! `dlsched worker` – child side of process isolation.
//!
//! Reads one request from stdin, downloads with the reference executor and
//! streams progress and the result to stdout. SIGTERM cancels the download.

use std::path::Path;

use anyhow::Result;
use dlsched_core::isolate::serve_worker;
use tokio_util::sync::CancellationToken;

use crate::fetch::CurlExecutor;

pub async fn run_worker(out_dir: &Path) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_termination_listener(cancel.clone())?;
    let executor = CurlExecutor::new(out_dir);
    serve_worker(&executor, tokio::io::stdin(), tokio::io::stdout(), cancel).await
}

#[cfg(unix)]
fn spawn_termination_listener(cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        if term.recv().await.is_some() {
            tracing::info!("SIGTERM received, cancelling download");
            cancel.cancel();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_termination_listener(cancel: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    Ok(())
}
