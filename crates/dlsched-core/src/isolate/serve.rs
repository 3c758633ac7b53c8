//! Child side of the isolation protocol.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::{self, WorkerMessage};
use crate::executor::Executor;
use crate::progress::{ProgressObserver, ProgressSink, ProgressUpdate};

/// Minimum spacing of progress lines written to the pipe.
const PIPE_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

struct PipeObserver {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    last_sent: Mutex<Option<Instant>>,
}

impl ProgressObserver for PipeObserver {
    fn on_progress(&self, update: ProgressUpdate) {
        let now = Instant::now();
        let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*last, Some(t) if now.duration_since(t) < PIPE_PROGRESS_INTERVAL) {
            return;
        }
        *last = Some(now);
        let _ = self.tx.send(WorkerMessage::Progress {
            bytes_done: update.bytes_done,
            total_bytes: update.total_bytes,
        });
    }
}

/// Serve one request: read it from `input`, run `executor`, write progress
/// lines and exactly one terminal line to `output`.
///
/// `cancel` is wired to SIGTERM by the caller. Returns Err only when the
/// request cannot be read or the output pipe breaks; execution failures are
/// reported in-band as `failed`.
pub async fn serve_worker<E, R, W>(
    executor: &E,
    input: R,
    output: W,
    cancel: CancellationToken,
) -> Result<()>
where
    E: Executor + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut line = String::new();
    BufReader::new(input)
        .read_line(&mut line)
        .await
        .context("read worker request")?;
    let request = protocol::parse_request(&line)?;
    tracing::info!(job_id = request.job_id, url = %request.job.url, "isolated worker started");

    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(msg) = rx.recv().await {
            let line = protocol::encode_line(&msg)?;
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    let sink = ProgressSink::new(std::sync::Arc::new(PipeObserver {
        tx: tx.clone(),
        last_sent: Mutex::new(None),
    }));
    let terminal = match executor.execute(&request.job, sink, cancel).await {
        Ok(artifact) => WorkerMessage::Done { artifact },
        Err(e) => WorkerMessage::Failed {
            reason: format!("{:#}", e),
        },
    };
    tracing::info!(job_id = request.job_id, terminal = ?terminal, "isolated worker finished");
    let _ = tx.send(terminal);
    drop(tx);

    writer.await.context("join output writer")??;
    Ok(())
}
