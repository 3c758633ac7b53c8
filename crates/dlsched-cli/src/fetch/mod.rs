//! Reference executor: single-stream HTTP GET via libcurl.
//!
//! Writes the response body to a file in the output directory, reports
//! progress through the job's sink and aborts the transfer once the job's
//! cancel token fires.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dlsched_core::control::JobAborted;
use dlsched_core::{Artifact, Executor, JobSpec, ProgressSink};
use tokio_util::sync::CancellationToken;

const FALLBACK_FILE_NAME: &str = "download.bin";

/// Downloads each job's URL into `out_dir`.
#[derive(Debug, Clone)]
pub struct CurlExecutor {
    out_dir: PathBuf,
}

impl CurlExecutor {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

#[async_trait]
impl Executor for CurlExecutor {
    async fn execute(
        &self,
        job: &JobSpec,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Artifact> {
        let url = job.url.clone();
        let out_dir = self.out_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Artifact> {
            fs::create_dir_all(&out_dir)
                .with_context(|| format!("create {}", out_dir.display()))?;
            if cancel.is_cancelled() {
                return Err(JobAborted.into());
            }
            let (dest, file) = create_unique(&out_dir, &file_name_for(&url))
                .with_context(|| format!("create download file in {}", out_dir.display()))?;
            match download_to(&url, file, &dest, &progress, &cancel) {
                Ok(bytes) => Ok(Artifact {
                    location: dest.display().to_string(),
                    bytes,
                }),
                Err(e) => {
                    let _ = fs::remove_file(&dest);
                    Err(e)
                }
            }
        })
        .await
        .context("download task failed")?
    }
}

/// File name taken from the last non-empty URL path segment.
pub fn file_name_for(raw: &str) -> String {
    let Ok(parsed) = url::Url::parse(raw) else {
        return FALLBACK_FILE_NAME.to_string();
    };
    let segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or_default();
    let name: String = segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    let name = name.trim_matches('.');
    if name.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Create `dir/name`, or `dir/stem-N.ext` for the first N not taken yet.
/// The file is created exclusively, so concurrent jobs never share a path.
pub fn create_unique(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let numbered = (1u32..).map(|n| match ext {
        Some(ext) => dir.join(format!("{}-{}.{}", stem, n, ext)),
        None => dir.join(format!("{}-{}", stem, n)),
    });
    for path in std::iter::once(dir.join(name)).chain(numbered) {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {}", name),
    ))
}

/// Blocking GET of `url` into `file` (created at `dest`). Returns the number of bytes written.
fn download_to(
    url: &str,
    mut file: File,
    dest: &Path,
    progress: &ProgressSink,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut written: u64 = 0;
    let mut write_error: Option<std::io::Error> = None;

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.fail_on_error(true)?;
    easy.connect_timeout(Duration::from_secs(30))?;
    easy.low_speed_limit(1024)?;
    easy.low_speed_time(Duration::from_secs(60))?;
    easy.progress(true)?;

    let performed = {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| match file.write_all(data) {
            Ok(()) => {
                written += data.len() as u64;
                Ok(data.len())
            }
            Err(e) => {
                tracing::warn!("download write failed: {}", e);
                write_error = Some(e);
                Ok(0) // abort transfer
            }
        })?;
        transfer.progress_function(|dl_total, dl_now, _, _| {
            if cancel.is_cancelled() {
                return false;
            }
            let total = (dl_total > 0.0).then_some(dl_total as u64);
            progress.report(dl_now as u64, total);
            true
        })?;
        transfer.perform()
    };

    if let Err(e) = performed {
        if e.is_aborted_by_callback() {
            return Err(JobAborted.into());
        }
        if let Some(io) = write_error {
            return Err(io).with_context(|| format!("write {}", dest.display()));
        }
        return Err(e).with_context(|| format!("GET {} failed", url));
    }

    let code = easy.response_code().context("no response code")?;
    if !(200..300).contains(&code) {
        anyhow::bail!("GET {} returned HTTP {}", url, code);
    }
    file.flush()?;
    progress.report(written, Some(written));
    Ok(written)
}
