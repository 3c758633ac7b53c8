//! Seam between the scheduler and the actual download logic.
//!
//! The scheduler never downloads anything itself. It hands a [`JobSpec`] to an
//! [`Executor`] together with a progress sink and a cancel token, and maps the
//! outcome to a terminal job state.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::job::{Artifact, JobSpec};
use crate::progress::ProgressSink;

/// Performs one download.
///
/// Implementations should report progress through `progress`, watch `cancel`
/// and return [`crate::control::JobAborted`] (or any error) promptly once it
/// fires. Errors are mapped to `ExecutionFailed` with the error's message.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(
        &self,
        job: &JobSpec,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Artifact>;
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for std::sync::Arc<E> {
    async fn execute(
        &self,
        job: &JobSpec,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Artifact> {
        (**self).execute(job, progress, cancel).await
    }
}
