pub mod config;
pub mod logging;

pub mod autoscale;
pub mod clock;
pub mod control;
pub mod error;
pub mod executor;
pub mod isolate;
pub mod job;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{CancelError, JobError, RetryHint, SubmitError};
pub use executor::Executor;
pub use job::{Artifact, JobId, JobResult, JobSpec, JobState, JobStatus, Priority, UserId};
pub use progress::{ProgressEvent, ProgressSink, ProgressSnapshot, ProgressSubscription};
pub use scheduler::{CancelOutcome, PoolSnapshot, Scheduler, SchedulerBuilder, Ticket};
