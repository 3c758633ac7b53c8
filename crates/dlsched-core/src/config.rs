use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Environment variables that override `config.toml`.
pub const ENV_SUBPROCESS_THRESHOLD_MB: &str = "DOWNLOAD_SUBPROCESS_THRESHOLD_MB";
pub const ENV_MIN_WORKERS: &str = "DLSCHED_MIN_WORKERS";
pub const ENV_MAX_WORKERS: &str = "DLSCHED_MAX_WORKERS";
pub const ENV_USER_MAX_RUNNING: &str = "DLSCHED_USER_MAX_RUNNING";
pub const ENV_USER_RATE_LIMIT: &str = "DLSCHED_USER_RATE_LIMIT";
pub const ENV_USER_WINDOW_SECS: &str = "DLSCHED_USER_WINDOW_SECS";
pub const ENV_PROGRESS_INTERVAL_MS: &str = "DLSCHED_PROGRESS_INTERVAL_MS";
pub const ENV_JOB_TIMEOUT_SECS: &str = "DLSCHED_JOB_TIMEOUT_SECS";

/// Configuration rejected by [`SchedulerConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("min_workers must be >= 1")]
    ZeroMinWorkers,
    #[error("max_workers ({max}) must be >= min_workers ({min})")]
    WorkerBounds { min: usize, max: usize },
    #[error("{0} must be >= 1")]
    ZeroLimit(&'static str),
}

/// Scheduler configuration loaded from `~/.config/dlsched/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Jobs whose size hint is at least this many MiB run in a child process. 0 disables isolation.
    pub subprocess_threshold_mb: u64,
    /// Lower bound of the worker pool.
    pub min_workers: usize,
    /// Upper bound of the worker pool.
    pub max_workers: usize,
    /// Maximum concurrently running jobs per user.
    pub user_max_running: usize,
    /// Maximum submissions per user within the rolling window.
    pub user_rate_limit: usize,
    /// Rolling window length in seconds.
    pub user_window_secs: f64,
    /// Jobs held in the queue before submissions are refused.
    pub max_queue_size: usize,
    /// Consecutive dequeues one user may get in a class while others wait.
    pub fairness_burst: usize,
    /// Minimum interval between progress updates per job.
    pub progress_interval_ms: u64,
    /// Wall-clock limit per job.
    pub job_timeout_secs: u64,
    /// Hard limit for an isolated child process.
    pub isolation_timeout_secs: u64,
    /// How long a cancelled running job gets to stop before it is abandoned or killed.
    pub cancel_grace_ms: u64,
    /// Samples kept per platform for percentiles.
    pub metric_window: usize,
    /// Autoscaler control loop period.
    pub autoscale_tick_ms: u64,
    /// Queue wait above which the pool grows.
    pub scale_up_wait_ms: u64,
    /// Eligible backlog per active worker above which the pool grows.
    pub backlog_per_worker: usize,
    /// Idle time after which a worker may be retired.
    pub idle_cooldown_secs: u64,
    /// Smoothing factor for the queue-wait EWMA, in (0, 1].
    pub ewma_alpha: f64,
    /// Inactivity after which an idle user's quota entry is dropped.
    pub quota_idle_eviction_secs: u64,
    /// How long finished jobs stay queryable.
    pub finished_job_retention_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            subprocess_threshold_mb: 0,
            min_workers: 4,
            max_workers: 10,
            user_max_running: 4,
            user_rate_limit: 5,
            user_window_secs: 10.0,
            max_queue_size: 300,
            fairness_burst: 3,
            progress_interval_ms: 800,
            job_timeout_secs: 600,
            isolation_timeout_secs: 1800,
            cancel_grace_ms: 5000,
            metric_window: 300,
            autoscale_tick_ms: 1000,
            scale_up_wait_ms: 2000,
            backlog_per_worker: 2,
            idle_cooldown_secs: 40,
            ewma_alpha: 0.3,
            quota_idle_eviction_secs: 600,
            finished_job_retention_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::ZeroMinWorkers);
        }
        if self.max_workers < self.min_workers {
            return Err(ConfigError::WorkerBounds {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        if self.user_max_running == 0 {
            return Err(ConfigError::ZeroLimit("user_max_running"));
        }
        if self.user_rate_limit == 0 {
            return Err(ConfigError::ZeroLimit("user_rate_limit"));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroLimit("max_queue_size"));
        }
        if self.fairness_burst == 0 {
            return Err(ConfigError::ZeroLimit("fairness_burst"));
        }
        Ok(())
    }

    /// Isolation threshold in bytes; `None` when isolation is disabled.
    pub fn subprocess_threshold_bytes(&self) -> Option<u64> {
        match self.subprocess_threshold_mb {
            0 => None,
            mb => Some(mb.saturating_mul(MIB)),
        }
    }

    pub fn user_window(&self) -> Duration {
        Duration::from_secs_f64(self.user_window_secs.max(0.0))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn isolation_timeout(&self) -> Duration {
        Duration::from_secs(self.isolation_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn autoscale_tick(&self) -> Duration {
        Duration::from_millis(self.autoscale_tick_ms.max(1))
    }

    pub fn scale_up_wait(&self) -> Duration {
        Duration::from_millis(self.scale_up_wait_ms)
    }

    pub fn idle_cooldown(&self) -> Duration {
        Duration::from_secs(self.idle_cooldown_secs)
    }

    pub fn quota_idle_eviction(&self) -> Duration {
        Duration::from_secs(self.quota_idle_eviction_secs)
    }

    pub fn finished_job_retention(&self) -> Duration {
        Duration::from_secs(self.finished_job_retention_secs)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (used by tests).
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, ENV_SUBPROCESS_THRESHOLD_MB, &mut self.subprocess_threshold_mb);
        override_from(&lookup, ENV_MIN_WORKERS, &mut self.min_workers);
        override_from(&lookup, ENV_MAX_WORKERS, &mut self.max_workers);
        override_from(&lookup, ENV_USER_MAX_RUNNING, &mut self.user_max_running);
        override_from(&lookup, ENV_USER_RATE_LIMIT, &mut self.user_rate_limit);
        override_from(&lookup, ENV_USER_WINDOW_SECS, &mut self.user_window_secs);
        override_from(&lookup, ENV_PROGRESS_INTERVAL_MS, &mut self.progress_interval_ms);
        override_from(&lookup, ENV_JOB_TIMEOUT_SECS, &mut self.job_timeout_secs);
    }
}

fn override_from<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    match raw.parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = raw, "ignoring unparseable config override"),
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dlsched")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists,
/// then apply environment overrides and validate.
pub fn load_or_init() -> Result<SchedulerConfig> {
    let mut cfg = load_or_init_at(&config_path()?)?;
    cfg.apply_env();
    cfg.validate()?;
    Ok(cfg)
}

/// Read `path`, or write the defaults there when it does not exist yet.
pub fn load_or_init_at(path: &Path) -> Result<SchedulerConfig> {
    if !path.exists() {
        let default_cfg = SchedulerConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    let data = fs::read_to_string(path)?;
    Ok(toml::from_str(&data)?)
}
