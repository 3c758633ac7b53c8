#![allow(dead_code)]

pub mod scripted;

use std::future::Future;
use std::time::Duration;

use dlsched_core::SchedulerConfig;

/// Small, fast configuration for scheduler tests.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        min_workers: 2,
        max_workers: 4,
        user_max_running: 4,
        user_rate_limit: 100,
        user_window_secs: 60.0,
        progress_interval_ms: 10,
        cancel_grace_ms: 300,
        autoscale_tick_ms: 50,
        job_timeout_secs: 30,
        isolation_timeout_secs: 30,
        ..SchedulerConfig::default()
    }
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `fut`, failing the test if it takes longer than `within`.
pub async fn within<T>(within: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(within, fut)
        .await
        .expect("timed out waiting")
}
