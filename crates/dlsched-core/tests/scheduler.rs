//! Integration tests: scheduler end to end with an in-process scripted executor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::scripted::{self, Scripted};
use common::{eventually, test_config, within};
use dlsched_core::clock::ManualClock;
use dlsched_core::rate_limit::Admission;
use dlsched_core::{
    CancelError, CancelOutcome, JobError, JobSpec, JobState, Priority, ProgressEvent, Scheduler,
    SchedulerConfig, SubmitError,
};

const SECS_5: Duration = Duration::from_secs(5);

fn start(cfg: SchedulerConfig, exec: &Arc<Scripted>) -> Scheduler {
    Scheduler::builder(cfg, exec.clone())
        .start()
        .expect("valid config")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_runs_and_reports_success() {
    let exec = Scripted::new();
    let sched = start(test_config(), &exec);

    let ticket = sched
        .submit(JobSpec::new(1, scripted::url("a", "ok")).with_platform("youtube"))
        .unwrap();
    assert_eq!(ticket.admission, Admission::Accepted);
    assert_eq!(ticket.position, 1);

    let result = within(SECS_5, sched.outcome(ticket.job_id)).await.unwrap();
    assert_eq!(result.unwrap().location, "/tmp/a.mp4");
    let status = sched.status(ticket.job_id).unwrap();
    assert_eq!(status.state, JobState::Succeeded);

    let session = sched.session_snapshot();
    assert_eq!(session.total_jobs, 1);
    assert_eq!(session.videos, 1);
    assert_eq!(session.by_platform["youtube"].bytes, 1000);
    assert_eq!(sched.perf_snapshot().platforms["youtube"].count, 1);

    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_user_running_cap_holds_extra_jobs_in_queue() {
    let exec = Scripted::new();
    let cfg = SchedulerConfig {
        min_workers: 4,
        user_max_running: 2,
        ..test_config()
    };
    let sched = start(cfg, &exec);

    let mut ids = Vec::new();
    for i in 0..4 {
        let t = sched
            .submit(JobSpec::new(7, scripted::url(&format!("j{}", i), "wait")))
            .unwrap();
        ids.push(t.job_id);
    }
    assert!(eventually(SECS_5, || exec.running() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exec.running(), 2, "third job must wait for a free user slot");
    assert_eq!(sched.status(ids[2]).unwrap().state, JobState::Queued);

    exec.release(4);
    for id in ids {
        assert!(within(SECS_5, sched.outcome(id)).await.unwrap().is_ok());
    }
    assert_eq!(exec.peak(), 2);
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admin_job_runs_before_earlier_normal_job() {
    let exec = Scripted::new();
    let cfg = SchedulerConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let sched = start(cfg, &exec);

    let blocker = sched.submit(JobSpec::new(1, scripted::url("blocker", "wait"))).unwrap();
    assert!(eventually(SECS_5, || exec.running() == 1).await);

    let normal = sched
        .submit(JobSpec::new(2, scripted::url("normal", "ok")).with_size_hint(1024))
        .unwrap();
    let admin = sched
        .submit(JobSpec::new(3, scripted::url("admin", "ok")).with_priority(Priority::Admin))
        .unwrap();
    assert_eq!(admin.position, 1);
    assert_eq!(sched.position(normal.job_id), Some(2));

    exec.release(1);
    for id in [blocker.job_id, normal.job_id, admin.job_id] {
        within(SECS_5, sched.outcome(id)).await.unwrap().unwrap();
    }
    assert_eq!(exec.seen(), vec!["blocker", "admin", "normal"]);
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn window_cap_rejects_sixth_and_accepts_after_roll() {
    let exec = Scripted::new();
    let clock = ManualClock::new();
    let cfg = SchedulerConfig {
        user_rate_limit: 5,
        user_window_secs: 60.0,
        ..test_config()
    };
    let sched = Scheduler::builder(cfg, exec.clone())
        .clock(Arc::new(clock.clone()))
        .start()
        .unwrap();

    for i in 0..5 {
        sched
            .submit(JobSpec::new(42, scripted::url(&format!("s{}", i), "ok")))
            .unwrap();
    }
    clock.advance(Duration::from_secs(10));
    match sched.submit(JobSpec::new(42, scripted::url("s5", "ok"))) {
        Err(SubmitError::RateLimited { retry_after }) => {
            assert_eq!(retry_after, Duration::from_secs(50));
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
    // Other users are unaffected.
    assert!(sched.submit(JobSpec::new(43, scripted::url("other", "ok"))).is_ok());

    clock.advance(Duration::from_secs(50));
    assert!(sched.submit(JobSpec::new(42, scripted::url("s6", "ok"))).is_ok());
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_full_reports_position() {
    let exec = Scripted::new();
    let cfg = SchedulerConfig {
        min_workers: 1,
        max_workers: 1,
        max_queue_size: 2,
        ..test_config()
    };
    let sched = start(cfg, &exec);
    sched.submit(JobSpec::new(1, scripted::url("busy", "wait"))).unwrap();
    assert!(eventually(SECS_5, || exec.running() == 1).await);

    sched.submit(JobSpec::new(2, scripted::url("q1", "ok"))).unwrap();
    sched.submit(JobSpec::new(3, scripted::url("q2", "ok"))).unwrap();
    assert_eq!(
        sched.submit(JobSpec::new(4, scripted::url("q3", "ok"))),
        Err(SubmitError::QueueFull { position: 3 })
    );

    exec.release(1);
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_queued_job_never_executes() {
    let exec = Scripted::new();
    let cfg = SchedulerConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let sched = start(cfg, &exec);
    sched.submit(JobSpec::new(1, scripted::url("busy", "wait"))).unwrap();
    assert!(eventually(SECS_5, || exec.running() == 1).await);

    let queued = sched.submit(JobSpec::new(2, scripted::url("victim", "ok"))).unwrap();
    assert_eq!(sched.cancel(queued.job_id), Ok(CancelOutcome::Removed));
    assert_eq!(
        within(SECS_5, sched.outcome(queued.job_id)).await,
        Some(Err(JobError::Cancelled))
    );
    assert_eq!(
        sched.cancel(queued.job_id),
        Err(CancelError::AlreadyFinished {
            id: queued.job_id,
            state: JobState::Cancelled
        })
    );
    assert_eq!(sched.cancel(9999), Err(CancelError::NotFound(9999)));

    exec.release(1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!exec.seen().contains(&"victim".to_string()));
    assert_eq!(sched.session_snapshot().cancelled, 1);
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_running_job_is_terminal_within_grace() {
    let exec = Scripted::new();
    let sched = start(test_config(), &exec);

    let coop = sched.submit(JobSpec::new(1, scripted::url("coop", "wait"))).unwrap();
    let stubborn = sched.submit(JobSpec::new(2, scripted::url("stubborn", "hang"))).unwrap();
    assert!(eventually(SECS_5, || exec.running() == 2).await);

    assert_eq!(sched.cancel(coop.job_id), Ok(CancelOutcome::Signalled));
    assert_eq!(sched.cancel(stubborn.job_id), Ok(CancelOutcome::Signalled));

    // cancel_grace is 300ms in the test config.
    let bound = Duration::from_secs(2);
    assert_eq!(within(bound, sched.outcome(coop.job_id)).await, Some(Err(JobError::Cancelled)));
    assert_eq!(
        within(bound, sched.outcome(stubborn.job_id)).await,
        Some(Err(JobError::Cancelled))
    );

    // Both user slots were released.
    let after = sched.submit(JobSpec::new(1, scripted::url("after", "ok"))).unwrap();
    assert!(within(SECS_5, sched.outcome(after.job_id)).await.unwrap().is_ok());
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signalled_cancel_wins_over_racing_success() {
    let exec = Scripted::new();
    let sched = start(test_config(), &exec);

    for round in 0..20i64 {
        let t = sched
            .submit(JobSpec::new(round, scripted::url("race", "wait")))
            .unwrap();
        assert!(
            eventually(SECS_5, || sched.status(t.job_id).map(|s| s.state) != Some(JobState::Queued))
                .await
        );
        exec.release(1);
        let cancelled = sched.cancel(t.job_id);
        let outcome = within(SECS_5, sched.outcome(t.job_id)).await.unwrap();
        match cancelled {
            Ok(CancelOutcome::Signalled) => assert_eq!(outcome, Err(JobError::Cancelled)),
            Err(CancelError::AlreadyFinished { .. }) => assert!(outcome.is_ok()),
            other => panic!("unexpected cancel result {:?}", other),
        }
    }
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_timeout_fails_with_timeout_reason() {
    let exec = Scripted::new();
    let cfg = SchedulerConfig {
        job_timeout_secs: 1,
        ..test_config()
    };
    let sched = start(cfg, &exec);
    let t = sched.submit(JobSpec::new(1, scripted::url("slow", "hang"))).unwrap();
    let result = within(SECS_5, sched.outcome(t.job_id)).await.unwrap();
    assert_eq!(result, Err(JobError::Timeout(Duration::from_secs(1))));
    assert_eq!(sched.status(t.job_id).unwrap().state, JobState::Failed);
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn executor_failures_and_panics_do_not_take_down_the_pool() {
    let exec = Scripted::new();
    let cfg = SchedulerConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let sched = start(cfg, &exec);

    let failed = sched.submit(JobSpec::new(1, scripted::url("f", "fail"))).unwrap();
    let panicked = sched.submit(JobSpec::new(1, scripted::url("p", "panic"))).unwrap();
    let fine = sched.submit(JobSpec::new(1, scripted::url("ok", "ok"))).unwrap();

    match within(SECS_5, sched.outcome(failed.job_id)).await.unwrap() {
        Err(JobError::ExecutionFailed(reason)) => assert!(reason.contains("HTTP 500")),
        other => panic!("expected ExecutionFailed, got {:?}", other),
    }
    match within(SECS_5, sched.outcome(panicked.job_id)).await.unwrap() {
        Err(JobError::ExecutionFailed(reason)) => assert!(reason.contains("panicked")),
        other => panic!("expected ExecutionFailed, got {:?}", other),
    }
    assert!(within(SECS_5, sched.outcome(fine.job_id)).await.unwrap().is_ok());
    assert_eq!(sched.session_snapshot().failed, 2);
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_is_monotonic_and_ends_with_terminal_event() {
    let exec = Scripted::new();
    let sched = start(test_config(), &exec);
    let t = sched.submit(JobSpec::new(1, scripted::url("p", "progress"))).unwrap();
    let mut sub = sched.subscribe_progress(t.job_id).expect("live job");

    let mut last_bytes = 0;
    let mut events = Vec::new();
    while let Some(ev) = within(SECS_5, sub.next()).await {
        if let ProgressEvent::Progress(snap) = &ev {
            assert!(snap.bytes_done >= last_bytes);
            last_bytes = snap.bytes_done;
            assert_eq!(snap.total_bytes, Some(1000));
        }
        events.push(ev);
    }
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Finished {
            state: JobState::Succeeded,
            ..
        })
    ));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    // Late subscribers get only the terminal event.
    let late = sched.subscribe_progress(t.job_id).unwrap();
    assert!(late.wait_terminal().await.is_some());
    assert!(sched.subscribe_progress(12345).is_none());
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_grows_under_backlog_and_shrinks_when_idle() {
    let exec = Scripted::new();
    let cfg = SchedulerConfig {
        min_workers: 1,
        max_workers: 3,
        idle_cooldown_secs: 0,
        scale_up_wait_ms: 0,
        ..test_config()
    };
    let sched = start(cfg, &exec);

    let ids: Vec<_> = (0..3)
        .map(|u| {
            sched
                .submit(JobSpec::new(u, scripted::url(&format!("u{}", u), "wait")))
                .unwrap()
                .job_id
        })
        .collect();
    assert!(eventually(SECS_5, || exec.running() == 3).await);
    let pool = sched.pool_snapshot();
    assert_eq!(pool.active_workers, 3);
    assert!(pool.active_workers <= pool.max_workers);

    exec.release(3);
    for id in ids {
        assert!(within(SECS_5, sched.outcome(id)).await.unwrap().is_ok());
    }
    assert!(eventually(SECS_5, || sched.pool_snapshot().active_workers == 1).await);
    sched.shutdown(SECS_5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_then_refuses_new_work() {
    let exec = Scripted::new();
    let sched = start(test_config(), &exec);
    let ids: Vec<_> = (0..5)
        .map(|i| {
            sched
                .submit(JobSpec::new(i, scripted::url(&format!("d{}", i), "ok")))
                .unwrap()
                .job_id
        })
        .collect();
    within(SECS_5, sched.shutdown(SECS_5)).await;
    for id in ids {
        assert_eq!(sched.status(id).unwrap().state, JobState::Succeeded);
    }
    assert_eq!(
        sched.submit(JobSpec::new(1, scripted::url("late", "ok"))),
        Err(SubmitError::ShuttingDown)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_grace_cancels_stragglers() {
    let exec = Scripted::new();
    let cfg = SchedulerConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let sched = start(cfg, &exec);
    let running = sched.submit(JobSpec::new(1, scripted::url("r", "wait"))).unwrap();
    assert!(eventually(SECS_5, || exec.running() == 1).await);
    let queued = sched.submit(JobSpec::new(2, scripted::url("q", "ok"))).unwrap();

    within(SECS_5, sched.shutdown(Duration::from_millis(100))).await;
    assert_eq!(sched.status(running.job_id).unwrap().state, JobState::Cancelled);
    assert_eq!(sched.status(queued.job_id).unwrap().state, JobState::Cancelled);
}
