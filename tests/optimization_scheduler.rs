use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stocksbot::application::optimization::scheduler::{
    FORCE_CANCEL_MESSAGE, JobExecutor, ORPHAN_CANCEL_MESSAGE, OptimizationJobScheduler,
    RECOVERY_MESSAGE,
};
use stocksbot::application::optimization::search::{ParameterSearchEngine, SearchContext};
use stocksbot::config::SchedulerEnvConfig;
use stocksbot::domain::backtest::DateRange;
use stocksbot::domain::errors::{OptimizationError, SchedulerError};
use stocksbot::domain::optimization::job::{JobFilter, JobStatus, JobStatusView, OptimizationJob};
use stocksbot::domain::optimization::request::OptimizationRequest;
use stocksbot::domain::optimization::result::StrategyOptimizationResult;
use stocksbot::domain::repositories::JobHistoryRepository;
use stocksbot::infrastructure::SyntheticMarketData;
use stocksbot::infrastructure::repositories::InMemoryJobHistoryRepository;

/// Polls its token and pulses liveness until canceled
struct CooperativeExecutor {
    started: AtomicUsize,
}

#[async_trait]
impl JobExecutor for CooperativeExecutor {
    async fn execute(
        &self,
        _job: &OptimizationJob,
        ctx: SearchContext,
    ) -> Result<StrategyOptimizationResult, OptimizationError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        ctx.progress.report(0, 10, "parameter_search");
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(OptimizationError::Canceled);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.progress.pulse();
        }
    }
}

/// Reports once, then ignores both the token and the heartbeat
struct WedgedExecutor;

#[async_trait]
impl JobExecutor for WedgedExecutor {
    async fn execute(
        &self,
        _job: &OptimizationJob,
        ctx: SearchContext,
    ) -> Result<StrategyOptimizationResult, OptimizationError> {
        ctx.progress.report(1, 10, "parameter_search");
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(OptimizationError::Canceled)
    }
}

struct PanickingExecutor;

#[async_trait]
impl JobExecutor for PanickingExecutor {
    async fn execute(
        &self,
        _job: &OptimizationJob,
        _ctx: SearchContext,
    ) -> Result<StrategyOptimizationResult, OptimizationError> {
        panic!("simulated worker crash");
    }
}

fn request() -> OptimizationRequest {
    let range = DateRange::new(
        NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2023, 6, 30).unwrap(),
    )
    .unwrap();
    OptimizationRequest::new(vec!["AAPL".to_string()], range)
}

fn config(max_workers: usize, queue_capacity: usize) -> SchedulerEnvConfig {
    SchedulerEnvConfig {
        max_workers,
        queue_capacity,
        stall_threshold_seconds: 1,
        force_cancel_grace_seconds: 1,
        heartbeat_slice_ms: 50,
    }
}

async fn wait_for<F>(scheduler: &OptimizationJobScheduler, job_id: &str, mut done: F) -> JobStatusView
where
    F: FnMut(&JobStatusView) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let view = scheduler.get_status(job_id).await.unwrap();
        if done(&view) {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {}",
            job_id,
            view.job.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_saturated_queue_rejects_without_writing_history() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let executor = Arc::new(CooperativeExecutor {
        started: AtomicUsize::new(0),
    });
    let scheduler = OptimizationJobScheduler::new(executor.clone(), history.clone(), config(1, 1));

    let first = scheduler.submit("strat-1", request()).await.unwrap();
    let second = scheduler.submit("strat-1", request()).await.unwrap();
    wait_for(&scheduler, &first.job_id, |v| v.job.status == JobStatus::Running).await;

    let err = scheduler.submit("strat-1", request()).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::QueueSaturated {
            active: 2,
            capacity: 2
        }
    ));
    assert_eq!(history.len().await, 2);

    // The second job waits for the single worker
    let queued = scheduler.get_status(&second.job_id).await.unwrap();
    assert_eq!(queued.job.status, JobStatus::Queued);
    assert_eq!(executor.started.load(Ordering::SeqCst), 1);

    let outcomes = scheduler.cancel_all(false).await;
    assert_eq!(outcomes.len(), 2);
    assert!(scheduler.drain(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_silent_worker_is_reported_stalled() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let scheduler = OptimizationJobScheduler::new(Arc::new(WedgedExecutor), history, config(1, 0));

    let submission = scheduler.submit("strat-1", request()).await.unwrap();
    let running = wait_for(&scheduler, &submission.job_id, |v| {
        v.job.status == JobStatus::Running && v.job.completed_iterations == 1
    })
    .await;
    assert!(!running.stalled);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let view = scheduler.get_status(&submission.job_id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Running);
    assert!(view.stalled);
    assert!(view.heartbeat_age_seconds > 1.0);
    assert_eq!(scheduler.list_active().len(), 1);
    assert!(scheduler.list_active()[0].stalled);

    scheduler.cancel(&submission.job_id, true).await.unwrap();
}

#[tokio::test]
async fn test_job_waiting_in_queue_is_not_stalled() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let executor = Arc::new(CooperativeExecutor {
        started: AtomicUsize::new(0),
    });
    let scheduler = OptimizationJobScheduler::new(executor, history, config(1, 1));

    let first = scheduler.submit("strat-1", request()).await.unwrap();
    let second = scheduler.submit("strat-1", request()).await.unwrap();
    wait_for(&scheduler, &first.job_id, |v| v.job.status == JobStatus::Running).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let waiting = scheduler.get_status(&second.job_id).await.unwrap();
    assert_eq!(waiting.job.status, JobStatus::Queued);
    assert!(waiting.heartbeat_age_seconds > 1.0);
    assert!(!waiting.stalled);
    assert!(!scheduler.get_status(&first.job_id).await.unwrap().stalled);

    scheduler.cancel_all(false).await;
    assert!(scheduler.drain(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_force_cancel_terminates_unresponsive_worker() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let scheduler = OptimizationJobScheduler::new(Arc::new(WedgedExecutor), history.clone(), config(1, 0));

    let submission = scheduler.submit("strat-1", request()).await.unwrap();
    wait_for(&scheduler, &submission.job_id, |v| v.job.status == JobStatus::Running).await;

    let outcome = scheduler.cancel(&submission.job_id, true).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, JobStatus::Running);

    let requested = scheduler.get_status(&submission.job_id).await.unwrap();
    assert!(requested.job.cancel_requested);

    let view = wait_for(&scheduler, &submission.job_id, |v| v.job.is_terminal()).await;
    assert_eq!(view.job.status, JobStatus::Canceled);
    assert_eq!(view.job.message.as_deref(), Some(FORCE_CANCEL_MESSAGE));

    let stored = history.get_job(&submission.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Canceled);
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test]
async fn test_cancel_of_terminal_job_reports_existing_status() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let executor = Arc::new(CooperativeExecutor {
        started: AtomicUsize::new(0),
    });
    let scheduler = OptimizationJobScheduler::new(executor, history, config(1, 1));

    let submission = scheduler.submit("strat-1", request()).await.unwrap();
    wait_for(&scheduler, &submission.job_id, |v| v.job.status == JobStatus::Running).await;
    scheduler.cancel(&submission.job_id, false).await.unwrap();
    let view = wait_for(&scheduler, &submission.job_id, |v| v.job.is_terminal()).await;
    assert_eq!(view.job.status, JobStatus::Canceled);

    let again = scheduler.cancel(&submission.job_id, true).await.unwrap();
    assert!(again.success);
    assert_eq!(again.status, JobStatus::Canceled);
    assert_eq!(again.message, "Job already CANCELED");
}

#[tokio::test]
async fn test_cancel_from_another_process_goes_through_owner() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let executor = Arc::new(CooperativeExecutor {
        started: AtomicUsize::new(0),
    });
    let server = OptimizationJobScheduler::new(executor.clone(), history.clone(), config(1, 1));
    let admin = OptimizationJobScheduler::new(executor, history.clone(), config(1, 1));

    let submission = server.submit("strat-1", request()).await.unwrap();
    wait_for(&server, &submission.job_id, |v| v.job.status == JobStatus::Running).await;

    let outcome = admin.cancel(&submission.job_id, true).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, JobStatus::Running);
    assert!(outcome.message.starts_with("Cancel requested"));

    // The owning scheduler sees the flag and finishes the job itself
    let view = wait_for(&server, &submission.job_id, |v| v.job.is_terminal()).await;
    assert_eq!(view.job.status, JobStatus::Canceled);
    let stored = history.get_job(&submission.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Canceled);
    assert!(stored.cancel_requested);

    let again = admin.cancel(&submission.job_id, false).await.unwrap();
    assert_eq!(again.message, "Job already CANCELED");
}

#[tokio::test]
async fn test_worker_panic_marks_job_failed() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let scheduler = OptimizationJobScheduler::new(Arc::new(PanickingExecutor), history.clone(), config(1, 0));

    let submission = scheduler.submit("strat-1", request()).await.unwrap();
    let view = wait_for(&scheduler, &submission.job_id, |v| v.job.is_terminal()).await;
    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(view.job.error.as_deref(), Some("worker panicked"));

    // The worker slot is free again
    let next = scheduler.submit("strat-1", request()).await.unwrap();
    wait_for(&scheduler, &next.job_id, |v| v.job.is_terminal()).await;
}

#[tokio::test]
async fn test_recover_fails_orphaned_jobs() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let mut running = OptimizationJob::new("strat-1", request());
    running.mark_running(Utc::now()).unwrap();
    let queued = OptimizationJob::new("strat-2", request());
    let mut done = OptimizationJob::new("strat-3", request());
    done.cancel(Utc::now(), "Canceled by request").unwrap();
    let mut flagged = OptimizationJob::new("strat-4", request());
    flagged.mark_running(Utc::now()).unwrap();
    for job in [&running, &queued, &done, &flagged] {
        history.append_job_history(job).await.unwrap();
    }
    assert!(history.request_cancel(&flagged.job_id).await.unwrap());

    let scheduler = OptimizationJobScheduler::new(Arc::new(PanickingExecutor), history.clone(), config(1, 0));
    assert_eq!(scheduler.recover().await.unwrap(), 3);

    let canceled = scheduler.get_status(&flagged.job_id).await.unwrap();
    assert_eq!(canceled.job.status, JobStatus::Canceled);
    assert_eq!(canceled.job.message.as_deref(), Some(ORPHAN_CANCEL_MESSAGE));

    for id in [&running.job_id, &queued.job_id] {
        let view = scheduler.get_status(id).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Failed);
        assert_eq!(view.job.error.as_deref(), Some(RECOVERY_MESSAGE));
        assert!(!view.stalled);
    }
    let untouched = scheduler.get_status(&done.job_id).await.unwrap();
    assert_eq!(untouched.job.status, JobStatus::Canceled);

    // Second pass finds nothing left to reconcile
    assert_eq!(scheduler.recover().await.unwrap(), 0);

    let purged = scheduler
        .purge(&JobFilter::with_statuses(&[JobStatus::Failed]))
        .await
        .unwrap();
    assert_eq!(purged, 2);
    assert_eq!(history.len().await, 2);
}

#[tokio::test]
async fn test_search_job_completes_with_result() {
    let history = Arc::new(InMemoryJobHistoryRepository::new());
    let engine = ParameterSearchEngine::new(Arc::new(SyntheticMarketData::new(7)));
    let scheduler = OptimizationJobScheduler::new(Arc::new(engine), history.clone(), config(2, 1));

    let mut request = request();
    request.symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
    request.iterations = 4;
    request.random_seed = Some(11);

    let submission = scheduler.submit("strat-1", request).await.unwrap();
    assert_eq!(submission.status, JobStatus::Queued);

    let view = wait_for(&scheduler, &submission.job_id, |v| v.job.is_terminal()).await;
    assert_eq!(view.job.status, JobStatus::Completed, "error: {:?}", view.job.error);
    assert_eq!(view.job.progress_pct, 100.0);

    let result = view.job.result.expect("completed job carries a result");
    assert_eq!(result.strategy_id, "strat-1");
    assert_eq!(result.requested_iterations, 4);
    assert!(!result.top_candidates.is_empty());
    assert_eq!(result.top_candidates[0].rank, 1);

    let stored = history.get_job(&submission.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
}
