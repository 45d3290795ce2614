//! Optimization job scheduler.
//!
//! Jobs are admitted into an in-memory registry, persisted, and handed to a
//! tokio task that waits for a worker permit. Permits come from one
//! semaphore sized to `max_workers`; ensemble jobs take extra permits from
//! the same semaphore without waiting, so the process never runs more
//! evaluation threads than the ceiling.
//!
//! Cancellation is cooperative through a [`CancellationToken`]. A forced
//! cancel arms a watchdog that aborts the job task once the grace period
//! runs out. Another process sharing the history store cancels by setting
//! the durable `cancel_requested` flag, which a running job polls once per
//! heartbeat slice. Terminal jobs leave the registry after their final row
//! is written; lookups then fall back to history.

use crate::application::optimization::search::{
    ParameterSearchEngine, ProgressSink, SearchContext, WorkerLease,
};
use crate::config::SchedulerEnvConfig;
use crate::domain::errors::{JobTransitionError, OptimizationError, SchedulerError};
use crate::domain::optimization::job::{
    CancelOutcome, JobFilter, JobStatus, JobStatusView, JobSubmission, OptimizationJob,
};
use crate::domain::optimization::request::OptimizationRequest;
use crate::domain::optimization::result::StrategyOptimizationResult;
use crate::domain::repositories::JobHistoryRepository;
use crate::infrastructure::observability::Metrics;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const RECOVERY_MESSAGE: &str = "recovered after worker restart";
pub const FORCE_CANCEL_MESSAGE: &str = "Force canceled after grace period";
pub const ORPHAN_CANCEL_MESSAGE: &str = "Canceled; no live worker";

/// Runs the work behind one job
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &OptimizationJob,
        ctx: SearchContext,
    ) -> Result<StrategyOptimizationResult, OptimizationError>;
}

#[async_trait]
impl JobExecutor for ParameterSearchEngine {
    async fn execute(
        &self,
        job: &OptimizationJob,
        ctx: SearchContext,
    ) -> Result<StrategyOptimizationResult, OptimizationError> {
        self.optimize(&job.strategy_id, &job.request, ctx).await
    }
}

struct JobEntry {
    job: OptimizationJob,
    token: CancellationToken,
    abort: Option<AbortHandle>,
}

struct SchedulerInner {
    executor: Arc<dyn JobExecutor>,
    history: Arc<dyn JobHistoryRepository>,
    config: SchedulerEnvConfig,
    permits: Arc<Semaphore>,
    registry: RwLock<HashMap<String, JobEntry>>,
    /// Serializes history writes so a stale snapshot never lands after a newer one
    persist_lock: tokio::sync::Mutex<()>,
    metrics: Option<Metrics>,
}

#[derive(Clone)]
pub struct OptimizationJobScheduler {
    inner: Arc<SchedulerInner>,
}

impl OptimizationJobScheduler {
    pub fn new(
        executor: Arc<dyn JobExecutor>,
        history: Arc<dyn JobHistoryRepository>,
        config: SchedulerEnvConfig,
    ) -> Self {
        Self::build(executor, history, config, None)
    }

    pub fn with_metrics(
        executor: Arc<dyn JobExecutor>,
        history: Arc<dyn JobHistoryRepository>,
        config: SchedulerEnvConfig,
        metrics: Metrics,
    ) -> Self {
        Self::build(executor, history, config, Some(metrics))
    }

    fn build(
        executor: Arc<dyn JobExecutor>,
        history: Arc<dyn JobHistoryRepository>,
        config: SchedulerEnvConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        let workers = config.max_workers.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                history,
                permits: Arc::new(Semaphore::new(workers)),
                config: SchedulerEnvConfig {
                    max_workers: workers,
                    ..config
                },
                registry: RwLock::new(HashMap::new()),
                persist_lock: tokio::sync::Mutex::new(()),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerEnvConfig {
        &self.inner.config
    }

    /// Admit a job, persist it as QUEUED and hand it to the worker pool.
    ///
    /// Fails with `QueueSaturated` when running plus queued jobs already fill
    /// `max_workers + queue_capacity`; no row is written in that case.
    pub async fn submit(
        &self,
        strategy_id: &str,
        request: OptimizationRequest,
    ) -> Result<JobSubmission, SchedulerError> {
        if strategy_id.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest {
                reason: "strategy_id is required".to_string(),
            });
        }
        request
            .validate()
            .map_err(|e| SchedulerError::InvalidRequest {
                reason: e.to_string(),
            })?;

        let job = OptimizationJob::new(strategy_id.trim(), request);
        let job_id = job.job_id.clone();
        let submission = JobSubmission {
            job_id: job_id.clone(),
            status: job.status,
            created_at: job.created_at,
        };
        let token = CancellationToken::new();

        {
            let mut registry = self.inner.registry_write();
            let active = registry.values().filter(|e| !e.job.is_terminal()).count();
            let capacity = self.inner.config.max_workers + self.inner.config.queue_capacity;
            if active >= capacity {
                warn!(
                    "OptimizationScheduler: rejecting job for {} ({} active, capacity {})",
                    strategy_id, active, capacity
                );
                return Err(SchedulerError::QueueSaturated { active, capacity });
            }
            registry.insert(
                job_id.clone(),
                JobEntry {
                    job,
                    token: token.clone(),
                    abort: None,
                },
            );
        }

        if let Err(e) = self.inner.persist(&job_id).await {
            self.inner.registry_write().remove(&job_id);
            return Err(e);
        }
        self.inner.refresh_active_gauge();

        let handle = tokio::spawn(run_job(self.inner.clone(), job_id.clone(), token));
        if let Some(entry) = self.inner.registry_write().get_mut(&job_id) {
            entry.abort = Some(handle.abort_handle());
        }
        tokio::spawn(supervise(self.inner.clone(), job_id.clone(), handle));

        info!(
            "OptimizationScheduler: job {} queued for strategy {}",
            job_id, strategy_id
        );
        Ok(submission)
    }

    /// Snapshot with derived liveness. Jobs no longer in memory are read from history.
    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusView, SchedulerError> {
        let threshold = self.stall_threshold();
        if let Some(job) = self.inner.snapshot(job_id) {
            return Ok(JobStatusView::of(job, Utc::now(), threshold));
        }
        match self.inner.history.get_job(job_id).await? {
            Some(job) => Ok(JobStatusView::of(job, Utc::now(), threshold)),
            None => Err(SchedulerError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Non-terminal jobs, oldest first
    pub fn list_active(&self) -> Vec<JobStatusView> {
        let now = Utc::now();
        let threshold = self.stall_threshold();
        let mut views: Vec<JobStatusView> = self
            .inner
            .registry_read()
            .values()
            .filter(|e| !e.job.is_terminal())
            .map(|e| JobStatusView::of(e.job.clone(), now, threshold))
            .collect();
        views.sort_by(|a, b| a.job.created_at.cmp(&b.job.created_at));
        views
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .registry_read()
            .values()
            .filter(|e| !e.job.is_terminal())
            .count()
    }

    /// Request cancellation.
    ///
    /// QUEUED jobs are canceled immediately. RUNNING jobs get `cancel_requested`
    /// and stop at their next checkpoint; with `force` they are terminated once
    /// the grace period elapses. Already-terminal jobs report their status.
    pub async fn cancel(&self, job_id: &str, force: bool) -> Result<CancelOutcome, SchedulerError> {
        let now = Utc::now();
        let observed = {
            let mut registry = self.inner.registry_write();
            registry.get_mut(job_id).map(|entry| {
                let before = entry.job.status;
                let applied = match before {
                    JobStatus::Queued => entry.job.cancel(now, "Canceled before start"),
                    JobStatus::Running => entry.job.request_cancel("Cancel requested"),
                    _ => Ok(()),
                };
                if applied.is_ok() && !before.is_terminal() {
                    entry.token.cancel();
                }
                (before, entry.job.status)
            })
        };

        let Some((before, after)) = observed else {
            return self.cancel_from_history(job_id).await;
        };

        match before {
            JobStatus::Queued => {
                info!("OptimizationScheduler: job {} canceled while queued", job_id);
                self.inner.persist(job_id).await?;
                self.inner.record_terminal(after);
                Ok(CancelOutcome {
                    success: true,
                    job_id: job_id.to_string(),
                    status: after,
                    message: "Job canceled before start".to_string(),
                })
            }
            JobStatus::Running => {
                self.inner.persist(job_id).await?;
                let message = if force {
                    let grace = self.inner.config.force_cancel_grace();
                    let inner = self.inner.clone();
                    let id = job_id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        inner.force_cancel(&id).await;
                    });
                    info!(
                        "OptimizationScheduler: force cancel armed for job {} ({:?} grace)",
                        job_id, grace
                    );
                    format!(
                        "Cancel requested; worker terminated after {}s if it does not yield",
                        self.inner.config.force_cancel_grace_seconds
                    )
                } else {
                    info!("OptimizationScheduler: cancel requested for job {}", job_id);
                    "Cancel requested".to_string()
                };
                Ok(CancelOutcome {
                    success: true,
                    job_id: job_id.to_string(),
                    status: after,
                    message,
                })
            }
            terminal => Ok(already_terminal(job_id, terminal)),
        }
    }

    pub async fn cancel_all(&self, force: bool) -> Vec<CancelOutcome> {
        let ids: Vec<String> = self
            .list_active()
            .into_iter()
            .map(|view| view.job.job_id)
            .collect();
        let results = join_all(ids.iter().map(|id| self.cancel(id, force))).await;
        results
            .into_iter()
            .zip(&ids)
            .filter_map(|(result, id)| match result {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!("OptimizationScheduler: cancel of {} failed: {}", id, e);
                    None
                }
            })
            .collect()
    }

    /// Delete terminal history rows matching `filter`
    pub async fn purge(&self, filter: &JobFilter) -> Result<u64, SchedulerError> {
        let deleted = self.inner.history.purge_terminal(filter).await?;
        info!("OptimizationScheduler: purged {} job rows", deleted);
        Ok(deleted)
    }

    pub async fn history(&self, filter: &JobFilter) -> Result<Vec<OptimizationJob>, SchedulerError> {
        Ok(self.inner.history.query_job_history(filter).await?)
    }

    /// Settle every job a previous process left QUEUED or RUNNING: jobs
    /// flagged for cancellation become CANCELED, the rest FAILED.
    ///
    /// Called once at startup, before any submission.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let orphans = self
            .inner
            .history
            .query_job_history(&JobFilter::with_statuses(&[
                JobStatus::Queued,
                JobStatus::Running,
            ]))
            .await?;

        let mut recovered = 0;
        for mut job in orphans {
            if self.inner.registry_read().contains_key(&job.job_id) {
                continue;
            }
            let settled = if job.cancel_requested {
                job.cancel(Utc::now(), ORPHAN_CANCEL_MESSAGE)
            } else {
                job.fail(Utc::now(), RECOVERY_MESSAGE)
            };
            if settled.is_err() {
                continue;
            }
            self.inner.history.append_job_history(&job).await?;
            recovered += 1;
        }
        if recovered > 0 {
            warn!(
                "OptimizationScheduler: settled {} orphaned jobs",
                recovered
            );
        }
        Ok(recovered)
    }

    /// Wait until no job is queued or running, up to `timeout`
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn stall_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.inner.config.stall_threshold())
            .unwrap_or_else(|_| chrono::Duration::days(36_500))
    }

    async fn cancel_from_history(&self, job_id: &str) -> Result<CancelOutcome, SchedulerError> {
        let Some(mut job) = self.inner.history.get_job(job_id).await? else {
            return Err(SchedulerError::JobNotFound {
                job_id: job_id.to_string(),
            });
        };
        if job.is_terminal() {
            return Ok(already_terminal(job_id, job.status));
        }
        // Not ours: flag it and leave the status to whichever process owns it
        if !self.inner.history.request_cancel(job_id).await? {
            let status = self
                .inner
                .history
                .get_job(job_id)
                .await?
                .map_or(job.status, |stored| stored.status);
            return Ok(already_terminal(job_id, status));
        }
        info!(
            "OptimizationScheduler: job {} is not owned here; cancel flagged in history",
            job_id
        );
        Ok(CancelOutcome {
            success: true,
            job_id: job_id.to_string(),
            status: job.status,
            message: "Cancel requested; the owning process stops the job at its next checkpoint"
                .to_string(),
        })
    }
}

fn already_terminal(job_id: &str, status: JobStatus) -> CancelOutcome {
    CancelOutcome {
        success: true,
        job_id: job_id.to_string(),
        status,
        message: format!("Job already {}", status),
    }
}

impl SchedulerInner {
    fn registry_read(&self) -> RwLockReadGuard<'_, HashMap<String, JobEntry>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobEntry>> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, job_id: &str) -> Option<OptimizationJob> {
        self.registry_read().get(job_id).map(|e| e.job.clone())
    }

    /// Apply `transition` to the live job. Returns the new status when it applied.
    fn transition<F>(&self, job_id: &str, transition: F) -> Option<JobStatus>
    where
        F: FnOnce(&mut OptimizationJob) -> Result<(), JobTransitionError>,
    {
        let mut registry = self.registry_write();
        let entry = registry.get_mut(job_id)?;
        match transition(&mut entry.job) {
            Ok(()) => Some(entry.job.status),
            Err(e) => {
                debug!("OptimizationScheduler: {}", e);
                None
            }
        }
    }

    /// Write the latest snapshot. Terminal jobs leave the registry once written.
    async fn persist(&self, job_id: &str) -> Result<(), SchedulerError> {
        let _guard = self.persist_lock.lock().await;
        let Some(snapshot) = self.snapshot(job_id) else {
            return Ok(());
        };
        if let Err(e) = self.history.append_job_history(&snapshot).await {
            error!(
                "OptimizationScheduler: failed to persist job {}: {}",
                job_id, e
            );
            return Err(SchedulerError::Persistence(e));
        }
        if snapshot.is_terminal() {
            self.registry_write().remove(job_id);
        }
        Ok(())
    }

    async fn finish<F>(&self, job_id: &str, transition: F)
    where
        F: FnOnce(&mut OptimizationJob) -> Result<(), JobTransitionError>,
    {
        if let Some(status) = self.transition(job_id, transition) {
            if let Err(e) = self.persist(job_id).await {
                warn!("OptimizationScheduler: job {} left unpersisted: {}", job_id, e);
            }
            self.record_terminal(status);
        }
    }

    fn record_terminal(&self, status: JobStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_jobs(&status.to_string());
        }
        self.refresh_active_gauge();
    }

    fn refresh_active_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            let active = self
                .registry_read()
                .values()
                .filter(|e| !e.job.is_terminal())
                .count();
            metrics.jobs_active.set(active as f64);
        }
    }

    async fn force_cancel(&self, job_id: &str) {
        let abort = {
            let mut registry = self.registry_write();
            match registry.get_mut(job_id) {
                Some(entry) if !entry.job.is_terminal() => {
                    if entry.job.cancel(Utc::now(), FORCE_CANCEL_MESSAGE).is_err() {
                        return;
                    }
                    entry.abort.take()
                }
                _ => return,
            }
        };
        warn!(
            "OptimizationScheduler: job {} did not yield; terminating worker",
            job_id
        );
        if let Some(handle) = abort {
            handle.abort();
        }
        if let Err(e) = self.persist(job_id).await {
            warn!("OptimizationScheduler: job {} left unpersisted: {}", job_id, e);
        }
        self.record_terminal(JobStatus::Canceled);
    }

    async fn cancel_flagged_in_history(&self, job_id: &str) -> bool {
        match self.history.get_job(job_id).await {
            Ok(stored) => stored.is_some_and(|job| job.cancel_requested),
            Err(e) => {
                debug!(
                    "OptimizationScheduler: cancel flag of {} unreadable: {}",
                    job_id, e
                );
                false
            }
        }
    }

    /// Extra ensemble permits, taken without waiting. Fewer than desired is fine.
    fn borrow_ensemble_permits(&self, job: &OptimizationJob) -> (usize, Option<OwnedSemaphorePermit>) {
        if !job.request.ensemble_mode {
            return (1, None);
        }
        let ceiling = self.config.max_workers;
        let desired = job.request.max_workers.unwrap_or(ceiling).clamp(1, ceiling);
        let mut extra = desired - 1;
        while extra > 0 {
            if let Ok(permit) = self.permits.clone().try_acquire_many_owned(extra as u32) {
                return (extra + 1, Some(permit));
            }
            extra -= 1;
        }
        (1, None)
    }
}

/// Heartbeat sink handed to the executor for one job
struct JobProgress {
    inner: Arc<SchedulerInner>,
    job_id: String,
    last_beat: Mutex<Instant>,
}

impl JobProgress {
    fn beat(&self, progress: Option<(usize, usize, &str)>) {
        let now = Utc::now();
        self.inner
            .transition(&self.job_id, |job| job.heartbeat(now, progress));
        *self.last_beat.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

impl ProgressSink for JobProgress {
    fn report(&self, completed: usize, total: usize, stage: &str) {
        self.beat(Some((completed, total, stage)));
    }

    fn pulse(&self) {
        let due = self
            .last_beat
            .lock()
            .map(|last| last.elapsed() >= self.inner.config.heartbeat_slice())
            .unwrap_or(true);
        if due {
            self.beat(None);
        }
    }
}

async fn run_job(inner: Arc<SchedulerInner>, job_id: String, token: CancellationToken) {
    let permit = tokio::select! {
        _ = token.cancelled() => {
            debug!("OptimizationScheduler: job {} left the queue before start", job_id);
            return;
        }
        permit = inner.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                inner.finish(&job_id, |job| job.fail(Utc::now(), "worker pool closed")).await;
                return;
            }
        },
    };

    let Some(job) = inner.snapshot(&job_id) else {
        return;
    };
    if inner.cancel_flagged_in_history(&job_id).await {
        info!("OptimizationScheduler: job {} canceled before start", job_id);
        inner
            .finish(&job_id, |job| job.cancel(Utc::now(), "Canceled by request"))
            .await;
        return;
    }
    if inner
        .transition(&job_id, |job| job.mark_running(Utc::now()))
        .is_none()
    {
        return;
    }
    let (workers, extra) = inner.borrow_ensemble_permits(&job);
    if let Err(e) = inner.persist(&job_id).await {
        warn!("OptimizationScheduler: running state of {} not persisted: {}", job_id, e);
    }
    info!(
        "OptimizationScheduler: job {} running with {} worker(s)",
        job_id, workers
    );

    let progress = Arc::new(JobProgress {
        inner: inner.clone(),
        job_id: job_id.clone(),
        last_beat: Mutex::new(Instant::now()),
    });
    let mut permits = vec![permit];
    permits.extend(extra);
    let ctx = SearchContext::new(token.clone(), progress, workers).with_lease(WorkerLease::new(permits));
    let outcome = {
        let execute = inner.executor.execute(&job, ctx);
        tokio::pin!(execute);
        tokio::select! {
            outcome = &mut execute => outcome,
            _ = watch_history_cancel(&inner, &job_id, &token) => execute.await,
        }
    };

    let now = Utc::now();
    match outcome {
        Ok(result) => {
            info!("OptimizationScheduler: job {} completed", job_id);
            inner.finish(&job_id, |job| job.complete(now, result)).await;
        }
        Err(e) if e.is_canceled() => {
            info!("OptimizationScheduler: job {} canceled", job_id);
            inner
                .finish(&job_id, |job| job.cancel(now, "Canceled by request"))
                .await;
        }
        Err(e) => {
            error!("OptimizationScheduler: job {} failed: {}", job_id, e);
            inner.finish(&job_id, |job| job.fail(now, e.to_string())).await;
        }
    }
}

/// Poll the durable cancel flag until it is set or the token fires
async fn watch_history_cancel(inner: &SchedulerInner, job_id: &str, token: &CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_slice());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if inner.cancel_flagged_in_history(job_id).await {
            info!(
                "OptimizationScheduler: job {} flagged for cancel in history",
                job_id
            );
            inner.transition(job_id, |job| job.request_cancel("Cancel requested"));
            token.cancel();
            return;
        }
    }
}

/// Observe how the job task ended. Panics become FAILED.
async fn supervise(inner: Arc<SchedulerInner>, job_id: String, handle: JoinHandle<()>) {
    match handle.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            error!("OptimizationScheduler: job {} worker panicked", job_id);
            inner
                .finish(&job_id, |job| job.fail(Utc::now(), "worker panicked"))
                .await;
        }
        Err(_) => {
            inner
                .finish(&job_id, |job| job.cancel(Utc::now(), FORCE_CANCEL_MESSAGE))
                .await;
        }
    }
}
