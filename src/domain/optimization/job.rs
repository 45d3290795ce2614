use crate::domain::errors::JobTransitionError;
use crate::domain::optimization::request::OptimizationRequest;
use crate::domain::optimization::result::StrategyOptimizationResult;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn terminal() -> [JobStatus; 3] {
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled]
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELED" | "CANCELLED" => Ok(JobStatus::Canceled),
            other => anyhow::bail!("Unknown job status: {}", other),
        }
    }
}

/// One parameter-search job and its lifecycle.
///
/// Transitions go QUEUED -> RUNNING -> {COMPLETED, FAILED, CANCELED}, or
/// QUEUED -> CANCELED/FAILED directly. Once terminal, every mutator returns
/// `AlreadyTerminal` and leaves the job untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationJob {
    pub job_id: String,
    pub strategy_id: String,
    pub status: JobStatus,
    pub progress_pct: f64,
    pub completed_iterations: usize,
    pub total_iterations: usize,
    pub stage: String,
    pub cancel_requested: bool,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub request: OptimizationRequest,
    pub result: Option<Box<StrategyOptimizationResult>>,
}

impl OptimizationJob {
    pub fn new(strategy_id: impl Into<String>, request: OptimizationRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            strategy_id: strategy_id.into(),
            status: JobStatus::Queued,
            progress_pct: 0.0,
            completed_iterations: 0,
            total_iterations: request.iterations,
            stage: "queued".to_string(),
            cancel_requested: false,
            last_heartbeat_at: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            message: None,
            error: None,
            request,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_open(&self) -> Result<(), JobTransitionError> {
        if self.is_terminal() {
            return Err(JobTransitionError::AlreadyTerminal {
                job_id: self.job_id.clone(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        self.ensure_open()?;
        if self.status != JobStatus::Queued {
            return Err(JobTransitionError::IllegalTransition {
                job_id: self.job_id.clone(),
                from: self.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.last_heartbeat_at = now;
        self.stage = "initializing".to_string();
        Ok(())
    }

    /// Liveness update, optionally carrying iteration progress
    pub fn heartbeat(
        &mut self,
        now: DateTime<Utc>,
        progress: Option<(usize, usize, &str)>,
    ) -> Result<(), JobTransitionError> {
        self.ensure_open()?;
        self.last_heartbeat_at = now;
        if let Some((completed, total, stage)) = progress {
            self.total_iterations = total;
            self.completed_iterations = completed.min(total);
            self.progress_pct = if total == 0 {
                0.0
            } else {
                self.completed_iterations as f64 / total as f64 * 100.0
            };
            if self.stage != stage {
                self.stage = stage.to_string();
            }
        }
        Ok(())
    }

    pub fn request_cancel(&mut self, message: &str) -> Result<(), JobTransitionError> {
        self.ensure_open()?;
        self.cancel_requested = true;
        self.message = Some(message.to_string());
        Ok(())
    }

    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        result: StrategyOptimizationResult,
    ) -> Result<(), JobTransitionError> {
        self.ensure_open()?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.last_heartbeat_at = now;
        self.completed_iterations = self.total_iterations;
        self.progress_pct = 100.0;
        self.stage = "completed".to_string();
        self.result = Some(Box::new(result));
        Ok(())
    }

    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<(), JobTransitionError> {
        self.ensure_open()?;
        let error = error.into();
        self.status = JobStatus::Failed;
        self.completed_at = Some(now);
        self.stage = "failed".to_string();
        self.message = Some(error.clone());
        self.error = Some(error);
        Ok(())
    }

    pub fn cancel(
        &mut self,
        now: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Result<(), JobTransitionError> {
        self.ensure_open()?;
        self.status = JobStatus::Canceled;
        self.cancel_requested = true;
        self.completed_at = Some(now);
        self.stage = "canceled".to_string();
        self.message = Some(message.into());
        Ok(())
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat_at
    }

    /// A RUNNING job whose heartbeat is older than `threshold`. Queued jobs
    /// have no worker yet and never stall.
    pub fn is_stalled(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == JobStatus::Running && self.heartbeat_age(now) > threshold
    }
}

/// Snapshot returned to callers together with derived liveness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: OptimizationJob,
    pub stalled: bool,
    pub heartbeat_age_seconds: f64,
}

impl JobStatusView {
    pub fn of(job: OptimizationJob, now: DateTime<Utc>, stall_threshold: Duration) -> Self {
        let stalled = job.is_stalled(now, stall_threshold);
        let age = job.heartbeat_age(now);
        Self {
            heartbeat_age_seconds: age.num_milliseconds() as f64 / 1000.0,
            stalled,
            job,
        }
    }
}

/// Query and purge filter over job history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    pub strategy_id: Option<String>,
    /// Only jobs created before this instant
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_statuses(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &OptimizationJob) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self
                .strategy_id
                .as_ref()
                .is_none_or(|id| *id == job.strategy_id)
            && self.created_before.is_none_or(|cutoff| job.created_at < cutoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::DateRange;
    use chrono::NaiveDate;

    fn job() -> OptimizationJob {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 6, 30).unwrap(),
        )
        .unwrap();
        OptimizationJob::new("strat-1", OptimizationRequest::new(vec!["AAPL".into()], range))
    }

    #[test]
    fn test_progress_percentage() {
        let mut job = job();
        job.mark_running(Utc::now()).unwrap();
        job.heartbeat(Utc::now(), Some((5, 20, "parameter_search")))
            .unwrap();
        assert_eq!(job.progress_pct, 25.0);
        assert_eq!(job.stage, "parameter_search");
    }

    #[test]
    fn test_terminal_job_is_immutable() {
        let mut job = job();
        job.mark_running(Utc::now()).unwrap();
        job.fail(Utc::now(), "boom").unwrap();
        let frozen = job.clone();

        assert!(job.heartbeat(Utc::now(), Some((3, 10, "x"))).is_err());
        assert!(job.request_cancel("late").is_err());
        assert!(job.cancel(Utc::now(), "late").is_err());
        assert!(job.mark_running(Utc::now()).is_err());
        assert_eq!(job, frozen);
    }

    #[test]
    fn test_cannot_start_twice() {
        let mut job = job();
        job.mark_running(Utc::now()).unwrap();
        assert!(matches!(
            job.mark_running(Utc::now()),
            Err(JobTransitionError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_stalled_derived_from_heartbeat_age() {
        let mut job = job();
        let start = Utc::now() - Duration::seconds(600);
        job.mark_running(start).unwrap();
        job.request_cancel("Cancel requested").unwrap();
        let view = JobStatusView::of(job.clone(), Utc::now(), Duration::seconds(120));
        assert!(view.stalled);
        assert_eq!(view.job.status, JobStatus::Running);

        job.heartbeat(Utc::now(), None).unwrap();
        assert!(!job.is_stalled(Utc::now(), Duration::seconds(120)));
    }

    #[test]
    fn test_queued_job_never_stalls() {
        let mut job = job();
        job.created_at = Utc::now() - Duration::seconds(600);
        job.last_heartbeat_at = job.created_at;
        let view = JobStatusView::of(job, Utc::now(), Duration::seconds(120));
        assert_eq!(view.job.status, JobStatus::Queued);
        assert!(view.heartbeat_age_seconds > 120.0);
        assert!(!view.stalled);
    }

    #[test]
    fn test_filter_matches_status_strategy_and_age() {
        let mut job = job();
        job.cancel(Utc::now(), "x").unwrap();
        let mut filter = JobFilter::with_statuses(&[JobStatus::Canceled]);
        assert!(filter.matches(&job));
        filter.strategy_id = Some("other".to_string());
        assert!(!filter.matches(&job));
        filter.strategy_id = None;
        filter.created_before = Some(job.created_at - Duration::days(1));
        assert!(!filter.matches(&job));
    }
}
