use crate::domain::optimization::job::{JobFilter, JobStatus, OptimizationJob};
use crate::domain::repositories::JobHistoryRepository;
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite};

/// Job rows keep the filterable columns next to the full JSON snapshot
pub struct SqliteJobHistoryRepository {
    database: Database,
}

impl SqliteJobHistoryRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter, statuses: &[JobStatus]) {
    builder.push(" WHERE 1 = 1");
    if !statuses.is_empty() {
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.to_string());
        }
        separated.push_unseparated(")");
    }
    if let Some(strategy_id) = &filter.strategy_id {
        builder.push(" AND strategy_id = ").push_bind(strategy_id.clone());
    }
    if let Some(cutoff) = filter.created_before {
        builder
            .push(" AND created_at < ")
            .push_bind(cutoff.timestamp_millis());
    }
}

/// The flag column is authoritative; another process may have set it
fn decode_row((json, cancel_requested): (String, bool)) -> Result<OptimizationJob> {
    let mut job: OptimizationJob = serde_json::from_str(&json)?;
    job.cancel_requested |= cancel_requested;
    Ok(job)
}

#[async_trait]
impl JobHistoryRepository for SqliteJobHistoryRepository {
    async fn append_job_history(&self, job: &OptimizationJob) -> Result<()> {
        let json = serde_json::to_string(job).context("Failed to serialize optimization job")?;
        sqlx::query(
            r#"
            INSERT INTO optimization_jobs (job_id, strategy_id, status, created_at, completed_at, cancel_requested, job_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                cancel_requested = MAX(optimization_jobs.cancel_requested, excluded.cancel_requested),
                job_json = excluded.job_json
            WHERE optimization_jobs.status NOT IN ('COMPLETED', 'FAILED', 'CANCELED')
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.strategy_id)
        .bind(job.status.to_string())
        .bind(job.created_at.timestamp_millis())
        .bind(job.completed_at.map(|t| t.timestamp_millis()))
        .bind(job.cancel_requested)
        .bind(json)
        .execute(&self.database.pool)
        .await
        .context("Failed to save optimization job")?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<OptimizationJob>> {
        let row = sqlx::query_as::<_, (String, bool)>(
            "SELECT job_json, cancel_requested FROM optimization_jobs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to load optimization job")?;

        row.map(decode_row)
            .transpose()
            .with_context(|| format!("Optimization job {} could not be decoded", job_id))
    }

    async fn request_cancel(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE optimization_jobs SET cancel_requested = 1
            WHERE job_id = ? AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELED')
            "#,
        )
        .bind(job_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to flag optimization job for cancellation")?;

        Ok(result.rows_affected() > 0)
    }

    async fn query_job_history(&self, filter: &JobFilter) -> Result<Vec<OptimizationJob>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT job_json, cancel_requested FROM optimization_jobs");
        push_filter(&mut builder, filter, &filter.statuses);
        builder.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<(String, bool)> = builder
            .build_query_as::<(String, bool)>()
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to query optimization jobs")?;

        rows.into_iter()
            .map(|row| decode_row(row).context("Optimization job could not be decoded"))
            .collect()
    }

    async fn purge_terminal(&self, filter: &JobFilter) -> Result<u64> {
        let statuses: Vec<JobStatus> = JobStatus::terminal()
            .into_iter()
            .filter(|s| filter.statuses.is_empty() || filter.statuses.contains(s))
            .collect();
        if statuses.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM optimization_jobs");
        push_filter(&mut builder, filter, &statuses);
        let result = builder
            .build()
            .execute(&self.database.pool)
            .await
            .context("Failed to purge optimization jobs")?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::DateRange;
    use crate::domain::optimization::request::OptimizationRequest;
    use chrono::{Duration, NaiveDate, Utc};

    fn job(strategy: &str) -> OptimizationJob {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 6, 30).unwrap(),
        )
        .unwrap();
        OptimizationJob::new(strategy, OptimizationRequest::new(vec!["AAPL".into()], range))
    }

    async fn repo() -> SqliteJobHistoryRepository {
        SqliteJobHistoryRepository::new(Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_upsert_tracks_latest_status() {
        let repo = repo().await;
        let mut j = job("s1");
        repo.append_job_history(&j).await.unwrap();
        j.mark_running(Utc::now()).unwrap();
        j.fail(Utc::now(), "boom").unwrap();
        repo.append_job_history(&j).await.unwrap();

        let loaded = repo.get_job(&j.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));

        let failed = repo
            .query_job_history(&JobFilter::with_statuses(&[JobStatus::Failed]))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_row_is_not_overwritten() {
        let repo = repo().await;
        let mut worker_copy = job("s1");
        worker_copy.mark_running(Utc::now()).unwrap();
        repo.append_job_history(&worker_copy).await.unwrap();

        let mut admin_copy = worker_copy.clone();
        admin_copy.cancel(Utc::now(), "Canceled by operator").unwrap();
        repo.append_job_history(&admin_copy).await.unwrap();

        worker_copy.fail(Utc::now(), "late failure").unwrap();
        repo.append_job_history(&worker_copy).await.unwrap();

        let loaded = repo.get_job(&worker_copy.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Canceled);
        assert!(loaded.error.is_none());
        let failed = repo
            .query_job_history(&JobFilter::with_statuses(&[JobStatus::Failed]))
            .await
            .unwrap();
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_flag_survives_later_snapshots() {
        let repo = repo().await;
        let mut j = job("s1");
        repo.append_job_history(&j).await.unwrap();
        assert!(repo.request_cancel(&j.job_id).await.unwrap());

        j.mark_running(Utc::now()).unwrap();
        assert!(!j.cancel_requested);
        repo.append_job_history(&j).await.unwrap();
        assert!(repo.get_job(&j.job_id).await.unwrap().unwrap().cancel_requested);

        j.cancel(Utc::now(), "Canceled by request").unwrap();
        repo.append_job_history(&j).await.unwrap();
        assert!(!repo.request_cancel(&j.job_id).await.unwrap());
        assert!(!repo.request_cancel("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_respects_filter_and_active_rows() {
        let repo = repo().await;
        let queued = job("s1");
        let mut old_done = job("s1");
        old_done.created_at = Utc::now() - Duration::days(40);
        old_done.cancel(Utc::now(), "x").unwrap();
        let mut other = job("s2");
        other.cancel(Utc::now(), "x").unwrap();
        for j in [&queued, &old_done, &other] {
            repo.append_job_history(j).await.unwrap();
        }

        let filter = JobFilter {
            strategy_id: Some("s1".to_string()),
            created_before: Some(Utc::now() - Duration::days(30)),
            ..JobFilter::default()
        };
        assert_eq!(repo.purge_terminal(&filter).await.unwrap(), 1);

        // Asking for QUEUED rows never deletes them
        let queued_only = JobFilter::with_statuses(&[JobStatus::Queued]);
        assert_eq!(repo.purge_terminal(&queued_only).await.unwrap(), 0);
        assert!(repo.get_job(&queued.job_id).await.unwrap().is_some());
        assert!(repo.get_job(&other.job_id).await.unwrap().is_some());
    }
}
