use crate::domain::repositories::RunnerStateRepository;
use crate::domain::runner::state::RunnerState;
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

const RUNNER_STATE_ID: &str = "strategy_runner";

pub struct SqliteRunnerStateRepository {
    database: Database,
}

impl SqliteRunnerStateRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl RunnerStateRepository for SqliteRunnerStateRepository {
    /// Save the runner checkpoint (upsert)
    async fn save_runner_state(&self, state: &RunnerState) -> Result<()> {
        let json = serde_json::to_string(state).context("Failed to serialize runner state")?;
        sqlx::query(
            r#"
            INSERT INTO runner_state (id, state_json, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT(id) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(RUNNER_STATE_ID)
        .bind(json)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.database.pool)
        .await
        .context("Failed to save runner state")?;

        Ok(())
    }

    async fn load_runner_state(&self) -> Result<Option<RunnerState>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT state_json FROM runner_state WHERE id = $1")
            .bind(RUNNER_STATE_ID)
            .fetch_optional(&self.database.pool)
            .await
            .context("Failed to load runner state")?;

        match row {
            Some((json,)) => {
                let state: RunnerState = serde_json::from_str(&json)
                    .context("Persisted runner state could not be decoded")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::runner::state::RunnerMode;

    #[tokio::test]
    async fn test_checkpoint_round_trip_keeps_sleep_marker() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteRunnerStateRepository::new(db);
        assert!(repo.load_runner_state().await.unwrap().is_none());

        let mut state = RunnerState::new(60.0);
        state.mode = RunnerMode::Running;
        state.enter_sleep(Utc::now(), None);
        repo.save_runner_state(&state).await.unwrap();
        repo.save_runner_state(&state).await.unwrap();

        let loaded = repo.load_runner_state().await.unwrap().unwrap();
        assert_eq!(loaded.mode, RunnerMode::Sleeping);
        assert_eq!(loaded.sleep_since, state.sleep_since);
    }

    #[tokio::test]
    async fn test_garbage_row_is_an_error() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("INSERT INTO runner_state (id, state_json, updated_at) VALUES ($1, '{not json', 0)")
            .bind(RUNNER_STATE_ID)
            .execute(&db.pool)
            .await
            .unwrap();
        let repo = SqliteRunnerStateRepository::new(db);
        assert!(repo.load_runner_state().await.is_err());
    }
}
