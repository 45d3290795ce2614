use super::timestamp_column;
use crate::domain::repositories::StrategyRepository;
use crate::domain::strategy::StrategyRecord;
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::info;

pub struct SqliteStrategyRepository {
    database: Database,
}

impl SqliteStrategyRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    fn map_row(row: &SqliteRow) -> Result<StrategyRecord> {
        let symbols_json: String = row.try_get("symbols_json")?;
        let parameters_json: String = row.try_get("parameters_json")?;
        Ok(StrategyRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            symbols: serde_json::from_str(&symbols_json).context("Invalid strategy symbols")?,
            parameters: serde_json::from_str(&parameters_json)
                .context("Invalid strategy parameters")?,
            active: row.try_get("is_active")?,
            updated_at: timestamp_column(row.try_get("updated_at")?, "updated_at")?,
        })
    }
}

#[async_trait]
impl StrategyRepository for SqliteStrategyRepository {
    async fn save_strategy(&self, strategy: &StrategyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategies (id, name, kind, symbols_json, parameters_json, is_active, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                symbols_json = excluded.symbols_json,
                parameters_json = excluded.parameters_json,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&strategy.id)
        .bind(&strategy.name)
        .bind(&strategy.kind)
        .bind(serde_json::to_string(&strategy.symbols)?)
        .bind(serde_json::to_string(&strategy.parameters)?)
        .bind(strategy.active)
        .bind(strategy.updated_at.timestamp_millis())
        .execute(&self.database.pool)
        .await
        .context("Failed to save strategy")?;

        info!("Persistence: saved strategy {}", strategy.id);
        Ok(())
    }

    async fn get_strategy(&self, id: &str) -> Result<Option<StrategyRecord>> {
        let row = sqlx::query("SELECT * FROM strategies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.database.pool)
            .await
            .context("Failed to load strategy")?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_active_strategies(&self) -> Result<Vec<StrategyRecord>> {
        let rows = sqlx::query("SELECT * FROM strategies WHERE is_active = 1 ORDER BY id")
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to list strategies")?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn delete_strategy(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM strategies WHERE id = ?")
            .bind(id)
            .execute(&self.database.pool)
            .await
            .context("Failed to delete strategy")?;
        Ok(())
    }
}
