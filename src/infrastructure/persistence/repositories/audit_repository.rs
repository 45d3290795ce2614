use crate::domain::ports::AuditSink;
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

/// Append-only audit trail in `audit_logs`
pub struct SqliteAuditSink {
    database: Database,
}

impl SqliteAuditSink {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn count(&self, event_type: &str) -> Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM audit_logs WHERE event_type = ?")
                .bind(event_type)
                .fetch_one(&self.database.pool)
                .await
                .context("Failed to count audit events")?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(
        &self,
        event_type: &str,
        description: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (event_type, description, details_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(description)
        .bind(details.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.database.pool)
        .await
        .context("Failed to write audit event")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_are_appended() {
        let sink = SqliteAuditSink::new(Database::in_memory().await.unwrap());
        sink.record("kill_switch_activated", "Kill switch on", json!({"active": true}))
            .await
            .unwrap();
        sink.record("kill_switch_activated", "Kill switch on", json!({}))
            .await
            .unwrap();
        assert_eq!(sink.count("kill_switch_activated").await.unwrap(), 2);
        assert_eq!(sink.count("panic_stop").await.unwrap(), 0);
    }
}
