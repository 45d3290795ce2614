use crate::domain::ports::AuditSink;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Logs every audit event and forwards it to an optional durable sink
pub struct TracingAuditSink {
    inner: Option<Arc<dyn AuditSink>>,
}

impl TracingAuditSink {
    pub fn new() -> Self {
        Self { inner: None }
    }

    pub fn wrapping(inner: Arc<dyn AuditSink>) -> Self {
        Self { inner: Some(inner) }
    }
}

impl Default for TracingAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(
        &self,
        event_type: &str,
        description: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        info!(
            target: "audit",
            event_type,
            details = %details,
            "AUDIT: {}",
            description
        );
        match &self.inner {
            Some(inner) => inner.record(event_type, description, details).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::InMemoryAuditSink;
    use serde_json::json;

    #[tokio::test]
    async fn test_forwards_to_inner_sink() {
        let inner = Arc::new(InMemoryAuditSink::default());
        let sink = TracingAuditSink::wrapping(inner.clone());
        sink.record("panic_stop", "Panic stop", json!({ "positions": 2 }))
            .await
            .unwrap();
        assert_eq!(inner.count("panic_stop").await, 1);
        assert!(TracingAuditSink::new()
            .record("x", "y", json!({}))
            .await
            .is_ok());
    }
}
