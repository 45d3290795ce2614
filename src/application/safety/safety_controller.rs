use crate::application::runner::StrategyRunner;
use crate::application::safety::liquidation::LiquidationService;
use crate::config::SafetyEnvConfig;
use crate::domain::ports::{AuditSink, BrokerClient};
use crate::domain::runner::RunnerMode;
use crate::domain::safety::{DenialReason, PanicStopReport, PreflightDecision};
use crate::infrastructure::observability::Metrics;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, info, warn};

/// Process-wide order gate.
///
/// Every order path (runner signals and manual orders) asks `preflight`
/// before it reaches the broker. The kill switch blocks new orders only;
/// runner telemetry keeps ticking.
pub struct SafetyController {
    broker: Arc<dyn BrokerClient>,
    audit: Arc<dyn AuditSink>,
    config: SafetyEnvConfig,
    kill_switch: AtomicBool,
    trading_enabled: AtomicBool,
    runner: RwLock<Option<Weak<StrategyRunner>>>,
    metrics: Option<Metrics>,
}

impl SafetyController {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        audit: Arc<dyn AuditSink>,
        config: SafetyEnvConfig,
    ) -> Self {
        Self {
            broker,
            audit,
            config,
            kill_switch: AtomicBool::new(false),
            trading_enabled: AtomicBool::new(true),
            runner: RwLock::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SafetyEnvConfig {
        &self.config
    }

    /// Runner that panic-stop shuts down. Held weakly; the runner owns us.
    pub fn bind_runner(&self, runner: &Arc<StrategyRunner>) {
        *self.runner.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(runner));
    }

    fn bound_runner(&self) -> Option<Arc<StrategyRunner>> {
        self.runner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    pub async fn set_kill_switch(&self, active: bool) {
        let previous = self.kill_switch.swap(active, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics
                .kill_switch_status
                .set(if active { 1.0 } else { 0.0 });
        }
        if previous == active {
            return;
        }

        let (event, description) = if active {
            warn!("SafetyController: KILL SWITCH ACTIVATED");
            ("kill_switch_activated", "Kill switch activated")
        } else {
            info!("SafetyController: kill switch released");
            ("kill_switch_deactivated", "Kill switch deactivated")
        };
        self.record(event, description, json!({ "active": active }))
            .await;
    }

    pub fn is_trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::SeqCst)
    }

    pub async fn set_trading_enabled(&self, enabled: bool) {
        if self.trading_enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        info!("SafetyController: trading enabled = {}", enabled);
        self.record(
            "trading_enabled_changed",
            if enabled {
                "Trading enabled"
            } else {
                "Trading disabled"
            },
            json!({ "enabled": enabled }),
        )
        .await;
    }

    /// Gate one order for `symbol`.
    ///
    /// Checks run in order: kill switch, trading gate, market session,
    /// tradability. A broker failure denies (fail closed).
    pub async fn preflight(&self, symbol: &str) -> PreflightDecision {
        let decision = self.evaluate(symbol).await;
        if let Some(denial) = decision.denial {
            info!(
                "SafetyController: preflight denied {} ({})",
                symbol, decision.reason
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_preflight_denials(denial.label());
            }
        }
        decision
    }

    async fn evaluate(&self, symbol: &str) -> PreflightDecision {
        if self.is_kill_switch_active() {
            return PreflightDecision::deny(DenialReason::KillSwitch, "Kill switch is active");
        }
        if !self.is_trading_enabled() {
            return PreflightDecision::deny(DenialReason::TradingDisabled, "Trading is disabled");
        }

        match self.broker.is_market_open().await {
            Ok(true) => {}
            Ok(false) => {
                return PreflightDecision::deny(DenialReason::MarketClosed, "Market is closed");
            }
            Err(e) => {
                return PreflightDecision::deny(
                    DenialReason::BrokerUnavailable,
                    format!("Market status unavailable: {}", e),
                );
            }
        }

        match self.broker.is_symbol_tradable(symbol).await {
            Ok(true) => PreflightDecision::allow(),
            Ok(false) => PreflightDecision::deny(
                DenialReason::NotTradable,
                format!("Symbol {} is not tradable", symbol),
            ),
            Err(e) => PreflightDecision::deny(
                DenialReason::BrokerUnavailable,
                format!("Tradability check failed for {}: {}", symbol, e),
            ),
        }
    }

    /// Kill switch, then runner stop, then liquidate every open position.
    ///
    /// Liquidations are attempted independently with retry; the report lists
    /// the outcome of each one.
    pub async fn panic_stop(&self) -> PanicStopReport {
        warn!("SafetyController: PANIC STOP initiated");
        self.set_kill_switch(true).await;

        let runner_stopped = match self.bound_runner() {
            Some(runner) => {
                let result = runner.stop().await;
                result.status.mode == RunnerMode::Stopped
            }
            None => {
                info!("SafetyController: no runner bound, skipping runner stop");
                false
            }
        };

        let positions = tokio::time::timeout(self.config.broker_timeout(), self.broker.get_positions())
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!(
                    "position listing timed out after {}ms",
                    self.config.broker_timeout_ms
                ))
            });
        let positions = match positions {
            Ok(positions) => positions,
            Err(e) => {
                error!("SafetyController: cannot list positions: {}", e);
                let report = PanicStopReport {
                    success: false,
                    message: format!("Kill switch active; positions unavailable: {}", e),
                    kill_switch_active: true,
                    runner_stopped,
                    liquidations: Vec::new(),
                };
                self.record_panic_stop(&report).await;
                return report;
            }
        };

        let liquidation = LiquidationService::new(
            self.broker.clone(),
            self.config.liquidation_max_retries,
            self.config.liquidation_base_delay(),
            self.config.broker_timeout(),
        );
        let liquidations = liquidation.liquidate_all(&positions).await;

        for failed in liquidations.iter().filter(|l| !l.success) {
            self.record(
                "liquidation_failed",
                &format!("Failed to liquidate {}", failed.symbol),
                json!({
                    "symbol": failed.symbol,
                    "quantity": failed.quantity.to_string(),
                    "attempts": failed.attempts,
                    "error": failed.error,
                }),
            )
            .await;
        }

        let closed = liquidations.iter().filter(|l| l.success).count();
        let failed = liquidations.len() - closed;
        let message = if liquidations.is_empty() {
            "Kill switch active; no open positions".to_string()
        } else if failed == 0 {
            format!("Kill switch active; liquidated {} positions", closed)
        } else {
            let symbols: Vec<&str> = liquidations
                .iter()
                .filter(|l| !l.success)
                .map(|l| l.symbol.as_str())
                .collect();
            format!(
                "Kill switch active; liquidated {} of {} positions, failed: {}",
                closed,
                liquidations.len(),
                symbols.join(", ")
            )
        };

        let report = PanicStopReport {
            success: failed == 0,
            message,
            kill_switch_active: true,
            runner_stopped,
            liquidations,
        };
        self.record_panic_stop(&report).await;
        report
    }

    async fn record_panic_stop(&self, report: &PanicStopReport) {
        let details = serde_json::to_value(report).unwrap_or_else(|_| json!({}));
        self.record("panic_stop", &report.message, details).await;
    }

    async fn record(&self, event_type: &str, description: &str, details: serde_json::Value) {
        if let Err(e) = self.audit.record(event_type, description, details).await {
            warn!(
                "SafetyController: audit write for {} failed: {}",
                event_type, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::{PaperBroker, SyntheticMarketData};
    use crate::infrastructure::repositories::InMemoryAuditSink;
    use rust_decimal_macros::dec;

    fn controller() -> (SafetyController, Arc<PaperBroker>, Arc<InMemoryAuditSink>) {
        let broker = Arc::new(PaperBroker::new(
            Arc::new(SyntheticMarketData::default()),
            dec!(10000),
        ));
        let audit = Arc::new(InMemoryAuditSink::default());
        let controller =
            SafetyController::new(broker.clone(), audit.clone(), SafetyEnvConfig::default());
        (controller, broker, audit)
    }

    #[tokio::test]
    async fn test_preflight_allows_by_default() {
        let (controller, _, _) = controller();
        assert!(controller.preflight("AAPL").await.allowed);
    }

    #[tokio::test]
    async fn test_kill_switch_wins_over_everything() {
        let (controller, broker, audit) = controller();
        broker.set_market_open(false);
        controller.set_trading_enabled(false).await;
        controller.set_kill_switch(true).await;

        let decision = controller.preflight("AAPL").await;
        assert_eq!(decision.denial, Some(DenialReason::KillSwitch));
        assert_eq!(audit.count("kill_switch_activated").await, 1);

        // Setting it again is not a new activation
        controller.set_kill_switch(true).await;
        assert_eq!(audit.count("kill_switch_activated").await, 1);
    }

    #[tokio::test]
    async fn test_checks_run_in_order() {
        let (controller, broker, _) = controller();
        broker
            .set_tradable_symbols(Some(vec!["MSFT".to_string()]))
            .await;
        assert_eq!(
            controller.preflight("AAPL").await.denial,
            Some(DenialReason::NotTradable)
        );

        broker.set_market_open(false);
        assert_eq!(
            controller.preflight("AAPL").await.denial,
            Some(DenialReason::MarketClosed)
        );

        controller.set_trading_enabled(false).await;
        assert_eq!(
            controller.preflight("AAPL").await.denial,
            Some(DenialReason::TradingDisabled)
        );
    }

    #[tokio::test]
    async fn test_panic_stop_without_positions() {
        let (controller, _, audit) = controller();
        let report = controller.panic_stop().await;
        assert!(report.success);
        assert!(report.kill_switch_active);
        assert!(!report.runner_stopped);
        assert!(controller.is_kill_switch_active());
        assert_eq!(audit.count("panic_stop").await, 1);
    }
}
