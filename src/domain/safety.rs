use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Why preflight refused an order. The label feeds metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    KillSwitch,
    TradingDisabled,
    MarketClosed,
    NotTradable,
    BrokerUnavailable,
}

impl DenialReason {
    pub fn label(&self) -> &'static str {
        match self {
            DenialReason::KillSwitch => "kill_switch",
            DenialReason::TradingDisabled => "trading_disabled",
            DenialReason::MarketClosed => "market_closed",
            DenialReason::NotTradable => "not_tradable",
            DenialReason::BrokerUnavailable => "broker_unavailable",
        }
    }
}

/// Result of a pre-submission safety check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightDecision {
    pub allowed: bool,
    pub reason: String,
    pub denial: Option<DenialReason>,
}

impl PreflightDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "ok".to_string(),
            denial: None,
        }
    }

    pub fn deny(denial: DenialReason, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            denial: Some(denial),
        }
    }
}

/// Outcome of closing one position during a panic stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationOutcome {
    pub symbol: String,
    pub quantity: Decimal,
    pub success: bool,
    pub attempts: u32,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

/// Per-position report of a panic stop.
///
/// `success` is true only when every liquidation went through; the
/// individual outcomes always say which positions did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanicStopReport {
    pub success: bool,
    pub message: String,
    pub kill_switch_active: bool,
    pub runner_stopped: bool,
    pub liquidations: Vec<LiquidationOutcome>,
}

impl PanicStopReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &LiquidationOutcome> {
        self.liquidations.iter().filter(|l| l.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &LiquidationOutcome> {
        self.liquidations.iter().filter(|l| !l.success)
    }
}
