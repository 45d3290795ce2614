use anyhow::Result;
use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use stocksbot::application::bootstrap::PersistenceHandle;
use stocksbot::application::runner::RunnerStartOptions;
use stocksbot::application::strategies::{LiveStrategy, Signal};
use stocksbot::application::system::Application;
use stocksbot::config::Config;
use stocksbot::domain::errors::ExecutionError;
use stocksbot::domain::ports::{BrokerClient, MarketDataProvider};
use stocksbot::domain::runner::RunnerMode;
use stocksbot::domain::trading::types::{
    Account, OrderRequest, OrderResult, OrderSide, Position, Quote,
};
use stocksbot::infrastructure::mock::{PaperBroker, SyntheticMarketData};
use stocksbot::infrastructure::repositories::{
    InMemoryAuditSink, InMemoryJobHistoryRepository, InMemoryOrderRepository,
    InMemoryPositionRepository, InMemoryRunnerStateRepository, InMemoryStrategyRepository,
    InMemoryTradeRepository,
};

/// Paper broker that refuses every order for one symbol
struct HaltedSymbolBroker {
    inner: Arc<PaperBroker>,
    halted: String,
    halted_attempts: AtomicUsize,
}

#[async_trait]
impl BrokerClient for HaltedSymbolBroker {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    async fn is_market_open(&self) -> Result<bool> {
        self.inner.is_market_open().await
    }

    async fn get_account(&self) -> Result<Account> {
        self.inner.get_account().await
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        self.inner.get_positions().await
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        if request.symbol == self.halted {
            self.halted_attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("trading halted for {}", request.symbol);
        }
        self.inner.submit_order(request).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.inner.cancel_order(order_id).await
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderResult> {
        self.inner.get_order_status(order_id).await
    }
}

struct IdleStrategy {
    symbols: Vec<String>,
}

impl LiveStrategy for IdleStrategy {
    fn id(&self) -> &str {
        "idle"
    }

    fn name(&self) -> &str {
        "Idle"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn on_tick(&mut self, _quotes: &[Quote]) -> Vec<Signal> {
        vec![]
    }
}

fn position(symbol: &str, quantity: rust_decimal::Decimal) -> Position {
    Position {
        symbol: symbol.to_string(),
        quantity,
        average_price: dec!(100),
        current_price: None,
    }
}

async fn setup() -> (Application, Arc<HaltedSymbolBroker>, Arc<InMemoryAuditSink>) {
    let market_data: Arc<dyn MarketDataProvider> = Arc::new(SyntheticMarketData::new(42));
    let paper = Arc::new(PaperBroker::new(market_data.clone(), dec!(100000)));
    paper.seed_position(position("AAPL", dec!(10))).await;
    paper.seed_position(position("MSFT", dec!(5))).await;
    paper.seed_position(position("TSLA", dec!(3))).await;
    let broker = Arc::new(HaltedSymbolBroker {
        inner: paper,
        halted: "TSLA".to_string(),
        halted_attempts: AtomicUsize::new(0),
    });

    let audit = Arc::new(InMemoryAuditSink::new());
    let persistence = PersistenceHandle {
        db: None,
        runner_state_repository: Arc::new(InMemoryRunnerStateRepository::new()),
        job_history_repository: Arc::new(InMemoryJobHistoryRepository::new()),
        order_repository: Arc::new(InMemoryOrderRepository::new()),
        trade_repository: Arc::new(InMemoryTradeRepository::new()),
        position_repository: Arc::new(InMemoryPositionRepository::new()),
        strategy_repository: Arc::new(InMemoryStrategyRepository::new()),
        audit_sink: audit.clone(),
    };
    let app = Application::assemble(Config::default(), persistence, market_data, broker.clone()).unwrap();
    app.runner
        .attach_strategy(Box::new(IdleStrategy {
            symbols: vec!["AAPL".to_string()],
        }))
        .await;
    (app, broker, audit)
}

#[tokio::test(start_paused = true)]
async fn test_panic_stop_reports_partial_liquidation() {
    let (app, broker, audit) = setup().await;
    app.runner.start(RunnerStartOptions::default()).await.unwrap();
    assert_eq!(app.runner.status().mode, RunnerMode::Running);

    let report = app.safety.panic_stop().await;

    assert!(!report.success);
    assert!(report.kill_switch_active);
    assert!(report.runner_stopped);
    assert_eq!(app.runner.status().mode, RunnerMode::Stopped);
    assert_eq!(report.liquidations.len(), 3);
    assert_eq!(report.succeeded().count(), 2);

    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].symbol, "TSLA");
    assert_eq!(failed[0].attempts, 3);
    assert!(failed[0].error.as_deref().is_some_and(|e| e.contains("halted")));
    assert!(report.message.contains("TSLA"));
    assert_eq!(broker.halted_attempts.load(Ordering::SeqCst), 3);

    let remaining = broker.get_positions().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].symbol, "TSLA");

    assert_eq!(audit.count("kill_switch_activated").await, 1);
    assert_eq!(audit.count("liquidation_failed").await, 1);
    assert_eq!(audit.count("panic_stop").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_kill_switch_blocks_new_orders_until_cleared() {
    let (app, _broker, audit) = setup().await;
    app.safety.panic_stop().await;

    let err = app
        .executor
        .submit(OrderRequest::market("MSFT".to_string(), OrderSide::Buy, dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::PreflightDenied { .. }));
    assert_eq!(audit.count("order_created").await, 0);

    app.safety.set_kill_switch(false).await;
    assert!(!app.safety.is_kill_switch_active());
    let report = app
        .executor
        .submit(OrderRequest::market("MSFT".to_string(), OrderSide::Buy, dec!(1)))
        .await
        .unwrap();
    assert_eq!(report.order.symbol, "MSFT");
    assert!(report.trade.is_some());
    assert_eq!(audit.count("kill_switch_deactivated").await, 1);
}
