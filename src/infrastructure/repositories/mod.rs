pub mod in_memory;

pub use in_memory::{
    InMemoryAuditSink, InMemoryJobHistoryRepository, InMemoryOrderRepository,
    InMemoryPositionRepository, InMemoryRunnerStateRepository, InMemoryStrategyRepository,
    InMemoryTradeRepository,
};
