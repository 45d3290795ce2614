pub mod audit;
pub mod mock;
pub mod observability;
pub mod persistence;
pub mod repositories;
pub mod simulation;

pub use audit::TracingAuditSink;
pub use mock::{PaperBroker, SyntheticMarketData};
