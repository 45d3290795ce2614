use crate::domain::optimization::parameters::StrategyParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    pub name: String,
    /// Implementation key understood by the strategy factory
    pub kind: String,
    pub symbols: Vec<String>,
    pub parameters: StrategyParameters,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}
