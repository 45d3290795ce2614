use crate::domain::ports::BrokerClient;
use crate::domain::repositories::PositionRepository;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A symbol whose stored quantity disagrees with the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDrift {
    pub symbol: String,
    pub stored_quantity: Decimal,
    pub broker_quantity: Decimal,
}

/// Compare stored positions with the broker, then make storage match the
/// broker. Returns the drift found before the repair.
pub async fn reconcile_positions(
    broker: &dyn BrokerClient,
    positions: &dyn PositionRepository,
) -> Result<Vec<PositionDrift>> {
    let live = broker
        .get_positions()
        .await
        .context("Failed to fetch broker positions")?;
    let stored = positions
        .list_positions()
        .await
        .context("Failed to load stored positions")?;

    let mut quantities: BTreeMap<String, (Decimal, Decimal)> = BTreeMap::new();
    for p in &stored {
        quantities.entry(p.symbol.clone()).or_default().0 = p.quantity;
    }
    for p in &live {
        quantities.entry(p.symbol.clone()).or_default().1 = p.quantity;
    }

    let drift: Vec<PositionDrift> = quantities
        .into_iter()
        .filter(|(_, (stored, broker))| stored != broker)
        .map(|(symbol, (stored_quantity, broker_quantity))| PositionDrift {
            symbol,
            stored_quantity,
            broker_quantity,
        })
        .collect();

    for d in &drift {
        if d.broker_quantity.is_zero() {
            positions.delete_position(&d.symbol).await?;
        }
    }
    for p in &live {
        positions.upsert_position(p).await?;
    }
    Ok(drift)
}
