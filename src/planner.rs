//! Trade planning
//!
//! The core never invents trades; it executes an ordered plan produced
//! elsewhere. The default planner reads a JSON plan file so strategy stays
//! fully decoupled from execution.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;

use crate::domain::{TradeIntent, TradeSide};
use crate::error::{BotError, Result};

/// Source of the day's ordered trade intents.
#[async_trait]
pub trait TradePlanner: Send + Sync {
    async fn plan(&self) -> Result<Vec<TradeIntent>>;
}

/// One entry of a plan file.
#[derive(Debug, Deserialize)]
struct PlannedTrade {
    ticker: String,
    side: TradeSide,
    quantity: u64,
    #[serde(default)]
    rationale: String,
}

/// Reads an ordered plan from a JSON file:
/// `[{"ticker": "VOO", "side": "BUY", "quantity": 10, "rationale": "..."}]`
pub struct FilePlanner {
    path: PathBuf,
}

impl FilePlanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TradePlanner for FilePlanner {
    async fn plan(&self) -> Result<Vec<TradeIntent>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let planned: Vec<PlannedTrade> = serde_json::from_str(&content)?;

        let mut intents = Vec::with_capacity(planned.len());
        for trade in planned {
            if trade.quantity == 0 {
                return Err(BotError::Validation(format!(
                    "plan entry for {} has zero quantity",
                    trade.ticker
                )));
            }
            intents.push(TradeIntent::new(
                &trade.ticker,
                trade.side,
                trade.quantity,
                &trade.rationale,
            ));
        }
        info!(path = %self.path.display(), intents = intents.len(), "plan loaded");
        Ok(intents)
    }
}
