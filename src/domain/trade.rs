use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Trade side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

/// A proposed trade, produced by the planner and consumed exactly once by the
/// execution pipeline. Immutable after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    /// Short unique identifier keying checkpoints and artifacts
    pub run_id: String,
    pub ticker: String,
    pub side: TradeSide,
    pub quantity: u64,
    /// Free-text rationale attached to the trade note on the platform
    #[serde(default)]
    pub rationale: String,
}

impl TradeIntent {
    pub fn new(ticker: &str, side: TradeSide, quantity: u64, rationale: &str) -> Self {
        Self {
            run_id: short_run_id(),
            ticker: ticker.trim().to_ascii_uppercase(),
            side,
            quantity,
            rationale: rationale.to_string(),
        }
    }

    /// Deterministic fingerprint of the order parameters.
    ///
    /// Two intents for the same ticker/side/quantity hash identically, which
    /// is exactly what the same-day duplicate check needs: a crash-and-restart
    /// re-plans the same order, and the fingerprint catches it.
    pub fn fingerprint(&self) -> String {
        fingerprint_parts(&self.ticker, self.side, self.quantity)
    }
}

/// Short (8 hex chars) run identifier, enough to key artifacts within a day.
fn short_run_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

pub(crate) fn fingerprint_parts(ticker: &str, side: TradeSide, quantity: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ticker.as_bytes());
    hasher.update(side.to_string().as_bytes());
    hasher.update(quantity.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// A confirmed trade, archived in the append-only trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub side: TradeSide,
    pub quantity: u64,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub rationale: String,
    /// Value of the budget counter after this trade settled
    pub trade_number: u32,
}

impl TradeLogEntry {
    pub fn fingerprint(&self) -> String {
        fingerprint_parts(&self.ticker, self.side, self.quantity)
    }
}
