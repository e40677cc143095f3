use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a lot came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotSource {
    /// Created by an actual verified buy fill
    Real,
    /// Created during migration of a position that pre-dates lot tracking
    Synthetic,
}

impl Default for LotSource {
    fn default() -> Self {
        Self::Real
    }
}

/// A quantity of one instrument acquired at one identifiable time, tracked
/// independently for holding-period purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub lot_id: String,
    pub ticker: String,
    pub quantity: u64,
    pub buy_timestamp_utc: DateTime<Utc>,
    #[serde(default)]
    pub source: LotSource,
    #[serde(default)]
    pub buy_price: Option<Decimal>,
}

impl Lot {
    pub fn real(ticker: &str, quantity: u64, at: DateTime<Utc>, price: Option<Decimal>) -> Self {
        Self {
            lot_id: short_lot_id(),
            ticker: ticker.to_string(),
            quantity,
            buy_timestamp_utc: at,
            source: LotSource::Real,
            buy_price: price,
        }
    }

    /// Synthetic lot for a migrated position, back-dated to the original
    /// acquisition time so eligibility is computed from the real entry, not
    /// from the migration wall clock.
    pub fn synthetic(ticker: &str, quantity: u64, original_entry: DateTime<Utc>) -> Self {
        Self {
            lot_id: short_lot_id(),
            ticker: ticker.to_string(),
            quantity,
            buy_timestamp_utc: original_entry,
            source: LotSource::Synthetic,
            buy_price: None,
        }
    }
}

fn short_lot_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// A portfolio position: the per-ticker aggregate plus its lots.
///
/// `shares` is kept in sync with the lot sum on every mutation; positions
/// loaded from a pre-lot state file may carry `shares` with an empty lot
/// vector until migration runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub shares: u64,
    #[serde(default)]
    pub lots: Vec<Lot>,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    /// First buy timestamp
    pub entry_timestamp: DateTime<Utc>,
    /// Most recent buy timestamp
    pub last_buy_timestamp: DateTime<Utc>,
}

impl Position {
    pub fn lot_total(&self) -> u64 {
        self.lots.iter().map(|l| l.quantity).sum()
    }
}
