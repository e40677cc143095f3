//! FIFO lot tracking and holding-period enforcement
//!
//! Every buy creates a lot; sells validate against and consume lots
//! oldest-first. A lot becomes sellable once the minimum holding period plus
//! safety buffer has elapsed since its buy timestamp. Validation is
//! fail-closed: a sell that exceeds the eligible quantity is rejected whole,
//! never partially executed.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HoldingConfig;
use crate::domain::{Lot, Position};
use crate::error::{BotError, Result};
use crate::persistence::BotState;

/// Holding-period enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldMode {
    /// Per-lot FIFO: each lot unlocks independently once held long enough
    #[serde(rename = "LOT_FIFO", alias = "lot_fifo")]
    LotFifo,
    /// Any buy of a ticker within the holding window blocks all sells of it
    #[serde(rename = "STRICT_TICKER", alias = "strict_ticker")]
    StrictTicker,
}

impl Default for HoldMode {
    fn default() -> Self {
        Self::LotFifo
    }
}

impl std::fmt::Display for HoldMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoldMode::LotFifo => write!(f, "LOT_FIFO"),
            HoldMode::StrictTicker => write!(f, "STRICT_TICKER"),
        }
    }
}

/// Validates and applies lot-level portfolio mutations.
#[derive(Debug, Clone)]
pub struct LotTracker {
    holding: HoldingConfig,
}

impl LotTracker {
    pub fn new(holding: HoldingConfig) -> Self {
        Self { holding }
    }

    fn required_hold(&self) -> Duration {
        Duration::seconds(self.holding.required_hold_secs() as i64)
    }

    /// A lot is eligible when the full hold (period + buffer) has elapsed.
    /// The boundary is inclusive. Lots stamped in the future are never
    /// eligible (fail-closed).
    fn lot_eligible(&self, lot: &Lot, now: DateTime<Utc>) -> bool {
        if lot.buy_timestamp_utc > now {
            return false;
        }
        now - lot.buy_timestamp_utc >= self.required_hold()
    }

    /// Shares of `ticker` that may be sold at `now` under the active mode.
    pub fn eligible_sell_quantity(&self, state: &BotState, ticker: &str, now: DateTime<Utc>) -> u64 {
        let Some(position) = state.positions.get(ticker) else {
            return 0;
        };

        match self.holding.mode {
            HoldMode::LotFifo => position
                .lots
                .iter()
                .filter(|l| self.lot_eligible(l, now))
                .map(|l| l.quantity)
                .sum(),
            HoldMode::StrictTicker => {
                let any_recent = position
                    .lots
                    .iter()
                    .any(|l| !self.lot_eligible(l, now));
                if any_recent {
                    0
                } else {
                    position.shares
                }
            }
        }
    }

    /// Reject a sell that exceeds the currently eligible quantity.
    pub fn check_sell(
        &self,
        state: &BotState,
        ticker: &str,
        quantity: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let eligible = self.eligible_sell_quantity(state, ticker, now);
        if quantity > eligible {
            if let Some(unlock) = self.earliest_eligible_time(state, ticker, now) {
                debug!(ticker, %unlock, "next lot unlocks");
            }
            return Err(BotError::HoldingPeriodViolation {
                ticker: ticker.to_string(),
                requested: quantity,
                eligible,
            });
        }
        Ok(())
    }

    /// Consume `quantity` shares from the oldest eligible lots first.
    ///
    /// Validates before mutating; on rejection the state is untouched.
    pub fn consume_sell_fifo(
        &self,
        state: &mut BotState,
        ticker: &str,
        quantity: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_sell(state, ticker, quantity, now)?;

        let position = state
            .positions
            .get_mut(ticker)
            .ok_or_else(|| BotError::InvalidState(format!("no position for {ticker}")))?;

        position
            .lots
            .sort_by_key(|l| l.buy_timestamp_utc);

        let mut remaining = quantity;
        for lot in position.lots.iter_mut() {
            if remaining == 0 {
                break;
            }
            if !self.lot_eligible(lot, now) {
                continue;
            }
            let take = remaining.min(lot.quantity);
            lot.quantity -= take;
            remaining -= take;
        }
        position.lots.retain(|l| l.quantity > 0);
        position.shares = position.shares.saturating_sub(quantity);

        if position.shares == 0 {
            state.positions.remove(ticker);
            info!(ticker, "position fully exited");
        } else {
            debug!(ticker, sold = quantity, remaining = position.shares, "lots consumed");
        }
        Ok(())
    }

    /// Record a confirmed buy: extend or create the position and append a lot.
    pub fn add_buy_lot(
        &self,
        state: &mut BotState,
        ticker: &str,
        quantity: u64,
        at: DateTime<Utc>,
        price: Option<Decimal>,
    ) {
        let position = state
            .positions
            .entry(ticker.to_string())
            .or_insert_with(|| Position {
                ticker: ticker.to_string(),
                shares: 0,
                lots: Vec::new(),
                entry_price: price,
                entry_timestamp: at,
                last_buy_timestamp: at,
            });

        position.shares += quantity;
        position.last_buy_timestamp = at;
        position.lots.push(Lot::real(ticker, quantity, at, price));
        debug!(ticker, quantity, total = position.shares, "buy lot added");
    }

    /// When the next currently-ineligible lot of `ticker` unlocks, if any.
    pub fn earliest_eligible_time(
        &self,
        state: &BotState,
        ticker: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let position = state.positions.get(ticker)?;
        position
            .lots
            .iter()
            .filter(|l| !self.lot_eligible(l, now))
            .map(|l| l.buy_timestamp_utc + self.required_hold())
            .min()
    }

    /// Check that the active mode fits the lot distribution.
    ///
    /// STRICT_TICKER with multiple distinct-timestamp lots for one ticker is
    /// a configuration inconsistency: the per-ticker rule cannot express what
    /// those lots record. The flag is persisted so the inconsistency survives
    /// a restart; semantics are not silently changed.
    pub fn validate_mode_consistency(&self, state: &mut BotState) -> bool {
        if self.holding.mode != HoldMode::StrictTicker {
            state.hold_mode_inconsistent = false;
            return true;
        }

        let mut consistent = true;
        for (ticker, position) in &state.positions {
            let mut stamps: Vec<_> = position.lots.iter().map(|l| l.buy_timestamp_utc).collect();
            stamps.sort();
            stamps.dedup();
            if stamps.len() > 1 {
                warn!(
                    ticker,
                    lots = position.lots.len(),
                    "STRICT_TICKER mode with multiple distinct-timestamp lots"
                );
                consistent = false;
            }
        }
        state.hold_mode_inconsistent = !consistent;
        consistent
    }
}

/// Give positions that pre-date lot tracking a synthetic lot covering the
/// untracked share count, back-dated to the original entry time. Returns the
/// number of lots created.
///
/// Back-dating keeps already-eligible holdings eligible: the unlock moment is
/// computed from when the shares were actually acquired, never from when the
/// migration happened to run.
pub fn migrate_synthetic_lots(state: &mut BotState) -> usize {
    let mut created = 0;
    for position in state.positions.values_mut() {
        let tracked = position.lot_total();
        if position.shares > tracked {
            let missing = position.shares - tracked;
            position.lots.push(Lot::synthetic(
                &position.ticker,
                missing,
                position.entry_timestamp,
            ));
            position.lots.sort_by_key(|l| l.buy_timestamp_utc);
            created += 1;
        }
    }
    if created > 0 {
        debug!(created, "synthetic lot migration complete");
    }
    created
}
