//! Idempotency and atomic scheduling guard
//!
//! Ensures the bot trades at most once per calendar day, never exceeds the
//! competition trade budget, and never trusts its own counter blindly: the
//! local budget count is cross-verified against the brokerage's transaction
//! history before any cycle runs. Every check-then-act sequence here runs
//! under a single acquisition of the store lock.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::BudgetConfig;
use crate::domain::{TradeIntent, TradeLogEntry, TradeSide};
use crate::error::{BotError, Result};
use crate::persistence::{DailyMarker, DivergenceRecord, SharedStore};
use crate::portfolio::LotTracker;

/// Gatekeeper for cycle admission and trade settlement.
pub struct ExecutionGuard {
    store: SharedStore,
    budget: BudgetConfig,
    tracker: LotTracker,
}

impl ExecutionGuard {
    pub fn new(store: SharedStore, budget: BudgetConfig, tracker: LotTracker) -> Self {
        Self {
            store,
            budget,
            tracker,
        }
    }

    /// Atomically claim the daily execution slot for `date`.
    ///
    /// Check and commit happen inside one lock acquisition, so two triggers
    /// racing on the same logical day cannot both win: the first caller
    /// commits the marker and gets `true`, every later caller gets `false`.
    pub async fn try_begin_execution(&self, date: NaiveDate, locked_by: &str) -> Result<bool> {
        let mut store = self.store.lock().await;

        if store.state().committed_marker(date) {
            info!(%date, "execution already committed for this date");
            return Ok(false);
        }

        store.state_mut().markers.insert(
            date,
            DailyMarker {
                date,
                locked_by: locked_by.to_string(),
                committed: true,
                committed_at: Utc::now(),
            },
        );
        store.persist().await?;
        info!(%date, locked_by, "daily execution slot claimed");
        Ok(true)
    }

    /// Compare the local budget counter against the brokerage's transaction
    /// count. On mismatch the divergence is persisted and automated trading
    /// is blocked until `reconcile_trade_count` clears it.
    pub async fn cross_verify(&self, external_count: u64) -> Result<()> {
        let mut store = self.store.lock().await;

        if let Some(existing) = &store.state().divergence {
            return Err(BotError::StateDivergence {
                local: existing.local_trades,
                external: existing.external_count,
            });
        }

        let local = store.state().trades_used;
        if u64::from(local) == external_count {
            return Ok(());
        }

        warn!(
            local,
            external = external_count,
            "trade count divergence detected, blocking automated trading"
        );
        store.state_mut().divergence = Some(DivergenceRecord {
            detected_at: Utc::now(),
            local_trades: local,
            external_count,
        });
        store
            .state_mut()
            .record_error("trade count divergence with brokerage");
        store.persist().await?;

        Err(BotError::StateDivergence {
            local,
            external: external_count,
        })
    }

    /// Operator-driven reconciliation: adopt the brokerage's count as truth
    /// and clear the divergence block.
    pub async fn reconcile_trade_count(&self, external_count: u64) -> Result<()> {
        let adopted = u32::try_from(external_count).map_err(|_| {
            BotError::Validation(format!(
                "brokerage transaction count {external_count} is not a plausible trade counter"
            ))
        })?;
        let mut store = self.store.lock().await;
        let local = store.state().trades_used;
        store.state_mut().trades_used = adopted;
        store.state_mut().divergence = None;
        store.persist().await?;
        info!(
            was = local,
            now = external_count,
            "trade counter reconciled against brokerage"
        );
        Ok(())
    }

    /// Enforce the lifetime trade budget: the hard ceiling blocks everything,
    /// the soft ceiling blocks new buys while still permitting exits.
    pub async fn check_budget(&self, side: TradeSide) -> Result<()> {
        let store = self.store.lock().await;
        let used = store.state().trades_used;

        if used >= self.budget.max_trades {
            return Err(BotError::BudgetExceeded {
                used,
                limit: self.budget.max_trades,
            });
        }
        if side == TradeSide::Buy && used >= self.budget.hard_stop_trades {
            return Err(BotError::BudgetExceeded {
                used,
                limit: self.budget.hard_stop_trades,
            });
        }
        Ok(())
    }

    /// Validate a sell against the holding-period rules.
    pub async fn check_sell_eligibility(
        &self,
        intent: &TradeIntent,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if intent.side != TradeSide::Sell {
            return Ok(());
        }
        let store = self.store.lock().await;
        self.tracker
            .check_sell(store.state(), &intent.ticker, intent.quantity, now)
    }

    /// Same-day duplicate check: an identical confirmed order (ticker, side,
    /// quantity) already in today's trade log skips this intent. Catches a
    /// crash-and-restart re-planning the same orders.
    pub async fn is_duplicate_today(&self, intent: &TradeIntent, date: NaiveDate) -> bool {
        let store = self.store.lock().await;
        let fp = intent.fingerprint();
        let duplicate = store
            .state()
            .trades_on(date)
            .any(|entry| entry.fingerprint() == fp);
        duplicate
    }

    /// Settle a verified trade: mutate lots, bump the budget counter and
    /// append the trade log entry in one critical section, then persist.
    pub async fn record_settlement(
        &self,
        intent: &TradeIntent,
        price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let mut store = self.store.lock().await;

        match intent.side {
            TradeSide::Buy => {
                self.tracker
                    .add_buy_lot(store.state_mut(), &intent.ticker, intent.quantity, now, price);
            }
            TradeSide::Sell => {
                self.tracker
                    .consume_sell_fifo(store.state_mut(), &intent.ticker, intent.quantity, now)?;
            }
        }

        let state = store.state_mut();
        state.trades_used += 1;
        let trade_number = state.trades_used;
        state.trade_log.push(TradeLogEntry {
            timestamp: now,
            ticker: intent.ticker.clone(),
            side: intent.side,
            quantity: intent.quantity,
            price,
            rationale: intent.rationale.clone(),
            trade_number,
        });
        store.persist().await?;

        info!(
            ticker = %intent.ticker,
            side = %intent.side,
            quantity = intent.quantity,
            trade_number,
            "trade settled"
        );
        Ok(trade_number)
    }
}
