//! Simulated brokerage surface
//!
//! In-memory stand-in for the real platform, used by `run --simulate` and by
//! the integration tests. Behaves like a well-functioning brokerage by
//! default; failure knobs inject transient errors, submit acks without a
//! count increment, and phantom extra transactions to exercise the
//! verification paths.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::domain::{TradeIntent, TradeSide};
use crate::error::{BotError, Result};

use super::traits::{BrokerageSurface, NavTarget, OrderPreview, SurfaceResponse};

#[derive(Debug, Default)]
struct FailureKnobs {
    /// Fail the next N authenticate calls with a transient error
    auth_failures: AtomicU32,
    /// Fail the next N fill_order_form calls with a transient error
    form_failures: AtomicU32,
    /// Fail the next N submit calls with a transient error
    submit_failures: AtomicU32,
    /// Ack the next N submits without incrementing the transaction count
    ack_without_count: AtomicU32,
    /// Add this many phantom transactions on the next submit
    phantom_transactions: AtomicU64,
}

/// Deterministic in-memory brokerage.
pub struct SimulatedSurface {
    transaction_count: AtomicU64,
    positions: Mutex<Vec<super::traits::BrokeragePosition>>,
    fill_price: Decimal,
    knobs: FailureKnobs,
}

impl Default for SimulatedSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSurface {
    pub fn new() -> Self {
        Self {
            transaction_count: AtomicU64::new(0),
            positions: Mutex::new(Vec::new()),
            fill_price: dec!(100.00),
            knobs: FailureKnobs::default(),
        }
    }

    /// Seed the platform-side transaction count (e.g. to mirror restored
    /// local state in a simulation run).
    pub fn with_transaction_count(self, count: u64) -> Self {
        self.transaction_count.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_next_auths(&self, n: u32) {
        self.knobs.auth_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_forms(&self, n: u32) {
        self.knobs.form_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_submits(&self, n: u32) {
        self.knobs.submit_failures.store(n, Ordering::SeqCst);
    }

    pub fn ack_next_submit_without_count(&self) {
        self.knobs.ack_without_count.store(1, Ordering::SeqCst);
    }

    pub fn inject_phantom_transactions(&self, n: u64) {
        self.knobs.phantom_transactions.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply_fill(&self, intent: &TradeIntent) {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        match positions.iter_mut().find(|p| p.ticker == intent.ticker) {
            Some(p) => match intent.side {
                TradeSide::Buy => p.quantity += intent.quantity,
                TradeSide::Sell => p.quantity = p.quantity.saturating_sub(intent.quantity),
            },
            None => {
                if intent.side == TradeSide::Buy {
                    positions.push(super::traits::BrokeragePosition {
                        ticker: intent.ticker.clone(),
                        quantity: intent.quantity,
                        last_price: Some(self.fill_price),
                    });
                }
            }
        }
        positions.retain(|p| p.quantity > 0);
    }
}

#[async_trait]
impl BrokerageSurface for SimulatedSurface {
    async fn authenticate(&self) -> Result<SurfaceResponse> {
        if Self::take_failure(&self.knobs.auth_failures) {
            return Err(BotError::Transient("simulated login timeout".into()));
        }
        debug!("simulated authentication");
        Ok(SurfaceResponse::default())
    }

    async fn navigate(&self, target: NavTarget) -> Result<SurfaceResponse> {
        debug!(%target, "simulated navigation");
        Ok(SurfaceResponse::default())
    }

    async fn fill_order_form(&self, intent: &TradeIntent) -> Result<SurfaceResponse> {
        if Self::take_failure(&self.knobs.form_failures) {
            return Err(BotError::Transient("simulated stale order form".into()));
        }
        debug!(ticker = %intent.ticker, "simulated order form fill");
        Ok(SurfaceResponse::default())
    }

    async fn fill_trade_notes(&self, _intent: &TradeIntent) -> Result<SurfaceResponse> {
        Ok(SurfaceResponse::default())
    }

    async fn preview_order(&self, intent: &TradeIntent) -> Result<OrderPreview> {
        Ok(OrderPreview {
            estimated_price: Some(self.fill_price),
            estimated_total: Some(self.fill_price * Decimal::from(intent.quantity)),
            artifact: None,
        })
    }

    async fn submit_order(&self, intent: &TradeIntent) -> Result<SurfaceResponse> {
        if Self::take_failure(&self.knobs.submit_failures) {
            return Err(BotError::Transient("simulated submit failure".into()));
        }

        let phantom = self.knobs.phantom_transactions.swap(0, Ordering::SeqCst);
        self.transaction_count.fetch_add(phantom, Ordering::SeqCst);

        if Self::take_failure(&self.knobs.ack_without_count) {
            debug!(ticker = %intent.ticker, "simulated submit acked without count increment");
            return Ok(SurfaceResponse::default());
        }

        self.transaction_count.fetch_add(1, Ordering::SeqCst);
        self.apply_fill(intent);
        debug!(ticker = %intent.ticker, side = %intent.side, "simulated submit");
        Ok(SurfaceResponse::default())
    }

    async fn read_transaction_count(&self) -> Result<u64> {
        Ok(self.transaction_count.load(Ordering::SeqCst))
    }

    async fn read_positions(&self) -> Result<Vec<super::traits::BrokeragePosition>> {
        let positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(positions.clone())
    }
}
