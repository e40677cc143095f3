//! Brokerage surface abstraction
//!
//! The execution pipeline drives the brokerage through this trait. The real
//! platform is a session-authenticated web UI; anything observable there can
//! lag, wobble or silently change, so every operation is fallible, carries an
//! artifact reference for later forensics, and is classified transient or
//! permanent by the caller via [`BotError::is_transient`].

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::domain::TradeIntent;
use crate::error::Result;

/// Navigation destinations within the brokerage UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavTarget {
    Dashboard,
    OrderForm { ticker: String },
    TransactionHistory,
}

impl std::fmt::Display for NavTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NavTarget::Dashboard => write!(f, "dashboard"),
            NavTarget::OrderForm { ticker } => write!(f, "order-form:{ticker}"),
            NavTarget::TransactionHistory => write!(f, "transaction-history"),
        }
    }
}

/// Outcome of a surface operation, with an optional artifact reference
/// (screenshot path, page snapshot id) captured at the step boundary.
#[derive(Debug, Clone, Default)]
pub struct SurfaceResponse {
    pub artifact: Option<String>,
}

impl SurfaceResponse {
    pub fn with_artifact(artifact: impl Into<String>) -> Self {
        Self {
            artifact: Some(artifact.into()),
        }
    }
}

/// What the platform shows on the order preview screen.
#[derive(Debug, Clone, Default)]
pub struct OrderPreview {
    pub estimated_price: Option<Decimal>,
    pub estimated_total: Option<Decimal>,
    pub artifact: Option<String>,
}

/// A position as the brokerage reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokeragePosition {
    pub ticker: String,
    pub quantity: u64,
    pub last_price: Option<Decimal>,
}

/// Driver for the brokerage platform.
///
/// `submit_order` is the only irreversible operation: once called, the order
/// may exist on the platform regardless of what the call returns. The
/// pipeline treats it accordingly (single attempt, verify via
/// `read_transaction_count` afterward).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerageSurface: Send + Sync {
    /// Establish an authenticated session.
    async fn authenticate(&self) -> Result<SurfaceResponse>;

    /// Navigate to a destination within the platform.
    async fn navigate(&self, target: NavTarget) -> Result<SurfaceResponse>;

    /// Enter ticker, side and quantity into the order form.
    async fn fill_order_form(&self, intent: &TradeIntent) -> Result<SurfaceResponse>;

    /// Attach the rationale note the platform requires per trade.
    async fn fill_trade_notes(&self, intent: &TradeIntent) -> Result<SurfaceResponse>;

    /// Open the order preview and read back what the platform will do.
    async fn preview_order(&self, intent: &TradeIntent) -> Result<OrderPreview>;

    /// Point of no return: confirm the previewed order.
    async fn submit_order(&self, intent: &TradeIntent) -> Result<SurfaceResponse>;

    /// Total transaction count as the platform reports it.
    async fn read_transaction_count(&self) -> Result<u64>;

    /// Current positions as the platform reports them.
    async fn read_positions(&self) -> Result<Vec<BrokeragePosition>>;
}
