pub mod lot;
pub mod trade;

pub use lot::{Lot, LotSource, Position};
pub use trade::{TradeIntent, TradeLogEntry, TradeSide};
