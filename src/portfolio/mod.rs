pub mod lots;

pub use lots::{migrate_synthetic_lots, HoldMode, LotTracker};
