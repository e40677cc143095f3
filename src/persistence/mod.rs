pub mod store;

pub use store::{BotState, DailyMarker, DivergenceRecord, ErrorRecord, SharedStore, StateStore};
