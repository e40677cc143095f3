pub mod cycle;
pub mod state_machine;

pub use cycle::{CycleOutcome, CycleReport, CycleRunner, IntentDisposition, IntentOutcome};
pub use state_machine::{Checkpoint, ExecutionPipeline, ExecutionRecord, TradeState};
