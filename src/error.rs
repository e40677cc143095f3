use thiserror::Error;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum BotError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Brokerage surface errors
    #[error("Transient surface error: {0}")]
    Transient(String),

    #[error("Step '{step}' timed out after {elapsed_ms}ms")]
    StepTimeout { step: String, elapsed_ms: u64 },

    #[error("Surface error: {0}")]
    Surface(String),

    // Verification errors
    #[error("Transaction count mismatch after submission: expected {expected}, observed {observed}")]
    VerificationMismatch { expected: u64, observed: u64 },

    #[error("Local state diverged from brokerage: local trades {local}, brokerage {external}")]
    StateDivergence { local: u32, external: u64 },

    // Pre-dispatch rejections
    #[error("Trade budget exceeded: {used}/{limit} trades used")]
    BudgetExceeded { used: u32, limit: u32 },

    #[error("Holding period violation for {ticker}: requested {requested}, eligible {eligible}")]
    HoldingPeriodViolation {
        ticker: String,
        requested: u64,
        eligible: u64,
    },

    // Configuration-vs-state inconsistencies
    #[error("Configuration inconsistency: {0}")]
    ConfigurationInconsistency(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Circuit breaker
    #[error("Circuit breaker open: retry in {retry_in_secs}s")]
    BreakerOpen { retry_in_secs: u64 },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl BotError {
    /// Whether a failed step may be retried within its bound.
    ///
    /// Only transport-level flakiness qualifies; every other failure is a
    /// decision the caller has to make.
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::Transient(_) | BotError::StepTimeout { .. })
    }
}

/// Result type alias for BotError
pub type Result<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BotError::Transient("reset".into()).is_transient());
        assert!(BotError::StepTimeout {
            step: "submit".into(),
            elapsed_ms: 30_000,
        }
        .is_transient());
        assert!(!BotError::Surface("login rejected".into()).is_transient());
        assert!(!BotError::VerificationMismatch {
            expected: 5,
            observed: 7,
        }
        .is_transient());
    }
}
