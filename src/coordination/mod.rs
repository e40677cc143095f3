pub mod circuit_breaker;
pub mod guard;

pub use circuit_breaker::{
    BreakerDecision, BreakerRecord, CircuitState, ExecutionCircuitBreaker,
};
pub use guard::ExecutionGuard;
