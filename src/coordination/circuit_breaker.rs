//! Execution circuit breaker
//!
//! Protects the brokerage surface from being hammered while it is broken:
//! N consecutive failed executions open the breaker, a cool-down later a
//! single half-open trial probes recovery. Counters are persisted in the
//! state document so a restart cannot reset an open breaker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, executions allowed
    Closed,
    /// Failure threshold exceeded, executions blocked
    Open,
    /// Cool-down elapsed, exactly one trial execution permitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// What the breaker says about starting a new execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Closed: proceed normally
    Allow,
    /// Half-open: proceed as the single recovery trial
    AllowTrial,
    /// Open: blocked until the cool-down elapses
    Blocked { retry_in_secs: u64 },
}

/// Durable breaker counters, stored inside the state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerRecord {
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Set while the single half-open trial is running; a second caller in
    /// the same window is blocked.
    #[serde(default)]
    pub trial_in_flight: bool,
    /// When the in-flight trial claimed its slot. A claim that was never
    /// resolved (crash mid-trial) expires after one cool-down so the breaker
    /// cannot wedge shut.
    #[serde(default)]
    pub trial_claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_trips: u64,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Threshold logic over a persisted [`BreakerRecord`].
///
/// Holds no state of its own; callers mutate the record under the store lock
/// and persist afterward.
#[derive(Debug, Clone)]
pub struct ExecutionCircuitBreaker {
    cfg: BreakerConfig,
}

impl ExecutionCircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self { cfg }
    }

    /// Derive the current circuit state from the persisted record.
    pub fn state(&self, record: &BreakerRecord, now: DateTime<Utc>) -> CircuitState {
        match record.cooldown_until {
            None => CircuitState::Closed,
            Some(until) if now < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    /// Gate a new execution, claiming the half-open trial slot when the
    /// cool-down has elapsed. Must be called under the store lock.
    pub fn should_allow(&self, record: &mut BreakerRecord, now: DateTime<Utc>) -> BreakerDecision {
        match self.state(record, now) {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                let retry_in_secs = record
                    .cooldown_until
                    .map(|until| (until - now).num_seconds().max(0) as u64)
                    .unwrap_or(0);
                debug!(retry_in_secs, "breaker open, execution blocked");
                BreakerDecision::Blocked { retry_in_secs }
            }
            CircuitState::HalfOpen => {
                if record.trial_in_flight {
                    let stale = record
                        .trial_claimed_at
                        .map(|claimed| now - claimed >= Duration::seconds(self.cfg.cooldown_secs as i64))
                        .unwrap_or(true);
                    if !stale {
                        debug!("half-open trial already in flight, execution blocked");
                        return BreakerDecision::Blocked { retry_in_secs: 0 };
                    }
                    warn!("unresolved trial claim expired, reclaiming the slot");
                }
                record.trial_in_flight = true;
                record.trial_claimed_at = Some(now);
                info!("breaker half-open, permitting recovery trial");
                BreakerDecision::AllowTrial
            }
        }
    }

    /// A successful execution closes the circuit and resets all counters.
    pub fn record_success(&self, record: &mut BreakerRecord) {
        if record.cooldown_until.is_some() {
            info!("recovery trial succeeded, breaker closed");
        }
        record.consecutive_failures = 0;
        record.opened_at = None;
        record.cooldown_until = None;
        record.trial_in_flight = false;
        record.trial_claimed_at = None;
    }

    /// A failed execution bumps the counter; at the threshold, or on a failed
    /// half-open trial, the circuit opens and the cool-down restarts.
    pub fn record_failure(&self, record: &mut BreakerRecord, now: DateTime<Utc>) {
        let failed_trial = record.trial_in_flight;
        record.trial_in_flight = false;
        record.trial_claimed_at = None;
        record.consecutive_failures += 1;
        record.last_failure_at = Some(now);

        if failed_trial || record.consecutive_failures >= self.cfg.failure_threshold {
            record.opened_at = Some(now);
            record.cooldown_until = Some(now + Duration::seconds(self.cfg.cooldown_secs as i64));
            record.total_trips += 1;
            warn!(
                failures = record.consecutive_failures,
                cooldown_secs = self.cfg.cooldown_secs,
                "circuit breaker opened"
            );
        } else {
            debug!(
                failures = record.consecutive_failures,
                threshold = self.cfg.failure_threshold,
                "execution failure recorded"
            );
        }
    }
}
