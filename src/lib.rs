//! Trade execution control plane for a web-brokerage competition portfolio.
//!
//! The crate turns an ordered trade plan into verified executions against a
//! brokerage surface while enforcing the competition's rules: at most one
//! cycle per day, a lifetime trade budget, and a minimum holding period
//! tracked per purchase lot. A state machine with durable checkpoints makes
//! submission exactly-once even across crashes, and a persisted circuit
//! breaker stops the bot from hammering a broken platform.

pub mod brokerage;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod execution;
pub mod persistence;
pub mod planner;
pub mod portfolio;

pub use config::AppConfig;
pub use error::{BotError, Result};
