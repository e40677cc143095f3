use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::portfolio::HoldMode;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub holding: HoldingConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file plus `BOT_`-prefixed environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(Path::new(path)).required(false))
            .add_source(Environment::with_prefix("BOT").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

/// Minimum holding period enforcement
#[derive(Debug, Clone, Deserialize)]
pub struct HoldingConfig {
    /// LOT_FIFO (per-lot) or STRICT_TICKER (any recent buy blocks all sells)
    #[serde(default)]
    pub mode: HoldMode,
    /// Minimum hold in seconds (default: 24h)
    #[serde(default = "default_min_hold_secs")]
    pub min_hold_secs: u64,
    /// Safety buffer so a sell never lands at 23:59:59 of the hold window
    #[serde(default = "default_hold_buffer_secs")]
    pub buffer_secs: u64,
}

impl HoldingConfig {
    /// Full required hold: minimum period plus safety buffer.
    pub fn required_hold_secs(&self) -> u64 {
        self.min_hold_secs + self.buffer_secs
    }
}

fn default_min_hold_secs() -> u64 {
    24 * 3600
}

fn default_hold_buffer_secs() -> u64 {
    300
}

impl Default for HoldingConfig {
    fn default() -> Self {
        Self {
            mode: HoldMode::default(),
            min_hold_secs: default_min_hold_secs(),
            buffer_secs: default_hold_buffer_secs(),
        }
    }
}

/// Lifetime trade-count budget
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Hard ceiling: no trades of any kind past this count
    #[serde(default = "default_max_trades")]
    pub max_trades: u32,
    /// Soft ceiling: new buys blocked past this count, exits still allowed
    #[serde(default = "default_hard_stop_trades")]
    pub hard_stop_trades: u32,
}

fn default_max_trades() -> u32 {
    80
}

fn default_hard_stop_trades() -> u32 {
    70
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_trades: default_max_trades(),
            hard_stop_trades: default_hard_stop_trades(),
        }
    }
}

/// Per-step retry and timeout policy for the execution pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum attempts per pipeline step
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,
    /// Hard timeout per brokerage call in milliseconds
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Base backoff between retries in milliseconds (doubles per attempt)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_step_attempts() -> u32 {
    3
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: default_max_step_attempts(),
            step_timeout_ms: default_step_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cool-down before a half-open trial is permitted, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    300
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Durable state location
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the state document
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl StoreConfig {
    /// Backup snapshot written before every state mutation.
    pub fn backup_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".bak");
        PathBuf::from(p)
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("state/bot_state.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rotated log files; unset disables file logging
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}
