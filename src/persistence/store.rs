//! Durable state document
//!
//! Single source of truth on the local node: positions and lots, the trade
//! log, daily execution markers, the budget counter, breaker counters and
//! execution checkpoints all live in one JSON document. Every write takes a
//! backup snapshot first and lands via temp-file + rename; a corrupted
//! primary is recovered from the backup on load.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::coordination::BreakerRecord;
use crate::domain::{Position, TradeLogEntry};
use crate::error::Result;
use crate::execution::ExecutionRecord;

/// One-per-calendar-day execution marker.
///
/// At most one committed marker may exist per date; the guard's
/// check-then-commit runs under a single store lock acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyMarker {
    pub date: NaiveDate,
    pub locked_by: String,
    pub committed: bool,
    pub committed_at: DateTime<Utc>,
}

/// Recorded divergence between the local budget counter and the brokerage's
/// transaction count. Blocks automated trading until reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub detected_at: DateTime<Utc>,
    pub local_trades: u32,
    pub external_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// The complete durable state of the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    /// Monotonic trade budget counter; incremented exactly once per
    /// confirmed execution, never decremented.
    #[serde(default)]
    pub trades_used: u32,

    #[serde(default)]
    pub positions: BTreeMap<String, Position>,

    /// Append-only confirmed-trade history
    #[serde(default)]
    pub trade_log: Vec<TradeLogEntry>,

    #[serde(default)]
    pub markers: BTreeMap<NaiveDate, DailyMarker>,

    #[serde(default)]
    pub breaker: BreakerRecord,

    /// Active (non-terminal) execution records, keyed by run id
    #[serde(default)]
    pub executions: BTreeMap<String, ExecutionRecord>,

    /// Terminal execution records; archived, never mutated afterward
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,

    #[serde(default)]
    pub divergence: Option<DivergenceRecord>,

    /// Set when the configured hold mode disagrees with the lot distribution
    #[serde(default)]
    pub hold_mode_inconsistent: bool,

    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
}

impl Default for BotState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_updated: now,
            trades_used: 0,
            positions: BTreeMap::new(),
            trade_log: Vec::new(),
            markers: BTreeMap::new(),
            breaker: BreakerRecord::default(),
            executions: BTreeMap::new(),
            execution_history: Vec::new(),
            divergence: None,
            hold_mode_inconsistent: false,
            error_count: 0,
            last_error: None,
        }
    }
}

impl BotState {
    pub fn trades_remaining(&self, max_trades: u32) -> u32 {
        max_trades.saturating_sub(self.trades_used)
    }

    /// Trade log entries whose UTC timestamp falls on `date`.
    pub fn trades_on(&self, date: NaiveDate) -> impl Iterator<Item = &TradeLogEntry> {
        self.trade_log
            .iter()
            .filter(move |t| t.timestamp.date_naive() == date)
    }

    pub fn committed_marker(&self, date: NaiveDate) -> bool {
        self.markers.get(&date).map(|m| m.committed).unwrap_or(false)
    }

    pub fn record_error(&mut self, message: &str) {
        self.error_count += 1;
        self.last_error = Some(ErrorRecord {
            timestamp: Utc::now(),
            message: message.to_string(),
        });
    }
}

/// Durable store: owns the in-memory state and its on-disk home.
///
/// All mutation flows through one `tokio::sync::Mutex<StateStore>`; callers
/// lock, mutate via `state_mut`, call `persist`, and release. There is
/// exactly one writer critical section for shared counters, not one per
/// ticker.
pub struct StateStore {
    path: PathBuf,
    backup_path: PathBuf,
    state: BotState,
}

/// Shared handle to the store; the one lock serializing all writes.
pub type SharedStore = Arc<Mutex<StateStore>>;

impl StateStore {
    /// Load state from disk, falling back to the backup snapshot when the
    /// primary is unreadable, or initialize fresh state.
    pub async fn open(cfg: &StoreConfig) -> Result<Self> {
        let path = cfg.path.clone();
        let backup_path = cfg.backup_path();

        let state = match Self::read_document(&path).await {
            Ok(Some(state)) => {
                info!(path = %path.display(), "loaded state");
                state
            }
            Ok(None) => {
                info!("no existing state file, initializing fresh state");
                BotState::default()
            }
            Err(primary_err) => {
                error!(error = %primary_err, "state file unreadable, trying backup");
                match Self::read_document(&backup_path).await {
                    Ok(Some(state)) => {
                        warn!(path = %backup_path.display(), "recovered state from backup");
                        state
                    }
                    _ => {
                        error!("both state files unreadable, initializing fresh state");
                        BotState::default()
                    }
                }
            }
        };

        let mut store = Self {
            path,
            backup_path,
            state,
        };

        let migrated = crate::portfolio::migrate_synthetic_lots(&mut store.state);
        if migrated > 0 {
            info!(lots = migrated, "created synthetic lots for pre-lot positions");
            store.persist().await?;
        }

        Ok(store)
    }

    async fn read_document(path: &Path) -> Result<Option<BotState>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn state(&self) -> &BotState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut BotState {
        &mut self.state
    }

    /// Flush state durably: snapshot the current file to the backup path,
    /// write to a temp file, then atomically rename over the primary.
    pub async fn persist(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tokio::fs::copy(&self.path, &self.backup_path).await?;
        }

        self.state.last_updated = Utc::now();
        let content = serde_json::to_string_pretty(&self.state)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), "state persisted");
        Ok(())
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }
}
