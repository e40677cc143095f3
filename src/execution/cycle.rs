//! Daily trade cycle orchestration
//!
//! One cycle per calendar day: claim the daily slot, cross-verify local
//! state against the brokerage, resume anything a crash left behind, then
//! run the planner's intents in order. The breaker gates every dispatch;
//! an open breaker or a verification mismatch halts the whole cycle, while
//! an ordinary failed intent is logged and the cycle moves on.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::coordination::{BreakerDecision, ExecutionCircuitBreaker, ExecutionGuard};
use crate::domain::{TradeIntent, TradeSide};
use crate::error::{BotError, Result};
use crate::persistence::SharedStore;
use crate::portfolio::LotTracker;

use super::state_machine::{ExecutionPipeline, ExecutionRecord, TradeState};

/// How the cycle as a whole ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    /// The daily slot was already claimed for this date
    AlreadyRan,
    HaltedBreakerOpen,
    HaltedDivergence,
    /// A transaction-count mismatch was detected mid-cycle
    HaltedVerification,
    AbortedExternally,
}

/// What happened to one planned intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentDisposition {
    Executed,
    /// Dry run stopped after preview
    Previewed,
    SkippedDuplicate,
    RejectedBudget,
    RejectedHolding,
    Failed,
    /// Never dispatched: the cycle halted or was aborted first
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentOutcome {
    pub ticker: String,
    pub side: TradeSide,
    pub quantity: u64,
    pub disposition: IntentDisposition,
    pub run_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub date: NaiveDate,
    pub outcome: CycleOutcome,
    pub intents: Vec<IntentOutcome>,
    /// Interrupted executions recovered at cycle start
    pub resumed: usize,
}

/// Runs one full daily cycle.
pub struct CycleRunner {
    store: SharedStore,
    guard: ExecutionGuard,
    breaker: ExecutionCircuitBreaker,
    pipeline: ExecutionPipeline,
    tracker: LotTracker,
    surface: Arc<dyn crate::brokerage::BrokerageSurface>,
    abort: Arc<AtomicBool>,
}

impl CycleRunner {
    pub fn new(
        store: SharedStore,
        guard: ExecutionGuard,
        breaker: ExecutionCircuitBreaker,
        pipeline: ExecutionPipeline,
        tracker: LotTracker,
        surface: Arc<dyn crate::brokerage::BrokerageSurface>,
    ) -> Self {
        Self {
            store,
            guard,
            breaker,
            pipeline,
            tracker,
            surface,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for aborting the cycle externally. The abort takes effect
    /// between intents, never mid-intent.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub async fn run(
        &self,
        date: NaiveDate,
        trigger: &str,
        intents: Vec<TradeIntent>,
    ) -> Result<CycleReport> {
        let mut report = CycleReport {
            date,
            outcome: CycleOutcome::Completed,
            intents: Vec::new(),
            resumed: 0,
        };

        if !self.guard.try_begin_execution(date, trigger).await? {
            report.outcome = CycleOutcome::AlreadyRan;
            report.intents = skip_all(&intents);
            return Ok(report);
        }

        self.validate_hold_mode().await?;
        report.resumed = self.resume_pending().await?;

        // Trust nothing local until the platform's count agrees.
        let external = self.surface.read_transaction_count().await?;
        match self.guard.cross_verify(external).await {
            Ok(()) => {}
            Err(BotError::StateDivergence { .. }) => {
                report.outcome = CycleOutcome::HaltedDivergence;
                report.intents = skip_all(&intents);
                return Ok(report);
            }
            Err(e) => return Err(e),
        }

        self.audit_positions().await?;

        let mut intents = intents.into_iter();
        for intent in intents.by_ref() {
            if self.abort.load(Ordering::SeqCst) {
                warn!("cycle aborted externally, skipping remaining intents");
                report.outcome = CycleOutcome::AbortedExternally;
                report.intents.push(skipped(&intent));
                break;
            }

            match self.breaker_decision().await? {
                BreakerDecision::Allow | BreakerDecision::AllowTrial => {}
                BreakerDecision::Blocked { retry_in_secs } => {
                    warn!(retry_in_secs, "breaker open, halting cycle");
                    report.outcome = CycleOutcome::HaltedBreakerOpen;
                    report.intents.push(skipped(&intent));
                    break;
                }
            }

            let (outcome, halt_verification) = self.run_intent(&intent, date).await?;
            report.intents.push(outcome);

            if halt_verification {
                report.outcome = CycleOutcome::HaltedVerification;
                break;
            }
        }
        report.intents.extend(intents.map(|i| skipped(&i)));

        info!(
            %date,
            outcome = ?report.outcome,
            intents = report.intents.len(),
            "cycle finished"
        );
        Ok(report)
    }

    /// Run one intent end to end. The second return value reports whether a
    /// verification mismatch occurred, which must halt the cycle.
    async fn run_intent(
        &self,
        intent: &TradeIntent,
        date: NaiveDate,
    ) -> Result<(IntentOutcome, bool)> {
        let mut outcome = IntentOutcome {
            ticker: intent.ticker.clone(),
            side: intent.side,
            quantity: intent.quantity,
            disposition: IntentDisposition::Skipped,
            run_id: None,
            error: None,
        };

        if self.guard.is_duplicate_today(intent, date).await {
            info!(ticker = %intent.ticker, "identical order already in today's log, skipping");
            outcome.disposition = IntentDisposition::SkippedDuplicate;
            return Ok((outcome, false));
        }

        if let Err(e) = self.guard.check_budget(intent.side).await {
            warn!(ticker = %intent.ticker, error = %e, "intent rejected");
            outcome.disposition = IntentDisposition::RejectedBudget;
            outcome.error = Some(e.to_string());
            return Ok((outcome, false));
        }

        if let Err(e) = self.guard.check_sell_eligibility(intent, Utc::now()).await {
            warn!(ticker = %intent.ticker, error = %e, "intent rejected");
            outcome.disposition = IntentDisposition::RejectedHolding;
            outcome.error = Some(e.to_string());
            return Ok((outcome, false));
        }

        let record = self.pipeline.execute(intent.clone()).await?;
        outcome.run_id = Some(record.run_id.clone());
        self.apply_record(&record, &mut outcome).await?;
        Ok((outcome, record.verification_mismatch))
    }

    /// Settle a terminal record and feed the breaker.
    async fn apply_record(
        &self,
        record: &ExecutionRecord,
        outcome: &mut IntentOutcome,
    ) -> Result<()> {
        match record.state {
            TradeState::Verified => {
                self.guard
                    .record_settlement(&record.intent, None, Utc::now())
                    .await?;
                self.breaker_success().await?;
                outcome.disposition = IntentDisposition::Executed;
            }
            TradeState::Previewed if record.dry_run => {
                outcome.disposition = IntentDisposition::Previewed;
            }
            _ => {
                self.breaker_failure().await?;
                outcome.disposition = IntentDisposition::Failed;
                outcome.error = record.last_error.clone();
            }
        }
        Ok(())
    }

    /// Re-enter executions a crash left non-terminal, settling any that turn
    /// out to have been verified.
    async fn resume_pending(&self) -> Result<usize> {
        let pending: Vec<ExecutionRecord> = {
            let store = self.store.lock().await;
            store.state().executions.values().cloned().collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let mut resumed = 0;
        for record in pending {
            let run_id = record.run_id.clone();
            let finished = self.pipeline.resume(record).await?;
            match finished.state {
                TradeState::Verified => {
                    self.guard
                        .record_settlement(&finished.intent, None, Utc::now())
                        .await?;
                    self.breaker_success().await?;
                    info!(%run_id, "interrupted execution recovered and settled");
                }
                // A rehearsal stops at the preview; nothing to settle and no
                // failure to count.
                TradeState::Previewed if finished.dry_run => {
                    info!(%run_id, "interrupted dry run stopped at preview");
                }
                state => {
                    self.breaker_failure().await?;
                    error!(%run_id, %state, "interrupted execution did not verify");
                }
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Compare local positions against what the platform reports. Share-count
    /// disagreements are warned about but do not block: the transaction-count
    /// cross-verification is the authoritative gate.
    async fn audit_positions(&self) -> Result<()> {
        let external = self.surface.read_positions().await?;
        let store = self.store.lock().await;
        let state = store.state();

        for remote in &external {
            let local = state.positions.get(&remote.ticker).map(|p| p.shares);
            if local != Some(remote.quantity) {
                warn!(
                    ticker = %remote.ticker,
                    local = local.unwrap_or(0),
                    brokerage = remote.quantity,
                    "position quantity differs from brokerage"
                );
            }
        }
        for (ticker, position) in &state.positions {
            if !external.iter().any(|r| &r.ticker == ticker) {
                warn!(
                    ticker = %ticker,
                    shares = position.shares,
                    "position tracked locally but absent at brokerage"
                );
            }
        }
        Ok(())
    }

    async fn validate_hold_mode(&self) -> Result<()> {
        let mut store = self.store.lock().await;
        let consistent = {
            let state = store.state_mut();
            self.tracker.validate_mode_consistency(state)
        };
        store.persist().await?;
        if !consistent {
            warn!("hold mode inconsistent with lot distribution, continuing flagged");
        }
        Ok(())
    }

    async fn breaker_decision(&self) -> Result<BreakerDecision> {
        let mut store = self.store.lock().await;
        let decision = self
            .breaker
            .should_allow(&mut store.state_mut().breaker, Utc::now());
        store.persist().await?;
        Ok(decision)
    }

    async fn breaker_success(&self) -> Result<()> {
        let mut store = self.store.lock().await;
        self.breaker.record_success(&mut store.state_mut().breaker);
        store.persist().await
    }

    async fn breaker_failure(&self) -> Result<()> {
        let mut store = self.store.lock().await;
        self.breaker
            .record_failure(&mut store.state_mut().breaker, Utc::now());
        store.persist().await
    }
}

fn skipped(intent: &TradeIntent) -> IntentOutcome {
    IntentOutcome {
        ticker: intent.ticker.clone(),
        side: intent.side,
        quantity: intent.quantity,
        disposition: IntentDisposition::Skipped,
        run_id: None,
        error: None,
    }
}

fn skip_all(intents: &[TradeIntent]) -> Vec<IntentOutcome> {
    intents.iter().map(skipped).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokerage::{BrokerageSurface, SimulatedSurface};
    use crate::config::{
        AppConfig, BreakerConfig, BudgetConfig, ExecutionConfig, HoldingConfig, StoreConfig,
    };
    use crate::persistence::StateStore;
    use tempfile::TempDir;

    async fn runner(
        dir: &TempDir,
        surface: Arc<SimulatedSurface>,
        cfg: &AppConfig,
        dry_run: bool,
    ) -> CycleRunner {
        let store_cfg = StoreConfig {
            path: dir.path().join("bot_state.json"),
        };
        let store = StateStore::open(&store_cfg).await.unwrap().into_shared();
        let tracker = LotTracker::new(cfg.holding.clone());
        let surface: Arc<dyn crate::brokerage::BrokerageSurface> = surface;
        CycleRunner::new(
            store.clone(),
            ExecutionGuard::new(store.clone(), cfg.budget.clone(), tracker.clone()),
            ExecutionCircuitBreaker::new(cfg.breaker.clone()),
            ExecutionPipeline::new(
                surface.clone(),
                store.clone(),
                fast_execution(),
                dry_run,
            ),
            tracker,
            surface,
        )
    }

    fn fast_execution() -> ExecutionConfig {
        ExecutionConfig {
            max_step_attempts: 3,
            step_timeout_ms: 1_000,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
        }
    }

    fn base_config() -> AppConfig {
        AppConfig {
            holding: HoldingConfig::default(),
            budget: BudgetConfig::default(),
            execution: fast_execution(),
            breaker: BreakerConfig::default(),
            store: StoreConfig {
                path: "unused".into(),
            },
            logging: Default::default(),
        }
    }

    #[tokio::test]
    async fn full_cycle_executes_and_settles() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new());
        let runner = runner(&dir, surface.clone(), &base_config(), false).await;
        let date = Utc::now().date_naive();

        let intents = vec![
            TradeIntent::new("VOO", TradeSide::Buy, 10, "core"),
            TradeIntent::new("SMH", TradeSide::Buy, 5, "semis"),
        ];
        let report = runner.run(date, "test", intents).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert!(report
            .intents
            .iter()
            .all(|i| i.disposition == IntentDisposition::Executed));

        let store = runner.store.lock().await;
        assert_eq!(store.state().trades_used, 2);
        assert_eq!(store.state().positions.len(), 2);
        assert_eq!(store.state().trade_log.len(), 2);
    }

    #[tokio::test]
    async fn second_trigger_same_day_is_noop() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new());
        let runner = runner(&dir, surface, &base_config(), false).await;
        let date = Utc::now().date_naive();

        let first = runner
            .run(date, "scheduler", vec![TradeIntent::new("VOO", TradeSide::Buy, 1, "")])
            .await
            .unwrap();
        assert_eq!(first.outcome, CycleOutcome::Completed);

        let second = runner
            .run(date, "manual", vec![TradeIntent::new("VOO", TradeSide::Buy, 1, "")])
            .await
            .unwrap();
        assert_eq!(second.outcome, CycleOutcome::AlreadyRan);
        assert_eq!(second.intents[0].disposition, IntentDisposition::Skipped);
    }

    #[tokio::test]
    async fn budget_enforced_near_ceiling() {
        let dir = TempDir::new().unwrap();
        // Platform count mirrors the pre-set local counter.
        let surface = Arc::new(SimulatedSurface::new().with_transaction_count(78));
        let runner = runner(&dir, surface, &base_config(), false).await;
        let date = Utc::now().date_naive();

        {
            let mut store = runner.store.lock().await;
            store.state_mut().trades_used = 78;
        }

        // Three exits planned with 2 budget remaining: third is rejected.
        let intents = vec![
            TradeIntent::new("AAA", TradeSide::Buy, 1, ""),
            TradeIntent::new("BBB", TradeSide::Buy, 1, ""),
            TradeIntent::new("CCC", TradeSide::Buy, 1, ""),
        ];
        let report = runner.run(date, "test", intents).await.unwrap();

        // 78 is past the soft buy ceiling of 70, so all buys are rejected.
        assert!(report
            .intents
            .iter()
            .all(|i| i.disposition == IntentDisposition::RejectedBudget));
        let store = runner.store.lock().await;
        assert_eq!(store.state().trades_used, 78);
    }

    #[tokio::test]
    async fn hard_ceiling_stops_at_limit() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new().with_transaction_count(78));
        let mut cfg = base_config();
        // Lift the soft ceiling so only the hard ceiling binds.
        cfg.budget.hard_stop_trades = 80;
        let runner = runner(&dir, surface, &cfg, false).await;
        let date = Utc::now().date_naive();

        {
            let mut store = runner.store.lock().await;
            store.state_mut().trades_used = 78;
        }

        // Three buys with two trades of budget left: 78 → 80, never 81.
        let intents = vec![
            TradeIntent::new("AAA", TradeSide::Buy, 1, ""),
            TradeIntent::new("BBB", TradeSide::Buy, 1, ""),
            TradeIntent::new("CCC", TradeSide::Buy, 1, ""),
        ];
        let report = runner.run(date, "test", intents).await.unwrap();

        assert_eq!(report.intents[0].disposition, IntentDisposition::Executed);
        assert_eq!(report.intents[1].disposition, IntentDisposition::Executed);
        assert_eq!(report.intents[2].disposition, IntentDisposition::RejectedBudget);
        let store = runner.store.lock().await;
        assert_eq!(store.state().trades_used, 80);
    }

    #[tokio::test]
    async fn divergence_halts_cycle_before_any_dispatch() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new().with_transaction_count(5));
        let runner = runner(&dir, surface, &base_config(), false).await;
        let date = Utc::now().date_naive();

        let report = runner
            .run(date, "test", vec![TradeIntent::new("VOO", TradeSide::Buy, 1, "")])
            .await
            .unwrap();

        assert_eq!(report.outcome, CycleOutcome::HaltedDivergence);
        let store = runner.store.lock().await;
        assert!(store.state().divergence.is_some());
        assert_eq!(store.state().trades_used, 0);
    }

    #[tokio::test]
    async fn verification_mismatch_halts_without_double_count() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new());
        surface.ack_next_submit_without_count();
        let runner = runner(&dir, surface, &base_config(), false).await;
        let date = Utc::now().date_naive();

        let intents = vec![
            TradeIntent::new("VOO", TradeSide::Buy, 10, ""),
            TradeIntent::new("SMH", TradeSide::Buy, 5, ""),
        ];
        let report = runner.run(date, "test", intents).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::HaltedVerification);
        assert_eq!(report.intents[0].disposition, IntentDisposition::Failed);
        assert_eq!(report.intents[1].disposition, IntentDisposition::Skipped);

        // Budget counter untouched: never incremented speculatively.
        let store = runner.store.lock().await;
        assert_eq!(store.state().trades_used, 0);
    }

    #[tokio::test]
    async fn dry_run_previews_without_submitting() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new());
        let runner = runner(&dir, surface.clone(), &base_config(), true).await;
        let date = Utc::now().date_naive();

        let report = runner
            .run(date, "test", vec![TradeIntent::new("VOO", TradeSide::Buy, 10, "")])
            .await
            .unwrap();

        assert_eq!(report.intents[0].disposition, IntentDisposition::Previewed);
        assert_eq!(surface.read_transaction_count().await.unwrap(), 0);
        let store = runner.store.lock().await;
        assert_eq!(store.state().trades_used, 0);
    }

    #[tokio::test]
    async fn dry_run_leftover_resumed_by_live_cycle_places_nothing() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new());
        let runner = runner(&dir, surface.clone(), &base_config(), false).await;
        let date = Utc::now().date_naive();

        // A rehearsal crashed mid-form yesterday and left its record behind.
        {
            let mut record =
                ExecutionRecord::new(TradeIntent::new("VOO", TradeSide::Buy, 10, "rehearsal"));
            record.state = TradeState::FormFilled;
            record.dry_run = true;
            let mut store = runner.store.lock().await;
            store
                .state_mut()
                .executions
                .insert(record.run_id.clone(), record);
            store.persist().await.unwrap();
        }

        let report = runner.run(date, "test", vec![]).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.resumed, 1);
        // The rehearsal stayed a rehearsal: no order hit the platform.
        assert_eq!(surface.read_transaction_count().await.unwrap(), 0);
        let store = runner.store.lock().await;
        assert_eq!(store.state().trades_used, 0);
        assert_eq!(store.state().breaker.consecutive_failures, 0);
        assert!(store.state().executions.is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_open_breaker_and_halt() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new());
        // Each intent exhausts its 3 form attempts; 3 failed intents trip the breaker.
        surface.fail_next_forms(9);
        let runner = runner(&dir, surface, &base_config(), false).await;
        let date = Utc::now().date_naive();

        let intents = vec![
            TradeIntent::new("AAA", TradeSide::Buy, 1, ""),
            TradeIntent::new("BBB", TradeSide::Buy, 1, ""),
            TradeIntent::new("CCC", TradeSide::Buy, 1, ""),
            TradeIntent::new("DDD", TradeSide::Buy, 1, ""),
        ];
        let report = runner.run(date, "test", intents).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::HaltedBreakerOpen);
        assert_eq!(report.intents[2].disposition, IntentDisposition::Failed);
        assert_eq!(report.intents[3].disposition, IntentDisposition::Skipped);

        let store = runner.store.lock().await;
        assert_eq!(store.state().breaker.consecutive_failures, 3);
        assert!(store.state().breaker.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn abort_between_intents() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new());
        let runner = runner(&dir, surface, &base_config(), false).await;
        let date = Utc::now().date_naive();

        // Abort before the cycle starts: the first intent is never dispatched.
        runner.abort_handle().store(true, Ordering::SeqCst);
        let report = runner
            .run(date, "test", vec![TradeIntent::new("VOO", TradeSide::Buy, 1, "")])
            .await
            .unwrap();

        assert_eq!(report.outcome, CycleOutcome::AbortedExternally);
        assert_eq!(report.intents[0].disposition, IntentDisposition::Skipped);
    }

    #[tokio::test]
    async fn duplicate_intent_skipped() {
        let dir = TempDir::new().unwrap();
        let surface = Arc::new(SimulatedSurface::new());
        let runner = runner(&dir, surface, &base_config(), false).await;
        let date = Utc::now().date_naive();

        let intents = vec![
            TradeIntent::new("VOO", TradeSide::Buy, 10, ""),
            TradeIntent::new("VOO", TradeSide::Buy, 10, ""),
        ];
        let report = runner.run(date, "test", intents).await.unwrap();

        assert_eq!(report.intents[0].disposition, IntentDisposition::Executed);
        assert_eq!(
            report.intents[1].disposition,
            IntentDisposition::SkippedDuplicate
        );
        let store = runner.store.lock().await;
        assert_eq!(store.state().trades_used, 1);
    }
}
