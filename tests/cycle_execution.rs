//! End-to-end cycle tests against the simulated brokerage.
//!
//! Everything here goes through the public API the binary uses: open the
//! store, wire a runner, execute a plan, then reload the state document from
//! disk and check what survived.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use stockpilot::brokerage::{BrokerageSurface, SimulatedSurface};
use stockpilot::config::{
    AppConfig, BreakerConfig, BudgetConfig, ExecutionConfig, HoldingConfig, StoreConfig,
};
use stockpilot::coordination::{ExecutionCircuitBreaker, ExecutionGuard};
use stockpilot::domain::{Lot, Position, TradeIntent, TradeSide};
use stockpilot::execution::{
    CycleOutcome, CycleRunner, ExecutionPipeline, ExecutionRecord, IntentDisposition, TradeState,
};
use stockpilot::persistence::{SharedStore, StateStore};
use stockpilot::portfolio::LotTracker;

fn test_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        holding: HoldingConfig::default(),
        budget: BudgetConfig::default(),
        execution: ExecutionConfig {
            max_step_attempts: 3,
            step_timeout_ms: 2_000,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
        },
        breaker: BreakerConfig::default(),
        store: StoreConfig {
            path: dir.path().join("bot_state.json"),
        },
        logging: Default::default(),
    }
}

fn build_runner(
    cfg: &AppConfig,
    store: SharedStore,
    surface: Arc<SimulatedSurface>,
    dry_run: bool,
) -> CycleRunner {
    let tracker = LotTracker::new(cfg.holding.clone());
    let surface: Arc<dyn BrokerageSurface> = surface;
    CycleRunner::new(
        store.clone(),
        ExecutionGuard::new(store.clone(), cfg.budget.clone(), tracker.clone()),
        ExecutionCircuitBreaker::new(cfg.breaker.clone()),
        ExecutionPipeline::new(surface.clone(), store, cfg.execution.clone(), dry_run),
        tracker,
        surface,
    )
}

async fn open_shared(cfg: &AppConfig) -> SharedStore {
    StateStore::open(&cfg.store).await.unwrap().into_shared()
}

#[tokio::test]
async fn full_cycle_survives_a_reload() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let store = open_shared(&cfg).await;
    let surface = Arc::new(SimulatedSurface::new());
    let runner = build_runner(&cfg, store, surface, false);
    let date = Utc::now().date_naive();

    let report = runner
        .run(
            date,
            "integration",
            vec![
                TradeIntent::new("VOO", TradeSide::Buy, 10, "core index"),
                TradeIntent::new("SMH", TradeSide::Buy, 4, "semis"),
            ],
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, CycleOutcome::Completed);

    // Everything that matters must be on disk, not just in memory.
    let reloaded = StateStore::open(&cfg.store).await.unwrap();
    let state = reloaded.state();
    assert_eq!(state.trades_used, 2);
    assert_eq!(state.trade_log.len(), 2);
    assert_eq!(state.positions.get("VOO").unwrap().lot_total(), 10);
    assert_eq!(state.positions.get("SMH").unwrap().lot_total(), 4);
    assert!(state.committed_marker(date));
    assert_eq!(state.execution_history.len(), 2);
    assert!(state.executions.is_empty());
}

#[tokio::test]
async fn interrupted_submission_is_recovered_not_resubmitted() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let store = open_shared(&cfg).await;

    // A previous process died right after submit: the record sits in
    // SUBMITTED with a pre-count of 0, and the platform shows 1 transaction.
    let interrupted = {
        let mut record = ExecutionRecord::new(TradeIntent::new("VOO", TradeSide::Buy, 10, ""));
        record.state = TradeState::Submitted;
        record.pre_submit_tx_count = Some(0);
        record.submit_ack = true;
        record
    };
    {
        let mut guard = store.lock().await;
        guard
            .state_mut()
            .executions
            .insert(interrupted.run_id.clone(), interrupted);
        guard.persist().await.unwrap();
    }

    let surface = Arc::new(SimulatedSurface::new().with_transaction_count(1));
    let runner = build_runner(&cfg, store, surface.clone(), false);

    let report = runner
        .run(Utc::now().date_naive(), "integration", vec![])
        .await
        .unwrap();

    assert_eq!(report.resumed, 1);
    assert_eq!(report.outcome, CycleOutcome::Completed);
    // Recovery verified and settled the trade without calling submit again.
    assert_eq!(surface.read_transaction_count().await.unwrap(), 1);

    let reloaded = StateStore::open(&cfg.store).await.unwrap();
    assert_eq!(reloaded.state().trades_used, 1);
    assert_eq!(reloaded.state().positions.get("VOO").unwrap().lot_total(), 10);
    assert!(reloaded.state().executions.is_empty());
}

#[tokio::test]
async fn budget_stops_exactly_at_the_ceiling() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let store = open_shared(&cfg).await;

    // 78 of 80 trades used, three exits planned: only two may run.
    {
        let mut guard = store.lock().await;
        let state = guard.state_mut();
        state.trades_used = 78;
        let old = Utc::now() - Duration::days(5);
        for ticker in ["AAA", "BBB", "CCC"] {
            state.positions.insert(
                ticker.to_string(),
                Position {
                    ticker: ticker.to_string(),
                    shares: 10,
                    lots: vec![Lot::real(ticker, 10, old, None)],
                    entry_price: None,
                    entry_timestamp: old,
                    last_buy_timestamp: old,
                },
            );
        }
        guard.persist().await.unwrap();
    }

    let surface = Arc::new(SimulatedSurface::new().with_transaction_count(78));
    let runner = build_runner(&cfg, store, surface, false);

    let report = runner
        .run(
            Utc::now().date_naive(),
            "integration",
            vec![
                TradeIntent::new("AAA", TradeSide::Sell, 10, "exit"),
                TradeIntent::new("BBB", TradeSide::Sell, 10, "exit"),
                TradeIntent::new("CCC", TradeSide::Sell, 10, "exit"),
            ],
        )
        .await
        .unwrap();

    assert_eq!(report.intents[0].disposition, IntentDisposition::Executed);
    assert_eq!(report.intents[1].disposition, IntentDisposition::Executed);
    assert_eq!(report.intents[2].disposition, IntentDisposition::RejectedBudget);

    let reloaded = StateStore::open(&cfg.store).await.unwrap();
    assert_eq!(reloaded.state().trades_used, 80);
    // The rejected exit's position is untouched.
    assert_eq!(reloaded.state().positions.get("CCC").unwrap().shares, 10);
}

#[tokio::test]
async fn holding_period_blocks_young_lots_in_a_real_cycle() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let store = open_shared(&cfg).await;

    {
        let mut guard = store.lock().await;
        let state = guard.state_mut();
        let old = Utc::now() - Duration::days(2);
        let young = Utc::now() - Duration::hours(3);
        state.positions.insert(
            "SMH".to_string(),
            Position {
                ticker: "SMH".to_string(),
                shares: 150,
                lots: vec![
                    Lot::real("SMH", 100, old, None),
                    Lot::real("SMH", 50, young, None),
                ],
                entry_price: None,
                entry_timestamp: old,
                last_buy_timestamp: young,
            },
        );
        guard.persist().await.unwrap();
    }

    let surface = Arc::new(SimulatedSurface::new());
    let runner = build_runner(&cfg, store, surface, false);

    // Selling 150 exceeds the 100 eligible shares: rejected whole.
    let report = runner
        .run(
            Utc::now().date_naive(),
            "integration",
            vec![TradeIntent::new("SMH", TradeSide::Sell, 150, "overreach")],
        )
        .await
        .unwrap();

    assert_eq!(report.intents[0].disposition, IntentDisposition::RejectedHolding);
    let reloaded = StateStore::open(&cfg.store).await.unwrap();
    assert_eq!(reloaded.state().positions.get("SMH").unwrap().shares, 150);
    assert_eq!(reloaded.state().trades_used, 0);
}

#[tokio::test]
async fn breaker_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let date = Utc::now().date_naive();

    // First process: every intent fails until the breaker opens.
    {
        let store = open_shared(&cfg).await;
        let surface = Arc::new(SimulatedSurface::new());
        surface.fail_next_forms(9);
        let runner = build_runner(&cfg, store, surface, false);
        let report = runner
            .run(
                date,
                "integration",
                vec![
                    TradeIntent::new("AAA", TradeSide::Buy, 1, ""),
                    TradeIntent::new("BBB", TradeSide::Buy, 1, ""),
                    TradeIntent::new("CCC", TradeSide::Buy, 1, ""),
                    TradeIntent::new("DDD", TradeSide::Buy, 1, ""),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::HaltedBreakerOpen);
    }

    // Second process the next day: the open breaker still blocks.
    {
        let store = open_shared(&cfg).await;
        let surface = Arc::new(SimulatedSurface::new());
        let runner = build_runner(&cfg, store, surface, false);
        let report = runner
            .run(
                date.succ_opt().unwrap(),
                "integration",
                vec![TradeIntent::new("EEE", TradeSide::Buy, 1, "")],
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::HaltedBreakerOpen);
        assert_eq!(report.intents[0].disposition, IntentDisposition::Skipped);
    }
}

#[tokio::test]
async fn dry_run_leaves_no_trace_on_the_platform() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let store = open_shared(&cfg).await;
    let surface = Arc::new(SimulatedSurface::new());
    let runner = build_runner(&cfg, store, surface.clone(), true);

    let report = runner
        .run(
            Utc::now().date_naive(),
            "integration",
            vec![TradeIntent::new("VOO", TradeSide::Buy, 10, "rehearsal")],
        )
        .await
        .unwrap();

    assert_eq!(report.intents[0].disposition, IntentDisposition::Previewed);
    assert_eq!(surface.read_transaction_count().await.unwrap(), 0);
    assert!(surface.read_positions().await.unwrap().is_empty());

    let reloaded = StateStore::open(&cfg.store).await.unwrap();
    assert_eq!(reloaded.state().trades_used, 0);
    assert!(reloaded.state().trade_log.is_empty());
}
