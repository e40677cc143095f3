use clap::Parser;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use stockpilot::brokerage::{BrokerageSurface, SimulatedSurface};
use stockpilot::cli::{self, Cli, Commands};
use stockpilot::config::AppConfig;
use stockpilot::coordination::{ExecutionCircuitBreaker, ExecutionGuard};
use stockpilot::error::Result;
use stockpilot::execution::{CycleRunner, ExecutionPipeline};
use stockpilot::persistence::StateStore;
use stockpilot::planner::{FilePlanner, TradePlanner};
use stockpilot::portfolio::LotTracker;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    init_logging(&config);

    match cli.command {
        Commands::Run {
            plan,
            date,
            dry_run,
        } => {
            let date = date.unwrap_or_else(|| chrono::Utc::now().date_naive());
            run_cycle(&config, &plan, date, dry_run).await?;
        }
        Commands::Status => {
            let store = StateStore::open(&config.store).await?;
            cli::print_status(&store, &config);
        }
        Commands::Budget => {
            let store = StateStore::open(&config.store).await?;
            cli::print_budget(&store, &config);
        }
        Commands::Lots { ticker } => {
            let store = StateStore::open(&config.store).await?;
            cli::print_lots(&store, &config, ticker.as_deref());
        }
        Commands::Reconcile { count } => {
            let store = StateStore::open(&config.store).await?.into_shared();
            let tracker = LotTracker::new(config.holding.clone());
            let guard = ExecutionGuard::new(store, config.budget.clone(), tracker);
            guard.reconcile_trade_count(count).await?;
            println!("trade counter set to {count}, divergence cleared");
        }
    }

    Ok(())
}

async fn run_cycle(
    config: &AppConfig,
    plan_path: &str,
    date: chrono::NaiveDate,
    dry_run: bool,
) -> Result<()> {
    let store = StateStore::open(&config.store).await?;

    // The brokerage driver is injected behind the surface trait; this binary
    // ships the deterministic simulator, seeded so its transaction count
    // mirrors local state.
    let surface: Arc<dyn BrokerageSurface> = Arc::new(
        SimulatedSurface::new().with_transaction_count(u64::from(store.state().trades_used)),
    );

    let store = store.into_shared();
    let tracker = LotTracker::new(config.holding.clone());
    let runner = CycleRunner::new(
        store.clone(),
        ExecutionGuard::new(store.clone(), config.budget.clone(), tracker.clone()),
        ExecutionCircuitBreaker::new(config.breaker.clone()),
        ExecutionPipeline::new(surface.clone(), store, config.execution.clone(), dry_run),
        tracker,
        surface,
    );

    // Interrupts abort between intents, never mid-intent.
    let abort = runner.abort_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting after the current trade");
            abort.store(true, Ordering::SeqCst);
        }
    });

    let intents = FilePlanner::new(plan_path).plan().await?;
    info!(%date, intents = intents.len(), dry_run, "starting cycle");
    let report = runner.run(date, "cli", intents).await?;
    cli::print_cycle_report(&report);
    Ok(())
}

fn init_logging(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{Layer, Registry};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,stockpilot={}", config.logging.level)));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![filter.boxed()];

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if config.logging.json {
        layers.push(console_layer.json().boxed());
    } else {
        layers.push(console_layer.boxed());
    }

    // `rolling::daily` panics if it cannot create the initial file, so
    // preflight the directory before handing it over.
    if let Some(log_dir) = config.logging.log_dir.as_deref() {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = tracing_appender::rolling::daily(log_dir, "stockpilot.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Keep the guard alive for the life of the process.
            Box::leak(Box::new(guard));
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed(),
            );
        } else {
            eprintln!("Warning: could not create log directory {log_dir}, file logging disabled");
        }
    }

    tracing_subscriber::registry().with(layers).init();
}
