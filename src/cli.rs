//! Command-line interface
//!
//! Thin operational surface over the core: run a cycle, inspect state,
//! report the budget, list lots, reconcile a divergence.

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::coordination::ExecutionCircuitBreaker;
use crate::execution::{CycleReport, IntentDisposition};
use crate::persistence::StateStore;
use crate::portfolio::LotTracker;

#[derive(Parser)]
#[command(name = "stockpilot")]
#[command(version = "0.1.0")]
#[command(about = "Trade execution control plane for a brokerage competition portfolio", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute the daily trade cycle from a plan file
    Run {
        /// Path to the JSON plan file
        #[arg(short, long, default_value = "plan.json")]
        plan: String,
        /// Logical trading date (defaults to today, UTC)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Stop each trade after preview, submit nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show bot state: budget, breaker, divergence, positions
    Status,
    /// Show the trade budget counters
    Budget,
    /// List lots and their sell eligibility
    Lots {
        /// Restrict to one ticker
        ticker: Option<String>,
    },
    /// Adopt the brokerage's transaction count and clear a divergence block
    Reconcile {
        /// Transaction count as reported by the brokerage
        count: u64,
    },
}

/// Print a state summary.
pub fn print_status(store: &StateStore, cfg: &AppConfig) {
    let state = store.state();
    let breaker = ExecutionCircuitBreaker::new(cfg.breaker.clone());
    let now = Utc::now();

    println!("State updated:   {}", state.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
    println!(
        "Trades used:     {}/{} ({} remaining)",
        state.trades_used,
        cfg.budget.max_trades,
        state.trades_remaining(cfg.budget.max_trades)
    );
    println!("Positions:       {}", state.positions.len());
    println!("Breaker:         {}", breaker.state(&state.breaker, now));
    println!(
        "Ran today:       {}",
        if state.committed_marker(now.date_naive()) { "yes" } else { "no" }
    );
    if let Some(div) = &state.divergence {
        println!(
            "DIVERGENCE:      local {} vs brokerage {} (since {}) — run `reconcile`",
            div.local_trades,
            div.external_count,
            div.detected_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    if state.hold_mode_inconsistent {
        println!("WARNING:         hold mode inconsistent with lot distribution");
    }
    if let Some(err) = &state.last_error {
        println!(
            "Last error:      {} ({})",
            err.message,
            err.timestamp.format("%Y-%m-%d %H:%M UTC")
        );
    }
}

/// Print the budget counters.
pub fn print_budget(store: &StateStore, cfg: &AppConfig) {
    let state = store.state();
    println!("Used:          {}", state.trades_used);
    println!("Hard ceiling:  {} (all trades blocked at this count)", cfg.budget.max_trades);
    println!("Soft ceiling:  {} (new buys blocked at this count)", cfg.budget.hard_stop_trades);
    println!("Remaining:     {}", state.trades_remaining(cfg.budget.max_trades));
    if state.trades_used >= cfg.budget.hard_stop_trades {
        println!("NOTE: past the soft ceiling, exits only");
    }
}

/// Print lots and their eligibility, optionally filtered by ticker.
pub fn print_lots(store: &StateStore, cfg: &AppConfig, ticker: Option<&str>) {
    let state = store.state();
    let tracker = LotTracker::new(cfg.holding.clone());
    let now = Utc::now();

    let mut shown = 0;
    for (symbol, position) in &state.positions {
        if let Some(filter) = ticker {
            if !symbol.eq_ignore_ascii_case(filter) {
                continue;
            }
        }
        shown += 1;
        let eligible = tracker.eligible_sell_quantity(state, symbol, now);
        println!("{symbol}: {} shares, {} sellable now", position.shares, eligible);
        for lot in &position.lots {
            println!(
                "  lot {} qty {:>6} bought {} [{}]",
                lot.lot_id,
                lot.quantity,
                lot.buy_timestamp_utc.format("%Y-%m-%d %H:%M UTC"),
                match lot.source {
                    crate::domain::LotSource::Real => "real",
                    crate::domain::LotSource::Synthetic => "synthetic",
                }
            );
        }
        if let Some(unlock) = tracker.earliest_eligible_time(state, symbol, now) {
            println!("  next unlock: {}", unlock.format("%Y-%m-%d %H:%M UTC"));
        }
    }
    if shown == 0 {
        println!("no matching positions");
    }
}

/// Print the outcome of a finished cycle.
pub fn print_cycle_report(report: &CycleReport) {
    println!("Cycle {} — {:?}", report.date, report.outcome);
    if report.resumed > 0 {
        println!("  recovered {} interrupted execution(s)", report.resumed);
    }
    for intent in &report.intents {
        let mark = match intent.disposition {
            IntentDisposition::Executed => "ok",
            IntentDisposition::Previewed => "dry",
            IntentDisposition::SkippedDuplicate => "dup",
            IntentDisposition::RejectedBudget | IntentDisposition::RejectedHolding => "rej",
            IntentDisposition::Failed => "ERR",
            IntentDisposition::Skipped => "--",
        };
        let detail = intent.error.as_deref().unwrap_or("");
        println!(
            "  [{mark}] {} {} x{} {detail}",
            intent.side, intent.ticker, intent.quantity
        );
    }
}
