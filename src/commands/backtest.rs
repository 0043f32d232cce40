//! Backtest CLI command implementation

use super::{build_agent, save_model};
use crate::FileConfig;
use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use qtrader_backtest::{BacktestResults, BacktestRunner, TapeLoader};
use qtrader_core::ExecutionObserver;
use qtrader_observability::TradeJournal;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Args)]
pub struct BacktestArgs {
    /// Tick tape, JSON lines or CSV (timestamp,symbol,price,volume)
    #[arg(long)]
    pub tape: PathBuf,

    /// Seed for exploration, replay sampling and weight initialisation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Passes over the tape, learning carries across them
    #[arg(long, default_value_t = 1)]
    pub episodes: usize,

    /// Starting capital
    #[arg(long)]
    pub capital: Option<Decimal>,

    /// Output format
    #[arg(long, short, default_value = "text")]
    pub output: OutputFormat,

    /// Write the trained weights here afterwards
    #[arg(long)]
    pub save_model: Option<PathBuf>,

    /// Start from previously saved weights
    #[arg(long)]
    pub load_model: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

pub async fn run(args: BacktestArgs, config: FileConfig) -> Result<()> {
    let FileConfig {
        mut app,
        mut backtest,
    } = config;
    if let Some(seed) = args.seed {
        backtest.seed = seed;
        app.estimator.seed = seed;
    }
    if let Some(capital) = args.capital {
        backtest.initial_capital = capital;
    }
    if backtest.symbols.is_empty() {
        backtest.symbols = app.symbols.clone();
    }
    if args.episodes == 0 {
        anyhow::bail!("--episodes must be at least 1");
    }

    let tape = TapeLoader::new()
        .with_symbols(&backtest.symbols)
        .load(&args.tape)
        .with_context(|| format!("Failed to load tape: {}", args.tape.display()))?;

    let mut observers: Vec<Arc<dyn ExecutionObserver>> = Vec::new();
    let journal = TradeJournal::from_config(&app.journal)
        .with_context(|| format!("Failed to open journal: {}", app.journal.path))?
        .map(Arc::new);
    if let Some(journal) = &journal {
        observers.push(journal.clone());
    }

    app.symbols = if backtest.symbols.is_empty() {
        tape.iter()
            .map(|t| t.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        backtest.symbols.clone()
    };
    app.validate().context("Invalid configuration")?;

    let mut runner = BacktestRunner::new(backtest.clone(), app.clone());
    for observer in &observers {
        runner = runner.with_observer(Arc::clone(observer));
    }

    info!(
        tape = %args.tape.display(),
        ticks = tape.len(),
        symbols = ?app.symbols,
        episodes = args.episodes,
        seed = backtest.seed,
        "Starting backtest"
    );

    let (mut agent, estimator) = build_agent(
        &app,
        backtest.initial_capital,
        backtest.seed,
        args.load_model.as_deref(),
        &[],
    )?;

    let results = match runner.run(&tape, &mut agent, args.episodes).await {
        Ok(results) => results,
        Err(e) => {
            if let Some(journal) = &journal {
                journal.log_error(&e.to_string());
            }
            return Err(e).context("Backtest failed");
        }
    };

    if let Some(path) = &args.save_model {
        save_model(&estimator, path)?;
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Csv => {
            if let Some(last) = results.last() {
                print!("{}", last.trades_to_csv());
            }
        }
        OutputFormat::Text => print_results_text(&results),
    }

    Ok(())
}

fn pnl_cell(value: Decimal) -> Cell {
    let color = if value >= Decimal::ZERO {
        Color::Green
    } else {
        Color::Red
    };
    Cell::new(format!("{:.2}", value)).fg(color)
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| Cell::new(n).add_attribute(Attribute::Bold))
        .collect()
}

fn print_results_text(results: &[BacktestResults]) {
    let Some(last) = results.last() else {
        return;
    };

    println!();
    println!(
        "Backtest: {} ticks, seed {}, {} to {}",
        last.ticks,
        last.seed,
        last.start_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string()),
        last.end_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header(&[
            "Episode", "Trades", "Win%", "Net P&L", "ROI%", "Sharpe", "Sortino", "Max DD%",
            "Profit Factor", "Fees", "Final Equity", "Train Steps",
        ]));
    for r in results {
        let report = &r.report;
        table.add_row(vec![
            Cell::new(r.episode),
            Cell::new(report.trades),
            Cell::new(format!("{:.1}", report.win_rate * Decimal::ONE_HUNDRED)),
            pnl_cell(report.pnl),
            Cell::new(format!("{:.2}", report.roi * Decimal::ONE_HUNDRED)),
            Cell::new(format!("{:.2}", report.sharpe)),
            Cell::new(format!("{:.2}", report.sortino)),
            Cell::new(format!("{:.2}", report.max_drawdown * Decimal::ONE_HUNDRED)),
            Cell::new(format!("{:.2}", report.profit_factor)),
            Cell::new(format!("{:.2}", report.fees)),
            Cell::new(format!("{:.2}", r.final_equity)),
            Cell::new(r.train_steps),
        ]);
    }
    println!("{table}");

    if !last.symbol_breakdown.is_empty() {
        let mut breakdown = Table::new();
        breakdown
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(header(&["Symbol", "Trades", "Wins", "Net P&L", "Fees"]));
        for (symbol, perf) in &last.symbol_breakdown {
            breakdown.add_row(vec![
                Cell::new(symbol),
                Cell::new(perf.trades),
                Cell::new(perf.wins),
                pnl_cell(perf.pnl),
                Cell::new(format!("{:.2}", perf.fees)),
            ]);
        }
        println!();
        println!("Last episode by symbol");
        println!("{breakdown}");
    }
    println!();
}
