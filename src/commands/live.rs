//! Live CLI command implementation

use super::{build_agent, save_model};
use crate::FileConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, ContentArrangement, Table};
use qtrader_backtest::{SimulatedExchange, TapeLoader};
use qtrader_core::{
    Account, ExecutionObserver, FeedError, FeedEvent, MarketFeed, Symbol, TradingMode,
};
use qtrader_data::{FeedSupervisor, TapeFeed};
use qtrader_execution::{ExecutionEngine, LiveRunner, SymbolStatus, TrainingSchedule};
use qtrader_observability::{HealthServer, PrometheusObserver, TradeJournal};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Args)]
pub struct LiveArgs {
    /// Trading mode; overrides the configured one
    #[arg(long)]
    pub mode: Option<ModeArg>,

    /// Tick tape replayed as the feed in demo mode
    #[arg(long)]
    pub tape: Option<PathBuf>,

    /// Delay between replayed ticks in demo mode
    #[arg(long, default_value_t = 250)]
    pub pace_ms: u64,

    /// Virtual balance in demo mode
    #[arg(long, default_value = "10000")]
    pub capital: Decimal,

    /// Serve /metrics and /health on this port; overrides the configured address
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Milliseconds between background training steps; 0 disables training
    #[arg(long, default_value_t = 1000)]
    pub train_interval_ms: u64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long)]
    pub load_model: Option<PathBuf>,

    #[arg(long)]
    pub save_model: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Demo,
    Paper,
    Live,
}

impl From<ModeArg> for TradingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Demo => TradingMode::Demo,
            ModeArg::Paper => TradingMode::Paper,
            ModeArg::Live => TradingMode::Live,
        }
    }
}

/// Moves the simulated exchange's prices and clock along with the feed
struct PricingFeed<F> {
    inner: F,
    exchange: Arc<SimulatedExchange>,
}

#[async_trait]
impl<F: MarketFeed> MarketFeed for PricingFeed<F> {
    async fn connect(&mut self, symbols: &[Symbol]) -> Result<(), FeedError> {
        self.inner.connect(symbols).await
    }

    async fn next_event(&mut self) -> Result<FeedEvent, FeedError> {
        let event = self.inner.next_event().await?;
        if let FeedEvent::Tick(tick) = &event {
            self.exchange.update_price(&tick.symbol, tick.price).await;
            self.exchange.set_current_time(tick.timestamp).await;
        }
        Ok(event)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

pub async fn run(args: LiveArgs, config: FileConfig) -> Result<()> {
    let FileConfig {
        mut app,
        backtest,
    } = config;
    if let Some(mode) = args.mode {
        app.mode = mode.into();
    }
    app.estimator.seed = args.seed;
    if let Some(port) = args.metrics_port {
        app.metrics.enabled = true;
        app.metrics.bind_address = format!("0.0.0.0:{}", port);
    }

    if app.mode != TradingMode::Demo {
        anyhow::bail!(
            "{} mode needs an exchange gateway, which this build does not include; use --mode demo",
            app.mode.as_str()
        );
    }

    let tape_path = args
        .tape
        .as_ref()
        .context("Demo mode replays a tape: pass --tape <file>")?;
    let ticks = TapeLoader::new()
        .with_symbols(&app.symbols)
        .load(tape_path)
        .with_context(|| format!("Failed to load tape: {}", tape_path.display()))?;
    if app.symbols.is_empty() {
        app.symbols = ticks
            .iter()
            .map(|t| t.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
    }
    app.validate().context("Invalid configuration")?;

    let mut observers: Vec<Arc<dyn ExecutionObserver>> = Vec::new();
    if app.metrics.enabled {
        observers.push(Arc::new(PrometheusObserver::new()));
    }
    let journal = TradeJournal::from_config(&app.journal)
        .with_context(|| format!("Failed to open journal: {}", app.journal.path))?
        .map(Arc::new);
    if let Some(journal) = &journal {
        info!(path = %journal.path().display(), session = journal.session_id(), "Journaling trades");
        observers.push(journal.clone());
    }

    let exchange = Arc::new(SimulatedExchange::new(
        args.capital,
        backtest.fees,
        backtest.slippage,
    ));
    let feed = PricingFeed {
        inner: TapeFeed::new(ticks).with_pace(Duration::from_millis(args.pace_ms)),
        exchange: Arc::clone(&exchange),
    };
    let supervisor = FeedSupervisor::new(feed, app.symbols.clone(), app.feed.clone(), args.seed);

    let mut engine = ExecutionEngine::new(
        Arc::clone(&exchange),
        &app.symbols,
        &app,
        Account::new(args.capital),
    )
    .with_seed(args.seed);
    for observer in &observers {
        engine = engine.with_observer(Arc::clone(observer));
    }

    let (agent, estimator) = build_agent(
        &app,
        args.capital,
        args.seed,
        args.load_model.as_deref(),
        &observers,
    )?;

    let mut runner = LiveRunner::new(
        engine,
        supervisor,
        agent,
        app.mode,
        Duration::from_secs(app.execution.balance_poll_secs.max(1)),
    );
    if args.train_interval_ms > 0 {
        runner = runner.with_training(TrainingSchedule {
            interval: Duration::from_millis(args.train_interval_ms),
            seed: args.seed,
        });
    }
    for observer in &observers {
        runner = runner.with_observer(Arc::clone(observer));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install ctrl+c handler");
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let server = app.metrics.enabled.then(|| {
        HealthServer::new(&app.metrics, runner.status_handle(), shutdown_rx.clone()).spawn()
    });

    info!(
        mode = app.mode.as_str(),
        symbols = ?app.symbols,
        capital = %args.capital,
        "Starting live session"
    );
    let outcome = runner.run(shutdown_rx).await;

    if let Some(server) = server {
        server.abort();
    }
    if let Some(path) = &args.save_model {
        save_model(&estimator, path)?;
    }

    match outcome {
        Ok(statuses) => {
            print_statuses(&statuses);
            info!(balance = %exchange.balance().await, "Live session finished");
            Ok(())
        }
        Err(e) => {
            if let Some(journal) = &journal {
                journal.log_error(&e.to_string());
            }
            warn!(error = %e, "Live session ended with an error");
            Err(e).context("Live session failed")
        }
    }
}

fn print_statuses(statuses: &[SymbolStatus]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            ["Symbol", "State", "Halted", "Last Price"]
                .iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
    for status in statuses {
        table.add_row(vec![
            Cell::new(&status.symbol),
            Cell::new(status.state),
            Cell::new(if status.halted { "yes" } else { "no" }),
            Cell::new(
                status
                    .last_price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!("{table}");
}
