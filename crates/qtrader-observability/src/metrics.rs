//! Prometheus metrics for qtrader

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::{
    Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use qtrader_core::{
    Account, ActionId, ExecutionObserver, FeedGap, OrderRequest, Position, RiskEvent,
    RiskEventKind, TradeAction, TradeRecord,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Execution metrics
    pub static ref ORDERS_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_orders_total", "Orders by outcome"),
        &["symbol", "side", "status"]
    ).unwrap();

    pub static ref GATEWAY_RETRIES: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_gateway_retries_total", "Gateway call retries"),
        &["operation"]
    ).unwrap();

    pub static ref RECONCILIATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_reconciliations_total", "Position reconciliations by resulting state"),
        &["state"]
    ).unwrap();

    pub static ref ACTIONS_SUPPRESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_actions_suppressed_total", "Policy actions the engine did not act on"),
        &["reason"]
    ).unwrap();

    pub static ref POSITIONS_OPENED: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_positions_opened_total", "Positions opened"),
        &["symbol", "side"]
    ).unwrap();

    pub static ref POSITIONS_CLOSED: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_positions_closed_total", "Position closes, partial ones included"),
        &["symbol", "reason", "outcome"]
    ).unwrap();

    pub static ref STUCK_POSITIONS: GaugeVec = GaugeVec::new(
        Opts::new("qtrader_position_stuck", "1 while a symbol awaits reconciliation"),
        &["symbol"]
    ).unwrap();

    // Risk and account metrics
    pub static ref RISK_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_risk_events_total", "Risk events"),
        &["kind"]
    ).unwrap();

    pub static ref REALIZED_PNL: Gauge = Gauge::new(
        "qtrader_realized_pnl",
        "Realized PnL after fees since start"
    ).unwrap();

    pub static ref EQUITY: Gauge = Gauge::new(
        "qtrader_equity",
        "Account equity at the last poll"
    ).unwrap();

    pub static ref BALANCE: Gauge = Gauge::new(
        "qtrader_balance",
        "Account balance at the last poll"
    ).unwrap();

    // Feed metrics
    pub static ref FEED_GAPS: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_feed_gaps_total", "Feed silences beyond the gap threshold"),
        &["symbol"]
    ).unwrap();

    pub static ref FEED_CONNECTED: IntGauge = IntGauge::new(
        "qtrader_feed_connected",
        "Feed connection status (1=connected, 0=disconnected)"
    ).unwrap();

    pub static ref FEED_RECONNECTS: IntGauge = IntGauge::new(
        "qtrader_feed_reconnects",
        "Feed reconnects since start"
    ).unwrap();

    // Learning metrics
    pub static ref DECISIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("qtrader_decisions_total", "Policy decisions"),
        &["action", "explored"]
    ).unwrap();

    pub static ref TRAIN_STEPS: IntCounter = IntCounter::new(
        "qtrader_train_steps_total",
        "Completed training steps"
    ).unwrap();

    pub static ref TRAIN_LOSS: Gauge = Gauge::new(
        "qtrader_train_loss",
        "Loss of the last training step"
    ).unwrap();

    pub static ref EXPLORATION_RATE: Gauge = Gauge::new(
        "qtrader_exploration_rate",
        "Current exploration rate"
    ).unwrap();
}

static REGISTER: Once = Once::new();

/// Register all metrics with the registry; later calls are no-ops
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY.register(Box::new(ORDERS_SUBMITTED.clone())).ok();
        REGISTRY.register(Box::new(GATEWAY_RETRIES.clone())).ok();
        REGISTRY.register(Box::new(RECONCILIATIONS.clone())).ok();
        REGISTRY.register(Box::new(ACTIONS_SUPPRESSED.clone())).ok();
        REGISTRY.register(Box::new(POSITIONS_OPENED.clone())).ok();
        REGISTRY.register(Box::new(POSITIONS_CLOSED.clone())).ok();
        REGISTRY.register(Box::new(STUCK_POSITIONS.clone())).ok();

        REGISTRY.register(Box::new(RISK_EVENTS.clone())).ok();
        REGISTRY.register(Box::new(REALIZED_PNL.clone())).ok();
        REGISTRY.register(Box::new(EQUITY.clone())).ok();
        REGISTRY.register(Box::new(BALANCE.clone())).ok();

        REGISTRY.register(Box::new(FEED_GAPS.clone())).ok();
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())).ok();
        REGISTRY.register(Box::new(FEED_RECONNECTS.clone())).ok();

        REGISTRY.register(Box::new(DECISIONS.clone())).ok();
        REGISTRY.register(Box::new(TRAIN_STEPS.clone())).ok();
        REGISTRY.register(Box::new(TRAIN_LOSS.clone())).ok();
        REGISTRY.register(Box::new(EXPLORATION_RATE.clone())).ok();
    });
}

/// Get metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

fn as_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

// Helper functions for recording metrics

pub fn record_order(symbol: &str, side: &str, status: &str) {
    ORDERS_SUBMITTED
        .with_label_values(&[symbol, side, status])
        .inc();
}

pub fn record_gateway_retry(operation: &str) {
    GATEWAY_RETRIES.with_label_values(&[operation]).inc();
}

/// Record a reconciliation and clear the stuck flag once it resolves
pub fn record_reconciliation(symbol: &str, state: &str) {
    RECONCILIATIONS.with_label_values(&[state]).inc();
    let stuck = if state == "stuck" { 1.0 } else { 0.0 };
    STUCK_POSITIONS.with_label_values(&[symbol]).set(stuck);
}

pub fn record_suppressed(reason: &str) {
    ACTIONS_SUPPRESSED.with_label_values(&[reason]).inc();
}

pub fn record_position_opened(symbol: &str, side: &str) {
    POSITIONS_OPENED.with_label_values(&[symbol, side]).inc();
}

/// Record a closed trade and add its net PnL to the running total
pub fn record_trade(trade: &TradeRecord) {
    let outcome = if trade.is_win() { "win" } else { "loss" };
    POSITIONS_CLOSED
        .with_label_values(&[trade.symbol.as_str(), trade.reason.as_str(), outcome])
        .inc();
    REALIZED_PNL.add(as_f64(trade.net_pnl()));
}

pub fn record_risk_event(event: &RiskEvent) {
    RISK_EVENTS.with_label_values(&[event.kind.as_str()]).inc();
    if event.kind == RiskEventKind::PositionStuck {
        STUCK_POSITIONS
            .with_label_values(&[event.symbol.as_str()])
            .set(1.0);
    }
}

pub fn update_account(account: &Account) {
    EQUITY.set(as_f64(account.equity));
    BALANCE.set(as_f64(account.balance));
}

/// Record a gap; `None` means the whole feed went silent
pub fn record_feed_gap(symbol: Option<&str>) {
    FEED_GAPS.with_label_values(&[symbol.unwrap_or("all")]).inc();
}

pub fn update_feed_status(connected: bool, reconnects: u64) {
    FEED_CONNECTED.set(if connected { 1 } else { 0 });
    FEED_RECONNECTS.set(reconnects as i64);
}

pub fn record_decision(action: ActionId, explored: bool, exploration_rate: f64) {
    let action = TradeAction::from_index(action)
        .map(|a| a.as_str())
        .unwrap_or("unknown");
    let explored = if explored { "true" } else { "false" };
    DECISIONS.with_label_values(&[action, explored]).inc();
    EXPLORATION_RATE.set(exploration_rate);
}

pub fn record_train_step(loss: f64) {
    TRAIN_STEPS.inc();
    TRAIN_LOSS.set(loss);
}

/// Reports engine and runner callbacks to the prometheus registry
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusObserver;

impl PrometheusObserver {
    pub fn new() -> Self {
        register_metrics();
        Self
    }
}

impl ExecutionObserver for PrometheusObserver {
    fn on_position_opened(&self, position: &Position) {
        record_position_opened(&position.symbol, &position.side.to_string());
    }

    fn on_trade_closed(&self, trade: &TradeRecord) {
        record_trade(trade);
    }

    fn on_risk_event(&self, event: &RiskEvent) {
        record_risk_event(event);
    }

    fn on_order(&self, request: &OrderRequest, status: &str) {
        record_order(&request.symbol, &request.side.to_string(), status);
    }

    fn on_action_suppressed(&self, _symbol: &str, reason: &str) {
        record_suppressed(reason);
    }

    fn on_gateway_retry(&self, operation: &str, _attempt: u32) {
        record_gateway_retry(operation);
    }

    fn on_reconciled(&self, symbol: &str, state: &str) {
        record_reconciliation(symbol, state);
    }

    fn on_account(&self, account: &Account, _at: DateTime<Utc>) {
        update_account(account);
    }

    fn on_decision(&self, _symbol: &str, action: ActionId, explored: bool, exploration_rate: f64) {
        record_decision(action, explored, exploration_rate);
    }

    fn on_train_step(&self, _steps: u64, loss: f64) {
        record_train_step(loss);
    }

    fn on_feed_gap(&self, gap: &FeedGap) {
        record_feed_gap(gap.symbol.as_deref());
    }

    fn on_feed_status(&self, connected: bool, reconnects: u64) {
        update_feed_status(connected, reconnects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtrader_core::{ExitReason, Side};
    use rust_decimal_macros::dec;

    #[test]
    fn test_observer_reports_to_registry() {
        let observer = PrometheusObserver::new();
        let now = Utc::now();

        observer.on_trade_closed(&TradeRecord {
            symbol: "METRICSUSDT".to_string(),
            side: Side::Short,
            entry_price: dec!(10),
            exit_price: dec!(9),
            size: dec!(1),
            pnl: dec!(1),
            fees: dec!(0.1),
            reason: ExitReason::TakeProfit,
            opened_at: now,
            closed_at: now,
        });
        observer.on_risk_event(&RiskEvent::new(
            "METRICSUSDT",
            RiskEventKind::PositionStuck,
            "retries exhausted",
            now,
        ));

        assert_eq!(
            POSITIONS_CLOSED
                .with_label_values(&["METRICSUSDT", "take_profit", "win"])
                .get(),
            1
        );
        assert_eq!(
            STUCK_POSITIONS.with_label_values(&["METRICSUSDT"]).get(),
            1.0
        );

        observer.on_reconciled("METRICSUSDT", "flat");
        assert_eq!(
            STUCK_POSITIONS.with_label_values(&["METRICSUSDT"]).get(),
            0.0
        );

        let text = gather_metrics();
        assert!(text.contains("qtrader_positions_closed_total"));
        assert!(text.contains("qtrader_risk_events_total"));
    }

    #[test]
    fn test_unknown_action_label() {
        register_metrics();
        record_decision(99, true, 0.5);
        assert_eq!(DECISIONS.with_label_values(&["unknown", "true"]).get(), 1);
        assert_eq!(EXPLORATION_RATE.get(), 0.5);
    }
}
