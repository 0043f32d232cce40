//! Execution engine
//!
//! Owns one [`SymbolMachine`] per traded symbol behind its own async mutex, so
//! operations on one symbol are strictly sequential while different symbols proceed
//! in parallel. Every event is run through the pure [`transition`] function and the
//! resulting effects are executed here, feeding gateway outcomes back in as events
//! until the machine settles.

use crate::retrying_gateway::{CallFailure, RetryingGateway};
use crate::state_machine::{
    transition, Effect, EngineEvent, GatewayFailure, SymbolMachine, SymbolStatus,
    TransitionContext,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use qtrader_core::{
    Account, ActionId, AppConfig, ExchangeGateway, ExecutionError, ExecutionObserver, FeedGap,
    OrderRequest, OrderStatus, Position, RiskEvent, RiskEventKind, Symbol, Tick,
};
use qtrader_risk::{PositionSizer, RiskBreach, RiskGuard};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct ExecutionEngine<G> {
    gateway: RetryingGateway<G>,
    /// Ordered so session-wide operations visit symbols deterministically
    machines: BTreeMap<Symbol, Mutex<SymbolMachine>>,
    account: RwLock<Account>,
    sizer: PositionSizer,
    guard: RiskGuard,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    leverage_set: SyncMutex<HashSet<Symbol>>,
}

impl<G: ExchangeGateway> ExecutionEngine<G> {
    pub fn new(gateway: G, symbols: &[Symbol], config: &AppConfig, account: Account) -> Self {
        let machines = symbols
            .iter()
            .map(|s| (s.clone(), Mutex::new(SymbolMachine::new(s.clone()))))
            .collect();

        info!(
            gateway = gateway.name(),
            symbols = ?symbols,
            balance = %account.balance,
            "Execution engine initialized"
        );

        Self {
            gateway: RetryingGateway::new(gateway, config.execution.clone()),
            machines,
            account: RwLock::new(account),
            sizer: PositionSizer::new(config.risk.clone()),
            guard: RiskGuard::new(&config.risk, &config.feed),
            observers: Vec::new(),
            leverage_set: SyncMutex::new(HashSet::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.gateway.add_observer(Arc::clone(&observer));
        self.observers.push(observer);
        self
    }

    /// Seed the retry jitter
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.gateway = self.gateway.with_seed(seed);
        self
    }

    pub fn gateway(&self) -> &G {
        self.gateway.inner()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.machines.keys()
    }

    /// Last account snapshot
    pub fn account(&self) -> Account {
        *self.account.read()
    }

    /// Apply a policy decision
    pub async fn on_action(
        &self,
        symbol: &str,
        action: ActionId,
        confidence: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<SymbolStatus, ExecutionError> {
        let event = EngineEvent::Action {
            action,
            confidence,
            price,
            at,
        };
        self.dispatch(symbol, event, at).await
    }

    /// Ratchet trailing stops and fire exits for the tick's symbol
    pub async fn on_tick(&self, tick: &Tick) -> Result<SymbolStatus, ExecutionError> {
        self.dispatch(&tick.symbol, EngineEvent::Tick(tick.clone()), tick.timestamp)
            .await
    }

    /// Surface a feed discontinuity to every affected symbol
    pub async fn on_feed_gap(&self, gap: &FeedGap) -> Vec<SymbolStatus> {
        for observer in &self.observers {
            observer.on_feed_gap(gap);
        }
        let affected: Vec<Symbol> = self
            .machines
            .keys()
            .filter(|s| gap.affects(s))
            .cloned()
            .collect();

        let mut statuses = Vec::with_capacity(affected.len());
        for symbol in affected {
            let event = EngineEvent::FeedGap(gap.clone());
            if let Ok(status) = self.dispatch(&symbol, event, gap.detected_at).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Flatten `symbol` and halt new positions on it until reset
    pub async fn on_fatal(
        &self,
        symbol: &str,
        kind: RiskEventKind,
        detail: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<SymbolStatus, ExecutionError> {
        let event = EngineEvent::Fatal {
            kind,
            detail: detail.into(),
        };
        self.dispatch(symbol, event, at).await
    }

    /// Rebuild `symbol` from the exchange's view of its position
    pub async fn reconcile(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<SymbolStatus, ExecutionError> {
        let slot = self.machine(symbol)?;
        let (status, breach) = {
            let mut machine = slot.lock().await;
            let remote = self
                .gateway
                .query_position(symbol)
                .await
                .map_err(|f| reconcile_error(f, machine.pending_request()))?;
            let breach = self
                .drive(&mut machine, EngineEvent::Reconciled(remote), at)
                .await;
            self.notify_reconciled(&machine);
            (SymbolStatus::from(&*machine), breach)
        };
        if let Some(breach) = breach {
            self.flatten_others(symbol, &breach, at).await;
        }
        Ok(status)
    }

    /// Clear the halt flag and any stuck state; the exchange side is assumed settled
    pub async fn reset_symbol(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<SymbolStatus, ExecutionError> {
        info!(symbol = %symbol, "Resetting symbol");
        self.dispatch(symbol, EngineEvent::Reset, at).await
    }

    /// Close every open position
    ///
    /// Symbols that end the session stuck are reported in the returned statuses.
    pub async fn end_session(&self, at: DateTime<Utc>) -> Vec<SymbolStatus> {
        let mut statuses = Vec::with_capacity(self.machines.len());
        for symbol in self.machines.keys() {
            if let Ok(status) = self.dispatch(symbol, EngineEvent::SessionEnd, at).await {
                if status.state != "flat" {
                    warn!(
                        symbol = %symbol,
                        state = status.state,
                        "Symbol not flat at session end"
                    );
                }
                statuses.push(status);
            }
        }
        statuses
    }

    /// Poll the account and flatten everything on a margin call
    pub async fn refresh_account(&self, at: DateTime<Utc>) -> Result<Account, ExecutionError> {
        let breach = self
            .fetch_account(at)
            .await
            .map_err(CallFailure::into_query_error)?;
        if let Some(breach) = breach {
            self.flatten_others("", &breach, at).await;
        }
        Ok(self.account())
    }

    /// Balance plus unrealized PnL of every position at its last seen price
    pub async fn equity(&self) -> Decimal {
        let mut equity = self.account.read().balance;
        for slot in self.machines.values() {
            let machine = slot.lock().await;
            if let (Some(position), Some(price)) = (machine.position(), machine.last_price) {
                equity += position.unrealized_pnl(price);
            }
        }
        equity
    }

    pub async fn status(&self, symbol: &str) -> Option<SymbolStatus> {
        let slot = self.machines.get(symbol)?;
        let machine = slot.lock().await;
        Some(SymbolStatus::from(&*machine))
    }

    pub async fn statuses(&self) -> Vec<SymbolStatus> {
        let mut statuses = Vec::with_capacity(self.machines.len());
        for slot in self.machines.values() {
            statuses.push(SymbolStatus::from(&*slot.lock().await));
        }
        statuses
    }

    pub async fn position(&self, symbol: &str) -> Option<Position> {
        let slot = self.machines.get(symbol)?;
        let machine = slot.lock().await;
        machine.position().cloned()
    }

    /// Action ids `symbol` currently accepts; anything else would be suppressed
    pub async fn legal_actions(&self, symbol: &str) -> Result<Vec<ActionId>, ExecutionError> {
        let slot = self.machine(symbol)?;
        let machine = slot.lock().await;
        Ok(machine.legal_actions())
    }

    pub async fn halted_symbols(&self) -> Vec<Symbol> {
        let mut halted = Vec::new();
        for (symbol, slot) in &self.machines {
            if slot.lock().await.halted {
                halted.push(symbol.clone());
            }
        }
        halted
    }

    fn machine(&self, symbol: &str) -> Result<&Mutex<SymbolMachine>, ExecutionError> {
        self.machines
            .get(symbol)
            .ok_or_else(|| ExecutionError::UnknownSymbol(symbol.to_string()))
    }

    async fn dispatch(
        &self,
        symbol: &str,
        event: EngineEvent,
        at: DateTime<Utc>,
    ) -> Result<SymbolStatus, ExecutionError> {
        let slot = self.machine(symbol)?;
        let (status, breach) = {
            let mut machine = slot.lock().await;
            let breach = self.drive(&mut machine, event, at).await;
            (SymbolStatus::from(&*machine), breach)
        };
        // other symbols are only locked once this one is released
        if let Some(breach) = breach {
            self.flatten_others(symbol, &breach, at).await;
        }
        Ok(status)
    }

    /// Run an event and every event its effects produce
    ///
    /// Returns the account breach found while refreshing, if any, so the caller can
    /// flatten the remaining symbols after releasing this one.
    async fn drive(
        &self,
        machine: &mut SymbolMachine,
        event: EngineEvent,
        at: DateTime<Utc>,
    ) -> Option<RiskBreach> {
        let mut queue = VecDeque::from([event]);
        let mut margin_call = None;

        while let Some(event) = queue.pop_front() {
            let before = machine.state.as_str();
            let ctx = TransitionContext {
                sizer: &self.sizer,
                guard: &self.guard,
                balance: self.account.read().balance,
                now: at,
            };
            let (next, effects) = transition(std::mem::take(machine), event, &ctx);
            *machine = next;

            if before != machine.state.as_str() {
                debug!(
                    symbol = %machine.symbol,
                    from = before,
                    to = machine.state.as_str(),
                    halted = machine.halted,
                    "State transition"
                );
            }

            for effect in effects {
                match effect {
                    Effect::PlaceOrder(request) => {
                        queue.push_back(self.execute_order(&request).await);
                    }
                    Effect::QueryPosition => {
                        match self.gateway.query_position(&machine.symbol).await {
                            Ok(remote) => {
                                info!(
                                    symbol = %machine.symbol,
                                    remote = ?remote,
                                    "Reconciling unknown order outcome"
                                );
                                queue.push_back(EngineEvent::Reconciled(remote));
                            }
                            Err(e) => {
                                let event = RiskEvent::new(
                                    machine.symbol.clone(),
                                    RiskEventKind::PositionStuck,
                                    format!("reconciliation failed: {}", e),
                                    at,
                                );
                                self.emit_risk(&event);
                            }
                        }
                    }
                    Effect::RefreshAccount => match self.fetch_account(at).await {
                        Ok(Some(breach)) => {
                            if !machine.halted {
                                queue.push_back(EngineEvent::Fatal {
                                    kind: breach.kind,
                                    detail: breach.detail.clone(),
                                });
                            }
                            margin_call = Some(breach);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(symbol = %machine.symbol, error = %e, "Account refresh failed");
                        }
                    },
                    Effect::EmitRisk(event) => self.emit_risk(&event),
                    Effect::RecordTrade(trade) => {
                        info!(
                            symbol = %trade.symbol,
                            side = %trade.side,
                            size = %trade.size,
                            entry = %trade.entry_price,
                            exit = %trade.exit_price,
                            pnl = %trade.pnl,
                            reason = %trade.reason,
                            "Position closed"
                        );
                        for observer in &self.observers {
                            observer.on_trade_closed(&trade);
                        }
                    }
                    Effect::PositionOpened(position) => {
                        info!(
                            symbol = %position.symbol,
                            side = %position.side,
                            size = %position.entry_size,
                            price = %position.entry_price,
                            stop_loss = ?position.stop_loss_price,
                            take_profit = ?position.take_profit_price,
                            "Position opened"
                        );
                        for observer in &self.observers {
                            observer.on_position_opened(&position);
                        }
                    }
                    Effect::Suppressed { reason } => {
                        debug!(
                            symbol = %machine.symbol,
                            state = machine.state.as_str(),
                            reason = reason.as_str(),
                            "Action suppressed"
                        );
                        for observer in &self.observers {
                            observer.on_action_suppressed(&machine.symbol, reason.as_str());
                        }
                    }
                }
            }
        }

        margin_call
    }

    async fn execute_order(&self, request: &OrderRequest) -> EngineEvent {
        if !request.reduce_only {
            if let Err(failure) = self.ensure_leverage(&request.symbol).await {
                warn!(
                    symbol = %request.symbol,
                    error = %failure,
                    "Could not set leverage, entry abandoned"
                );
                self.notify_order(request, "rejected");
                return EngineEvent::GatewayFailed {
                    request_id: request.request_id.clone(),
                    failure: GatewayFailure::Rejected,
                    detail: failure.to_string(),
                };
            }
        }

        debug!(
            request_id = %request.request_id,
            symbol = %request.symbol,
            side = %request.side,
            size = %request.size,
            reduce_only = request.reduce_only,
            "Submitting order"
        );
        self.notify_order(request, "submitted");

        match self.gateway.place_order(request).await {
            Ok(ack) => {
                let status = match ack.status {
                    OrderStatus::Filled => "filled",
                    OrderStatus::PartiallyFilled => "partially_filled",
                };
                debug!(
                    request_id = %request.request_id,
                    order_id = %ack.order_id,
                    filled = %ack.filled_size,
                    price = %ack.avg_price,
                    status,
                    "Order acknowledged"
                );
                self.notify_order(request, status);
                EngineEvent::Filled(ack)
            }
            Err(failure) => {
                let (kind, status) = match &failure {
                    CallFailure::Unknown(_) => (GatewayFailure::UnknownOutcome, "unknown"),
                    CallFailure::Exhausted { .. } => (GatewayFailure::Exhausted, "exhausted"),
                    CallFailure::Failed(_) => (GatewayFailure::Rejected, "rejected"),
                };
                warn!(
                    request_id = %request.request_id,
                    symbol = %request.symbol,
                    error = %failure,
                    status,
                    "Order not acknowledged"
                );
                self.notify_order(request, status);
                EngineEvent::GatewayFailed {
                    request_id: request.request_id.clone(),
                    failure: kind,
                    detail: failure.to_string(),
                }
            }
        }
    }

    async fn ensure_leverage(&self, symbol: &str) -> Result<(), CallFailure> {
        if self.leverage_set.lock().contains(symbol) {
            return Ok(());
        }
        let leverage = self.sizer.config().leverage;
        self.gateway.set_leverage(symbol, leverage).await?;
        self.leverage_set.lock().insert(symbol.to_string());
        debug!(symbol = %symbol, leverage = %leverage, "Leverage set");
        Ok(())
    }

    async fn fetch_account(&self, at: DateTime<Utc>) -> Result<Option<RiskBreach>, CallFailure> {
        let account = self.gateway.query_balance().await?;
        *self.account.write() = account;
        for observer in &self.observers {
            observer.on_account(&account, at);
        }
        Ok(self.guard.assess_account(&account))
    }

    async fn flatten_others(&self, origin: &str, breach: &RiskBreach, at: DateTime<Utc>) {
        error!(
            origin = %origin,
            kind = %breach.kind,
            detail = %breach.detail,
            "Account breach, flattening all symbols"
        );
        for (symbol, slot) in &self.machines {
            if symbol == origin {
                continue;
            }
            let mut machine = slot.lock().await;
            if machine.halted && machine.position().is_none() && machine.pending_request().is_none() {
                continue;
            }
            let event = EngineEvent::Fatal {
                kind: breach.kind,
                detail: breach.detail.clone(),
            };
            // nested breaches are covered by this sweep
            let _ = self.drive(&mut machine, event, at).await;
        }
    }

    fn emit_risk(&self, event: &RiskEvent) {
        if event.kind.is_fatal() || event.kind == RiskEventKind::PositionStuck {
            error!(
                symbol = %event.symbol,
                kind = %event.kind,
                detail = %event.detail,
                "Risk event"
            );
        } else {
            warn!(
                symbol = %event.symbol,
                kind = %event.kind,
                detail = %event.detail,
                "Risk event"
            );
        }
        for observer in &self.observers {
            observer.on_risk_event(event);
        }
    }

    fn notify_order(&self, request: &OrderRequest, status: &str) {
        for observer in &self.observers {
            observer.on_order(request, status);
        }
    }

    fn notify_reconciled(&self, machine: &SymbolMachine) {
        for observer in &self.observers {
            observer.on_reconciled(&machine.symbol, machine.state.as_str());
        }
    }
}

/// Failures while reconciling are reported against the order in flight, if any
fn reconcile_error(failure: CallFailure, pending: Option<&OrderRequest>) -> ExecutionError {
    match pending {
        Some(request) => failure.into_execution_error(&request.request_id),
        None => failure.into_query_error(),
    }
}
