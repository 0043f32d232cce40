//! Per-symbol execution state machine
//!
//! [`transition`] is a pure function: it consumes a [`SymbolMachine`] and one
//! [`EngineEvent`] and returns the next machine together with the [`Effect`]s the
//! engine has to carry out. No gateway call happens here, so every rule below can be
//! exercised without I/O.
//!
//! ```text
//! Flat --open--> Opening --fill--> Open --exit--> Closing --fill--> Flat
//!                   |                                 |
//!                   +------- unknown outcome ---------+--> Stuck --reconciled--> Open | Flat
//! ```

use chrono::{DateTime, Utc};
use qtrader_core::{
    ActionId, ExitReason, FeedGap, GatewayPosition, OrderAck, OrderRequest, Position,
    RiskError, RiskEvent, RiskEventKind, Side, Symbol, Tick, TradeAction, TradeRecord,
};
use qtrader_risk::{check_exit, update_trailing, PositionSizer, RiskGuard, StopLevels};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of one symbol
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SymbolState {
    #[default]
    Flat,
    /// Entry order in flight
    Opening {
        request: OrderRequest,
        side: Side,
        leverage: Decimal,
        /// Close as soon as the entry fills
        close_on_fill: Option<ExitReason>,
    },
    Open { position: Position },
    /// Exit order in flight
    Closing {
        position: Position,
        request: OrderRequest,
        reason: ExitReason,
    },
    /// Order outcome unknown; only reconciliation or a reset leaves this state
    Stuck {
        /// Position as last known locally
        position: Option<Position>,
        request: OrderRequest,
        detail: String,
    },
}

impl SymbolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolState::Flat => "flat",
            SymbolState::Opening { .. } => "opening",
            SymbolState::Open { .. } => "open",
            SymbolState::Closing { .. } => "closing",
            SymbolState::Stuck { .. } => "stuck",
        }
    }
}

impl fmt::Display for SymbolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine for one traded symbol
#[derive(Debug, Clone, Default)]
pub struct SymbolMachine {
    pub symbol: Symbol,
    pub state: SymbolState,
    /// Set by a fatal risk event; blocks new positions until reset
    pub halted: bool,
    pub last_price: Option<Decimal>,
    next_seq: u64,
}

impl SymbolMachine {
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    /// Position held or being closed, including the last known one while stuck
    pub fn position(&self) -> Option<&Position> {
        match &self.state {
            SymbolState::Open { position } | SymbolState::Closing { position, .. } => {
                Some(position)
            }
            SymbolState::Stuck { position, .. } => position.as_ref(),
            SymbolState::Flat | SymbolState::Opening { .. } => None,
        }
    }

    /// Order awaiting an outcome
    pub fn pending_request(&self) -> Option<&OrderRequest> {
        match &self.state {
            SymbolState::Opening { request, .. }
            | SymbolState::Closing { request, .. }
            | SymbolState::Stuck { request, .. } => Some(request),
            SymbolState::Flat | SymbolState::Open { .. } => None,
        }
    }

    pub fn is_stuck(&self) -> bool {
        matches!(self.state, SymbolState::Stuck { .. })
    }

    /// Actions that can change this machine's state, plus hold
    pub fn legal_actions(&self) -> Vec<ActionId> {
        let mut legal = vec![TradeAction::Hold.to_index()];
        match &self.state {
            SymbolState::Flat if !self.halted => {
                legal.push(TradeAction::OpenLong.to_index());
                legal.push(TradeAction::OpenShort.to_index());
            }
            SymbolState::Open { .. } => legal.push(TradeAction::Close.to_index()),
            _ => {}
        }
        legal
    }

    fn next_request_id(&mut self) -> String {
        self.next_seq += 1;
        format!("qt-{}-{}", self.symbol, self.next_seq)
    }
}

/// Snapshot of a symbol machine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolStatus {
    pub symbol: Symbol,
    pub state: &'static str,
    pub halted: bool,
    pub position: Option<Position>,
    pub last_price: Option<Decimal>,
    pub pending_request: Option<String>,
}

impl From<&SymbolMachine> for SymbolStatus {
    fn from(machine: &SymbolMachine) -> Self {
        Self {
            symbol: machine.symbol.clone(),
            state: machine.state.as_str(),
            halted: machine.halted,
            position: machine.position().cloned(),
            last_price: machine.last_price,
            pending_request: machine.pending_request().map(|r| r.request_id.clone()),
        }
    }
}

/// How a gateway call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayFailure {
    /// Definitive failure; nothing was executed
    Rejected,
    /// Timed out; the order may or may not have executed
    UnknownOutcome,
    /// Transient failures exhausted the attempt ceiling
    Exhausted,
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Action {
        action: ActionId,
        confidence: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    },
    Filled(OrderAck),
    Tick(Tick),
    FeedGap(FeedGap),
    Fatal {
        kind: RiskEventKind,
        detail: String,
    },
    /// The exchange's view of the position, `None` when flat
    Reconciled(Option<GatewayPosition>),
    GatewayFailed {
        request_id: String,
        failure: GatewayFailure,
        detail: String,
    },
    SessionEnd,
    Reset,
}

/// Why an action produced no order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuppressReason {
    Unrecognized,
    /// Not legal in the current state, e.g. open while open
    Illegal,
    LowConfidence,
    RiskLimit,
    Halted,
    Stuck,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::Unrecognized => "unrecognized",
            SuppressReason::Illegal => "illegal",
            SuppressReason::LowConfidence => "low_confidence",
            SuppressReason::RiskLimit => "risk_limit",
            SuppressReason::Halted => "halted",
            SuppressReason::Stuck => "stuck",
        }
    }
}

/// Side effect requested by a transition, executed by the engine in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PlaceOrder(OrderRequest),
    QueryPosition,
    RefreshAccount,
    EmitRisk(RiskEvent),
    RecordTrade(TradeRecord),
    PositionOpened(Position),
    Suppressed { reason: SuppressReason },
}

/// Read-only inputs of a transition
pub struct TransitionContext<'a> {
    pub sizer: &'a PositionSizer,
    pub guard: &'a RiskGuard,
    /// Balance used for sizing
    pub balance: Decimal,
    pub now: DateTime<Utc>,
}

/// Apply one event to a symbol machine
pub fn transition(
    mut machine: SymbolMachine,
    event: EngineEvent,
    ctx: &TransitionContext<'_>,
) -> (SymbolMachine, Vec<Effect>) {
    let mut effects = Vec::new();

    match &event {
        EngineEvent::Tick(tick) => machine.last_price = Some(tick.price),
        EngineEvent::Action { price, .. } => machine.last_price = Some(*price),
        _ => {}
    }

    let state = std::mem::take(&mut machine.state);
    machine.state = match event {
        EngineEvent::Action {
            action,
            confidence,
            price,
            ..
        } => on_action(&mut machine, state, action, confidence, price, ctx, &mut effects),
        EngineEvent::Filled(ack) => on_fill(&mut machine, state, &ack, ctx, &mut effects),
        EngineEvent::Tick(tick) => on_tick(&mut machine, state, &tick, ctx, &mut effects),
        EngineEvent::FeedGap(gap) => on_gap(&mut machine, state, &gap, ctx, &mut effects),
        EngineEvent::Fatal { kind, detail } => {
            on_fatal(&mut machine, state, kind, detail, ctx, &mut effects)
        }
        EngineEvent::Reconciled(remote) => match state {
            // the in-flight order's own outcome decides
            in_flight @ (SymbolState::Opening { .. } | SymbolState::Closing { .. }) => in_flight,
            SymbolState::Flat => adopt_remote(&mut machine, None, remote, ctx, &mut effects),
            SymbolState::Open { position } => {
                adopt_remote(&mut machine, Some(position), remote, ctx, &mut effects)
            }
            SymbolState::Stuck { position, .. } => {
                adopt_remote(&mut machine, position, remote, ctx, &mut effects)
            }
        },
        EngineEvent::GatewayFailed {
            request_id,
            failure,
            detail,
        } => on_gateway_failed(&mut machine, state, &request_id, failure, detail, ctx, &mut effects),
        EngineEvent::SessionEnd => match state {
            SymbolState::Open { position } => {
                begin_close(&mut machine, position, ExitReason::SessionEnd, &mut effects)
            }
            SymbolState::Opening {
                request,
                side,
                leverage,
                close_on_fill,
            } => SymbolState::Opening {
                request,
                side,
                leverage,
                close_on_fill: close_on_fill.or(Some(ExitReason::SessionEnd)),
            },
            other => other,
        },
        EngineEvent::Reset => {
            machine.halted = false;
            match state {
                SymbolState::Stuck { .. } => SymbolState::Flat,
                other => other,
            }
        }
    };

    (machine, effects)
}

fn on_action(
    machine: &mut SymbolMachine,
    state: SymbolState,
    action: ActionId,
    confidence: Decimal,
    price: Decimal,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    let Some(action) = TradeAction::from_index(action) else {
        effects.push(Effect::Suppressed {
            reason: SuppressReason::Unrecognized,
        });
        return state;
    };

    match (state, action) {
        (state, TradeAction::Hold) => state,
        (state @ SymbolState::Stuck { .. }, _) => {
            effects.push(Effect::Suppressed {
                reason: SuppressReason::Stuck,
            });
            state
        }
        (SymbolState::Flat, TradeAction::OpenLong | TradeAction::OpenShort) if machine.halted => {
            effects.push(Effect::Suppressed {
                reason: SuppressReason::Halted,
            });
            SymbolState::Flat
        }
        (SymbolState::Flat, TradeAction::OpenLong) => {
            begin_open(machine, Side::Long, confidence, price, ctx, effects)
        }
        (SymbolState::Flat, TradeAction::OpenShort) => {
            begin_open(machine, Side::Short, confidence, price, ctx, effects)
        }
        (SymbolState::Open { position }, TradeAction::Close) => {
            begin_close(machine, position, ExitReason::Signal, effects)
        }
        (state, _) => {
            effects.push(Effect::Suppressed {
                reason: SuppressReason::Illegal,
            });
            state
        }
    }
}

fn begin_open(
    machine: &mut SymbolMachine,
    side: Side,
    confidence: Decimal,
    price: Decimal,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    let leverage = ctx.sizer.config().leverage;
    match ctx.sizer.size(ctx.balance, confidence, price, leverage) {
        Ok(size) => {
            let request = OrderRequest::market(
                machine.next_request_id(),
                machine.symbol.clone(),
                side.entry_order_side(),
                size,
            );
            effects.push(Effect::PlaceOrder(request.clone()));
            SymbolState::Opening {
                request,
                side,
                leverage,
                close_on_fill: None,
            }
        }
        Err(RiskError::ConfidenceBelowThreshold { .. }) => {
            effects.push(Effect::Suppressed {
                reason: SuppressReason::LowConfidence,
            });
            SymbolState::Flat
        }
        Err(e) => {
            effects.push(Effect::EmitRisk(RiskEvent::new(
                machine.symbol.clone(),
                RiskEventKind::LimitExceeded,
                e.to_string(),
                ctx.now,
            )));
            effects.push(Effect::Suppressed {
                reason: SuppressReason::RiskLimit,
            });
            SymbolState::Flat
        }
    }
}

/// Reduce-only market order for the full remaining size
fn begin_close(
    machine: &mut SymbolMachine,
    position: Position,
    reason: ExitReason,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    let request = OrderRequest::market(
        machine.next_request_id(),
        position.symbol.clone(),
        position.side.exit_order_side(),
        position.entry_size,
    )
    .reduce_only();
    effects.push(Effect::PlaceOrder(request.clone()));
    SymbolState::Closing {
        position,
        request,
        reason,
    }
}

fn on_fill(
    machine: &mut SymbolMachine,
    state: SymbolState,
    ack: &OrderAck,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    match state {
        SymbolState::Opening {
            request,
            side,
            leverage,
            close_on_fill,
        } if request.request_id == ack.request_id => {
            if ack.filled_size <= Decimal::ZERO {
                return SymbolState::Flat;
            }
            let levels = StopLevels::for_entry(side, ack.avg_price, ctx.sizer.config());
            let position = Position {
                symbol: machine.symbol.clone(),
                side,
                entry_size: ack.filled_size,
                entry_price: ack.avg_price,
                leverage,
                stop_loss_price: levels.stop_loss,
                take_profit_price: levels.take_profit,
                trailing_anchor: ack.avg_price,
                trailing_stop_price: None,
                opened_at: ctx.now,
                realized_pnl: Decimal::ZERO,
                fees: ack.fee,
            };
            effects.push(Effect::PositionOpened(position.clone()));
            effects.push(Effect::RefreshAccount);
            match close_on_fill {
                Some(reason) => begin_close(machine, position, reason, effects),
                None => SymbolState::Open { position },
            }
        }
        SymbolState::Closing {
            mut position,
            request,
            reason,
        } if request.request_id == ack.request_id => {
            let filled = ack.filled_size.min(position.entry_size);
            if filled <= Decimal::ZERO {
                return SymbolState::Open { position };
            }
            let entry_fees = position.fees * filled / position.entry_size;
            let pnl = position.pnl_for(filled, ack.avg_price);
            effects.push(Effect::RecordTrade(TradeRecord {
                symbol: position.symbol.clone(),
                side: position.side,
                entry_price: position.entry_price,
                exit_price: ack.avg_price,
                size: filled,
                pnl,
                fees: entry_fees + ack.fee,
                reason,
                opened_at: position.opened_at,
                closed_at: ctx.now,
            }));
            effects.push(Effect::RefreshAccount);

            position.realized_pnl += pnl;
            position.fees -= entry_fees;
            position.entry_size -= filled;
            if position.entry_size > Decimal::ZERO {
                begin_close(machine, position, reason, effects)
            } else {
                SymbolState::Flat
            }
        }
        // ack for an order that is no longer pending
        other => other,
    }
}

fn on_tick(
    machine: &mut SymbolMachine,
    state: SymbolState,
    tick: &Tick,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    match state {
        SymbolState::Open { mut position } => {
            if machine.halted {
                return begin_close(machine, position, ExitReason::ForcedFlatten, effects);
            }
            let config = ctx.sizer.config();
            update_trailing(&mut position, tick.price, config);
            match check_exit(&position, tick.price, config) {
                Some(reason) => begin_close(machine, position, reason, effects),
                None => SymbolState::Open { position },
            }
        }
        other => other,
    }
}

fn on_gap(
    machine: &mut SymbolMachine,
    state: SymbolState,
    gap: &FeedGap,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    if !gap.affects(&machine.symbol) || matches!(state, SymbolState::Flat) {
        return state;
    }
    match ctx.guard.assess_gap(Duration::from_millis(gap.silence_ms)) {
        Some(breach) => on_fatal(machine, state, breach.kind, breach.detail, ctx, effects),
        None => state,
    }
}

fn on_fatal(
    machine: &mut SymbolMachine,
    state: SymbolState,
    kind: RiskEventKind,
    detail: String,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    machine.halted = true;
    effects.push(Effect::EmitRisk(RiskEvent::new(
        machine.symbol.clone(),
        kind,
        detail,
        ctx.now,
    )));

    match state {
        SymbolState::Opening {
            request,
            side,
            leverage,
            ..
        } => SymbolState::Opening {
            request,
            side,
            leverage,
            close_on_fill: Some(ExitReason::ForcedFlatten),
        },
        SymbolState::Open { position } => {
            effects.push(Effect::EmitRisk(RiskEvent::new(
                machine.symbol.clone(),
                RiskEventKind::ForcedFlatten,
                format!(
                    "flattening {} {} after {}",
                    position.side, position.entry_size, kind
                ),
                ctx.now,
            )));
            begin_close(machine, position, ExitReason::ForcedFlatten, effects)
        }
        // Flat only halts; a close is already in flight; stuck waits for reconciliation
        other => other,
    }
}

#[allow(clippy::too_many_arguments)]
fn on_gateway_failed(
    machine: &mut SymbolMachine,
    state: SymbolState,
    request_id: &str,
    failure: GatewayFailure,
    detail: String,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    let pending = match &state {
        SymbolState::Opening { request, .. } | SymbolState::Closing { request, .. } => {
            request.request_id == request_id
        }
        _ => false,
    };
    if !pending {
        return state;
    }

    match failure {
        GatewayFailure::Rejected => match state {
            SymbolState::Closing { position, .. } => SymbolState::Open { position },
            _ => SymbolState::Flat,
        },
        GatewayFailure::UnknownOutcome => {
            effects.push(Effect::QueryPosition);
            into_stuck(state, detail)
        }
        GatewayFailure::Exhausted => {
            effects.push(Effect::EmitRisk(RiskEvent::new(
                machine.symbol.clone(),
                RiskEventKind::PositionStuck,
                detail.clone(),
                ctx.now,
            )));
            into_stuck(state, detail)
        }
    }
}

fn into_stuck(state: SymbolState, detail: String) -> SymbolState {
    match state {
        SymbolState::Opening { request, .. } => SymbolState::Stuck {
            position: None,
            request,
            detail,
        },
        SymbolState::Closing {
            position, request, ..
        } => SymbolState::Stuck {
            position: Some(position),
            request,
            detail,
        },
        other => other,
    }
}

/// Rebuild local state from the exchange's view
fn adopt_remote(
    machine: &mut SymbolMachine,
    known: Option<Position>,
    remote: Option<GatewayPosition>,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    let remote = remote.and_then(|p| p.direction().map(|side| (side, p)));

    let (side, remote) = match (known, remote) {
        (None, None) => return SymbolState::Flat,
        (Some(position), None) => {
            close_at_last_price(machine, position, ctx, effects);
            return SymbolState::Flat;
        }
        (Some(mut position), Some((side, remote))) if position.side == side => {
            position.entry_size = remote.size;
            position.entry_price = remote.entry_price;
            effects.push(Effect::RefreshAccount);
            return resume_open(machine, position, effects);
        }
        (Some(position), Some(remote)) => {
            close_at_last_price(machine, position, ctx, effects);
            remote
        }
        (None, Some(remote)) => remote,
    };

    let levels = StopLevels::for_entry(side, remote.entry_price, ctx.sizer.config());
    let position = Position {
        symbol: machine.symbol.clone(),
        side,
        entry_size: remote.size,
        entry_price: remote.entry_price,
        leverage: remote.leverage,
        stop_loss_price: levels.stop_loss,
        take_profit_price: levels.take_profit,
        trailing_anchor: remote.entry_price,
        trailing_stop_price: None,
        opened_at: ctx.now,
        realized_pnl: Decimal::ZERO,
        fees: Decimal::ZERO,
    };
    effects.push(Effect::PositionOpened(position.clone()));
    effects.push(Effect::RefreshAccount);
    resume_open(machine, position, effects)
}

fn resume_open(
    machine: &mut SymbolMachine,
    position: Position,
    effects: &mut Vec<Effect>,
) -> SymbolState {
    if machine.halted {
        begin_close(machine, position, ExitReason::ForcedFlatten, effects)
    } else {
        SymbolState::Open { position }
    }
}

/// Realize a position the exchange no longer holds, at the last seen price
fn close_at_last_price(
    machine: &SymbolMachine,
    position: Position,
    ctx: &TransitionContext<'_>,
    effects: &mut Vec<Effect>,
) {
    let exit_price = machine.last_price.unwrap_or(position.entry_price);
    effects.push(Effect::RecordTrade(TradeRecord {
        pnl: position.pnl_for(position.entry_size, exit_price),
        symbol: position.symbol,
        side: position.side,
        entry_price: position.entry_price,
        exit_price,
        size: position.entry_size,
        fees: position.fees,
        reason: ExitReason::Reconciled,
        opened_at: position.opened_at,
        closed_at: ctx.now,
    }));
    effects.push(Effect::RefreshAccount);
}
