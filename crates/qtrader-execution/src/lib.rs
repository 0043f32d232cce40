//! qtrader Execution
//!
//! Per-symbol position state machines, the engine that drives them against an
//! exchange gateway, and the loops that feed it decisions.

pub mod agent;
pub mod engine;
pub mod live_runner;
pub mod retrying_gateway;
pub mod state_machine;

pub use agent::TradingAgent;
pub use engine::ExecutionEngine;
pub use live_runner::{LiveRunner, SharedStatus, TrainingSchedule};
pub use retrying_gateway::{CallFailure, RetryingGateway};
pub use state_machine::{
    transition, Effect, EngineEvent, GatewayFailure, SuppressReason, SymbolMachine, SymbolState,
    SymbolStatus, TransitionContext,
};
