use crate::error::{FeedError, GatewayError};
use crate::events::{FeedEvent, FeedGap, RiskEvent, TradeRecord};
use crate::types::{
    Account, ActionId, GatewayPosition, OrderAck, OrderRequest, Position, Symbol,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Exchange capability consumed by the execution engine
///
/// Every call is safe to retry: orders carry a client-supplied request id and the
/// remaining calls are reads or idempotent settings.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place an order, returning once it is acknowledged with its fill
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    /// Cancel an order by exchange id
    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    /// Current position for a symbol, `None` when flat
    async fn query_position(&self, symbol: &str) -> Result<Option<GatewayPosition>, GatewayError>;

    /// Current account snapshot
    async fn query_balance(&self) -> Result<Account, GatewayError>;

    /// Set leverage for a symbol
    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<(), GatewayError>;

    /// Name of this gateway for logs
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: ExchangeGateway + ?Sized> ExchangeGateway for Arc<T> {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        (**self).place_order(request).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        (**self).cancel_order(order_id).await
    }

    async fn query_position(&self, symbol: &str) -> Result<Option<GatewayPosition>, GatewayError> {
        (**self).query_position(symbol).await
    }

    async fn query_balance(&self) -> Result<Account, GatewayError> {
        (**self).query_balance().await
    }

    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<(), GatewayError> {
        (**self).set_leverage(symbol, leverage).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Streaming market data capability
///
/// The sequence is lazy and not restartable: after `Disconnected`, `connect` resubscribes
/// and the feed continues from the present, never replaying what was missed.
#[async_trait]
pub trait MarketFeed: Send {
    /// Subscribe (or resubscribe) to the given symbols
    async fn connect(&mut self, symbols: &[Symbol]) -> Result<(), FeedError>;

    /// Next tick or detected gap
    async fn next_event(&mut self) -> Result<FeedEvent, FeedError>;

    /// Name of this feed for logs
    fn name(&self) -> &str;
}

/// Callbacks from the execution engine and the runners driving it
///
/// All methods default to no-ops so observers implement only what they record.
pub trait ExecutionObserver: Send + Sync {
    fn on_position_opened(&self, _position: &Position) {}

    fn on_trade_closed(&self, _trade: &TradeRecord) {}

    fn on_risk_event(&self, _event: &RiskEvent) {}

    fn on_order(&self, _request: &OrderRequest, _status: &str) {}

    fn on_action_suppressed(&self, _symbol: &str, _reason: &str) {}

    fn on_gateway_retry(&self, _operation: &str, _attempt: u32) {}

    fn on_reconciled(&self, _symbol: &str, _state: &str) {}

    fn on_account(&self, _account: &Account, _at: chrono::DateTime<chrono::Utc>) {}

    fn on_decision(&self, _symbol: &str, _action: ActionId, _explored: bool, _exploration_rate: f64) {}

    fn on_train_step(&self, _steps: u64, _loss: f64) {}

    fn on_feed_gap(&self, _gap: &FeedGap) {}

    fn on_feed_status(&self, _connected: bool, _reconnects: u64) {}
}
