//! Domain types shared by every qtrader crate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange symbol, e.g. "BTCUSDT"
pub type Symbol = String;

/// Index into the action vocabulary
pub type ActionId = usize;

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Position direction as reported by an exchange, which may be flat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl From<Side> for PositionSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Long => PositionSide::Long,
            Side::Short => PositionSide::Short,
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

/// Discrete action vocabulary produced by the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeAction {
    /// Do nothing this step
    Hold,
    /// Open a long position
    OpenLong,
    /// Open a short position
    OpenShort,
    /// Close the open position
    Close,
}

impl TradeAction {
    /// Number of actions in the vocabulary
    pub const COUNT: usize = 4;

    /// Get all possible actions, ordered by index
    pub fn all() -> &'static [TradeAction] {
        &[
            TradeAction::Hold,
            TradeAction::OpenLong,
            TradeAction::OpenShort,
            TradeAction::Close,
        ]
    }

    /// Get action from index; indices outside the vocabulary are unrecognized
    pub fn from_index(index: ActionId) -> Option<Self> {
        Self::all().get(index).copied()
    }

    /// Get index of this action
    pub fn to_index(&self) -> ActionId {
        match self {
            TradeAction::Hold => 0,
            TradeAction::OpenLong => 1,
            TradeAction::OpenShort => 2,
            TradeAction::Close => 3,
        }
    }

    /// Side this action opens, if it is an open action
    pub fn opens(&self) -> Option<Side> {
        match self {
            TradeAction::OpenLong => Some(Side::Long),
            TradeAction::OpenShort => Some(Side::Short),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Hold => "hold",
            TradeAction::OpenLong => "open_long",
            TradeAction::OpenShort => "open_short",
            TradeAction::Close => "close",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single market data tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub volume: Decimal,
}

impl Tick {
    pub fn new(symbol: impl Into<Symbol>, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
            volume: Decimal::ZERO,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = volume;
        self
    }
}

/// An open position tracked by the execution engine
///
/// A flat symbol has no `Position` at all; the engine state carries flatness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Side,
    /// Current size; shrinks on partial closes
    pub entry_size: Decimal,
    pub entry_price: Decimal,
    pub leverage: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// Most favourable price seen since entry
    pub trailing_anchor: Decimal,
    pub trailing_stop_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    /// PnL already realized by partial closes
    pub realized_pnl: Decimal,
    /// Entry fees not yet attributed to a closed trade
    #[serde(default)]
    pub fees: Decimal,
}

impl Position {
    /// PnL of the remaining size at `price`
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.entry_size * self.side.sign()
    }

    /// PnL realized by closing `size` units at `price`
    pub fn pnl_for(&self, size: Decimal, price: Decimal) -> Decimal {
        (price - self.entry_price) * size * self.side.sign()
    }

    /// Margin held by this position
    pub fn margin(&self) -> Decimal {
        if self.leverage.is_zero() {
            return self.entry_size * self.entry_price;
        }
        self.entry_size * self.entry_price / self.leverage
    }
}

/// Account snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balance: Decimal,
    pub equity: Decimal,
    pub used_margin: Decimal,
}

impl Account {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance,
            equity: balance,
            used_margin: Decimal::ZERO,
        }
    }

    pub fn free_margin(&self) -> Decimal {
        (self.equity - self.used_margin).max(Decimal::ZERO)
    }
}

/// Order intent sent to an exchange gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-supplied id; retries of the same intent reuse it
    pub request_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub size: Decimal,
    pub order_type: OrderType,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(
        request_id: impl Into<String>,
        symbol: impl Into<Symbol>,
        side: OrderSide,
        size: Decimal,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            symbol: symbol.into(),
            side,
            size,
            order_type: OrderType::Market,
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Fill status carried by an acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
}

/// Exchange acknowledgment of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub request_id: String,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub avg_price: Decimal,
    #[serde(default)]
    pub fee: Decimal,
}

/// Position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPosition {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: Decimal,
}

impl GatewayPosition {
    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat || self.size.is_zero()
    }

    /// Direction of a non-flat position
    pub fn direction(&self) -> Option<Side> {
        if self.is_flat() {
            return None;
        }
        match self.side {
            PositionSide::Long => Some(Side::Long),
            PositionSide::Short => Some(Side::Short),
            PositionSide::Flat => None,
        }
    }
}

/// Trading mode
///
/// Demo and paper both run against testnet; demo additionally uses a virtual balance.
/// The execution engine treats all three identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Demo,
    Paper,
    Live,
}

impl TradingMode {
    pub fn is_testnet(&self) -> bool {
        matches!(self, TradingMode::Demo | TradingMode::Paper)
    }

    pub fn uses_virtual_balance(&self) -> bool {
        matches!(self, TradingMode::Demo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Demo => "demo",
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "demo" => Ok(TradingMode::Demo),
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(format!("unknown trading mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_size: dec!(0.25),
            entry_price: dec!(40000),
            leverage: dec!(10),
            stop_loss_price: None,
            take_profit_price: None,
            trailing_anchor: dec!(40000),
            trailing_stop_price: None,
            opened_at: Utc::now(),
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
        }
    }

    #[test]
    fn test_action_index_round_trip() {
        for (i, action) in TradeAction::all().iter().enumerate() {
            assert_eq!(action.to_index(), i);
            assert_eq!(TradeAction::from_index(i), Some(*action));
        }
        assert_eq!(TradeAction::from_index(TradeAction::COUNT), None);
    }

    #[test]
    fn test_close_side_is_opposite() {
        assert_eq!(Side::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_order_side(), OrderSide::Buy);
    }

    #[test]
    fn test_position_pnl_and_margin() {
        let mut position = long_position();
        assert_eq!(position.unrealized_pnl(dec!(41000)), dec!(250));
        assert_eq!(position.margin(), dec!(1000));

        position.side = Side::Short;
        assert_eq!(position.unrealized_pnl(dec!(41000)), dec!(-250));
    }

    #[test]
    fn test_trading_mode_flags() {
        assert!(TradingMode::Demo.is_testnet());
        assert!(TradingMode::Paper.is_testnet());
        assert!(!TradingMode::Live.is_testnet());
        assert!(TradingMode::Demo.uses_virtual_balance());
        assert!(!TradingMode::Paper.uses_virtual_balance());
        assert_eq!("PAPER".parse::<TradingMode>(), Ok(TradingMode::Paper));
    }

    #[test]
    fn test_gateway_position_direction() {
        let flat = GatewayPosition {
            symbol: "ETHUSDT".to_string(),
            side: PositionSide::Long,
            size: Decimal::ZERO,
            entry_price: dec!(2000),
            leverage: dec!(5),
        };
        assert!(flat.is_flat());
        assert_eq!(flat.direction(), None);
    }
}
