//! Simulated exchange that fills market orders against the replayed tape

use crate::config::{FeeConfig, SlippageConfig, SlippageModel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qtrader_core::{
    Account, ExchangeGateway, GatewayError, GatewayPosition, OrderAck, OrderRequest, OrderSide,
    OrderStatus, PositionSide, Symbol,
};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Net position held on the simulated exchange
#[derive(Debug, Clone, Copy, PartialEq)]
struct NetPosition {
    /// Signed quantity, positive for long
    qty: Decimal,
    entry_price: Decimal,
    leverage: Decimal,
}

impl NetPosition {
    fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.qty
    }

    fn margin(&self) -> Decimal {
        self.qty.abs() * self.entry_price / self.leverage.max(Decimal::ONE)
    }
}

/// Exchange gateway backed by in-memory state
///
/// Market orders fill completely at the last tape price for the symbol, moved against
/// the taker by the slippage model. Fees come out of the balance on every fill and
/// realized PnL goes into it when a position is reduced.
pub struct SimulatedExchange {
    fees: FeeConfig,
    slippage: SlippageConfig,
    prices: RwLock<HashMap<Symbol, Decimal>>,
    positions: RwLock<HashMap<Symbol, NetPosition>>,
    leverage: RwLock<HashMap<Symbol, Decimal>>,
    balance: RwLock<Decimal>,
    current_time: RwLock<DateTime<Utc>>,
    order_seq: AtomicU64,
}

impl SimulatedExchange {
    pub fn new(initial_balance: Decimal, fees: FeeConfig, slippage: SlippageConfig) -> Self {
        Self {
            fees,
            slippage,
            prices: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            leverage: RwLock::new(HashMap::new()),
            balance: RwLock::new(initial_balance),
            current_time: RwLock::new(Utc::now()),
            order_seq: AtomicU64::new(0),
        }
    }

    /// Reset for a new episode
    pub async fn reset(&self, initial_balance: Decimal) {
        self.prices.write().await.clear();
        self.positions.write().await.clear();
        self.leverage.write().await.clear();
        *self.balance.write().await = initial_balance;
    }

    pub async fn update_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    pub async fn set_current_time(&self, time: DateTime<Utc>) {
        *self.current_time.write().await = time;
    }

    pub async fn current_time(&self) -> DateTime<Utc> {
        *self.current_time.read().await
    }

    pub async fn balance(&self) -> Decimal {
        *self.balance.read().await
    }

    /// Worst-for-the-taker fill price
    fn apply_slippage(&self, price: Decimal, side: OrderSide, size: Decimal) -> Decimal {
        let pct = match self.slippage.model {
            SlippageModel::None => Decimal::ZERO,
            SlippageModel::Fixed => self.slippage.base_slippage_pct,
            SlippageModel::SizeProportional => {
                let scale = if self.slippage.reference_notional.is_zero() {
                    Decimal::ZERO
                } else {
                    size * price / self.slippage.reference_notional
                };
                self.slippage.base_slippage_pct * (Decimal::ONE + scale)
            }
        };
        match side {
            OrderSide::Buy => price * (Decimal::ONE + pct),
            OrderSide::Sell => price * (Decimal::ONE - pct),
        }
    }

    fn calculate_fee(&self, notional: Decimal) -> Decimal {
        (notional * self.fees.trading_fee_pct).max(self.fees.min_fee)
    }

    fn next_order_id(&self) -> String {
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("sim-{}", seq)
    }

    fn account_of(
        balance: Decimal,
        positions: &HashMap<Symbol, NetPosition>,
        prices: &HashMap<Symbol, Decimal>,
    ) -> Account {
        let mut unrealized = Decimal::ZERO;
        let mut used_margin = Decimal::ZERO;
        for (symbol, position) in positions {
            let mark = prices.get(symbol).copied().unwrap_or(position.entry_price);
            unrealized += position.unrealized_pnl(mark);
            used_margin += position.margin();
        }
        Account {
            balance,
            equity: balance + unrealized,
            used_margin,
        }
    }
}

#[async_trait]
impl ExchangeGateway for SimulatedExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        if request.size <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "non-positive size {}",
                request.size
            )));
        }
        let prices = self.prices.read().await;
        let Some(&mark) = prices.get(&request.symbol) else {
            return Err(GatewayError::Rejected(format!(
                "no price for {}",
                request.symbol
            )));
        };
        let leverage = self
            .leverage
            .read()
            .await
            .get(&request.symbol)
            .copied()
            .unwrap_or(Decimal::ONE);

        let mut positions = self.positions.write().await;
        let mut balance = self.balance.write().await;

        let current = positions.get(&request.symbol).copied();
        let held = current.map(|p| p.qty).unwrap_or(Decimal::ZERO);
        let direction = match request.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        };
        let reducing = !held.is_zero() && held.signum() != direction;

        let mut size = request.size;
        if request.reduce_only {
            if !reducing {
                return Err(GatewayError::Rejected(
                    "reduce-only order would increase position".to_string(),
                ));
            }
            size = size.min(held.abs());
        }

        let fill_price = self.apply_slippage(mark, request.side, size);
        let added = if reducing {
            (size - held.abs()).max(Decimal::ZERO)
        } else {
            size
        };
        if !added.is_zero() {
            let account = Self::account_of(*balance, &positions, &prices);
            let required = added * fill_price / leverage.max(Decimal::ONE);
            if required > account.free_margin() {
                return Err(GatewayError::InsufficientBalance(format!(
                    "required margin {} exceeds free {}",
                    required.round_dp(4),
                    account.free_margin().round_dp(4)
                )));
            }
        }

        let fee = self.calculate_fee(size * fill_price);
        *balance -= fee;

        let delta = size * direction;
        match current {
            Some(position) if reducing => {
                let closed = size.min(held.abs());
                *balance += (fill_price - position.entry_price) * closed * held.signum();
                let remaining = held + delta;
                if remaining.is_zero() {
                    positions.remove(&request.symbol);
                } else if remaining.signum() == held.signum() {
                    positions.insert(
                        request.symbol.clone(),
                        NetPosition {
                            qty: remaining,
                            ..position
                        },
                    );
                } else {
                    positions.insert(
                        request.symbol.clone(),
                        NetPosition {
                            qty: remaining,
                            entry_price: fill_price,
                            leverage,
                        },
                    );
                }
            }
            Some(position) => {
                let qty = held + delta;
                let entry_price = (position.entry_price * held.abs() + fill_price * size) / qty.abs();
                positions.insert(
                    request.symbol.clone(),
                    NetPosition {
                        qty,
                        entry_price,
                        leverage,
                    },
                );
            }
            None => {
                positions.insert(
                    request.symbol.clone(),
                    NetPosition {
                        qty: delta,
                        entry_price: fill_price,
                        leverage,
                    },
                );
            }
        }

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            size = %size,
            price = %fill_price,
            fee = %fee,
            "Simulated fill"
        );

        Ok(OrderAck {
            order_id: self.next_order_id(),
            request_id: request.request_id.clone(),
            status: if size < request.size {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Filled
            },
            filled_size: size,
            avg_price: fill_price,
            fee,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        // market orders fill on placement, nothing is ever resting
        Err(GatewayError::NotFound(order_id.to_string()))
    }

    async fn query_position(&self, symbol: &str) -> Result<Option<GatewayPosition>, GatewayError> {
        Ok(self.positions.read().await.get(symbol).map(|p| GatewayPosition {
            symbol: symbol.to_string(),
            side: if p.qty > Decimal::ZERO {
                PositionSide::Long
            } else {
                PositionSide::Short
            },
            size: p.qty.abs(),
            entry_price: p.entry_price,
            leverage: p.leverage,
        }))
    }

    async fn query_balance(&self) -> Result<Account, GatewayError> {
        let prices = self.prices.read().await;
        let positions = self.positions.read().await;
        let balance = self.balance.read().await;
        Ok(Self::account_of(*balance, &positions, &prices))
    }

    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<(), GatewayError> {
        if leverage < Decimal::ONE {
            return Err(GatewayError::Rejected(format!("leverage {} below 1", leverage)));
        }
        self.leverage
            .write()
            .await
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exchange() -> SimulatedExchange {
        SimulatedExchange::new(
            dec!(10000),
            FeeConfig {
                trading_fee_pct: dec!(0.001),
                min_fee: Decimal::ZERO,
            },
            SlippageConfig {
                model: SlippageModel::None,
                ..Default::default()
            },
        )
    }

    fn buy(size: Decimal) -> OrderRequest {
        OrderRequest::market("r1", "BTCUSDT", OrderSide::Buy, size)
    }

    fn sell(size: Decimal) -> OrderRequest {
        OrderRequest::market("r2", "BTCUSDT", OrderSide::Sell, size)
    }

    #[tokio::test]
    async fn test_round_trip_realizes_pnl_minus_fees() {
        let ex = exchange();
        ex.set_leverage("BTCUSDT", dec!(10)).await.unwrap();
        ex.update_price("BTCUSDT", dec!(100)).await;

        let ack = ex.place_order(&buy(dec!(10))).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.avg_price, dec!(100));
        assert_eq!(ack.fee, dec!(1));

        let account = ex.query_balance().await.unwrap();
        assert_eq!(account.used_margin, dec!(100));

        ex.update_price("BTCUSDT", dec!(110)).await;
        assert_eq!(ex.query_balance().await.unwrap().equity, dec!(10099));

        let ack = ex.place_order(&sell(dec!(10)).reduce_only()).await.unwrap();
        assert_eq!(ack.fee, dec!(1.1));
        assert_eq!(ex.balance().await, dec!(10097.9));
        assert!(ex.query_position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reduce_only_caps_and_rejects() {
        let ex = exchange();
        ex.update_price("BTCUSDT", dec!(100)).await;

        let err = ex.place_order(&sell(dec!(1)).reduce_only()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));

        ex.place_order(&buy(dec!(2))).await.unwrap();
        let ack = ex.place_order(&sell(dec!(5)).reduce_only()).await.unwrap();
        assert_eq!(ack.status, OrderStatus::PartiallyFilled);
        assert_eq!(ack.filled_size, dec!(2));
        assert!(ex.query_position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_adding_averages_entry_and_overflow_flips() {
        let ex = exchange();
        ex.update_price("BTCUSDT", dec!(100)).await;
        ex.place_order(&buy(dec!(1))).await.unwrap();
        ex.update_price("BTCUSDT", dec!(200)).await;
        ex.place_order(&buy(dec!(1))).await.unwrap();

        let pos = ex.query_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(pos.entry_price, dec!(150));
        assert_eq!(pos.size, dec!(2));

        ex.place_order(&sell(dec!(3))).await.unwrap();
        let pos = ex.query_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(pos.size, dec!(1));
        assert_eq!(pos.entry_price, dec!(200));
    }

    #[tokio::test]
    async fn test_slippage_moves_against_taker() {
        let ex = SimulatedExchange::new(
            dec!(10000),
            FeeConfig::default(),
            SlippageConfig {
                model: SlippageModel::Fixed,
                base_slippage_pct: dec!(0.01),
                ..Default::default()
            },
        );
        ex.update_price("BTCUSDT", dec!(100)).await;
        assert_eq!(ex.place_order(&buy(dec!(1))).await.unwrap().avg_price, dec!(101));
        assert_eq!(ex.place_order(&sell(dec!(1))).await.unwrap().avg_price, dec!(99));
    }

    #[tokio::test]
    async fn test_insufficient_margin() {
        let ex = exchange();
        ex.update_price("BTCUSDT", dec!(100)).await;
        let err = ex.place_order(&buy(dec!(200))).await.unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientBalance(_)));
        assert_eq!(ex.balance().await, dec!(10000));
    }

    #[tokio::test]
    async fn test_unpriced_symbol_and_cancel() {
        let ex = exchange();
        assert!(matches!(
            ex.place_order(&buy(dec!(1))).await,
            Err(GatewayError::Rejected(_))
        ));
        assert!(matches!(
            ex.cancel_order("sim-1").await,
            Err(GatewayError::NotFound(_))
        ));
    }
}
