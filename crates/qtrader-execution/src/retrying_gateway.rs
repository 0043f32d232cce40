//! Gateway calls with timeout and bounded retry

use qtrader_core::{
    Account, Backoff, ExchangeGateway, ExecutionConfig, ExecutionError, ExecutionObserver,
    GatewayError, GatewayPosition, OrderAck, OrderRequest,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Outcome of a gateway call that did not succeed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallFailure {
    /// Timed out; the call may have taken effect
    #[error("outcome unknown: {0}")]
    Unknown(GatewayError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: GatewayError },

    #[error(transparent)]
    Failed(GatewayError),
}

impl CallFailure {
    pub fn into_execution_error(self, request_id: &str) -> ExecutionError {
        match self {
            CallFailure::Unknown(_) => ExecutionError::UnknownOrderOutcome {
                request_id: request_id.to_string(),
            },
            CallFailure::Exhausted { attempts, last } => ExecutionError::RetryExhausted {
                attempts,
                message: last.to_string(),
            },
            CallFailure::Failed(e) => ExecutionError::Gateway(e),
        }
    }

    /// Error for a call that placed no order; a timeout is just a gateway error
    pub fn into_query_error(self) -> ExecutionError {
        match self {
            CallFailure::Unknown(e) | CallFailure::Failed(e) => ExecutionError::Gateway(e),
            CallFailure::Exhausted { attempts, last } => ExecutionError::RetryExhausted {
                attempts,
                message: last.to_string(),
            },
        }
    }
}

/// Wraps an [`ExchangeGateway`] with per-call timeouts and jittered backoff
///
/// Only transient errors are retried. A timed out order placement is never retried
/// blindly: it is reported as [`CallFailure::Unknown`] so the caller reconciles first.
pub struct RetryingGateway<G> {
    inner: G,
    config: ExecutionConfig,
    rng: Mutex<StdRng>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl<G: ExchangeGateway> RetryingGateway<G> {
    pub fn new(inner: G, config: ExecutionConfig) -> Self {
        Self {
            inner,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            observers: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.push(observer);
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, CallFailure> {
        self.call("place_order", true, || self.inner.place_order(request))
            .await
    }

    pub async fn query_position(
        &self,
        symbol: &str,
    ) -> Result<Option<GatewayPosition>, CallFailure> {
        self.call("query_position", false, || self.inner.query_position(symbol))
            .await
    }

    pub async fn query_balance(&self) -> Result<Account, CallFailure> {
        self.call("query_balance", false, || self.inner.query_balance())
            .await
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<(), CallFailure> {
        self.call("set_leverage", false, || {
            self.inner.set_leverage(symbol, leverage)
        })
        .await
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        unknown_on_timeout: bool,
        mut call: F,
    ) -> Result<T, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let call_timeout = self.config.call_timeout();
        let max_attempts = self.config.max_retries.max(1);
        let mut backoff = Backoff::from_millis(self.config.retry_base_ms, self.config.retry_max_ms);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let err = match timeout(call_timeout, call()).await {
                Ok(Ok(value)) => {
                    if attempts > 1 {
                        info!(
                            gateway = self.inner.name(),
                            operation,
                            attempts,
                            "Gateway call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    let e = GatewayError::Timeout(format!(
                        "{} after {}ms",
                        operation,
                        call_timeout.as_millis()
                    ));
                    if unknown_on_timeout {
                        warn!(
                            gateway = self.inner.name(),
                            operation,
                            timeout_ms = call_timeout.as_millis() as u64,
                            "Gateway call timed out, outcome unknown"
                        );
                        return Err(CallFailure::Unknown(e));
                    }
                    e
                }
            };

            if !err.is_transient() {
                warn!(gateway = self.inner.name(), operation, error = %err, "Gateway call failed");
                return Err(CallFailure::Failed(err));
            }

            if attempts >= max_attempts {
                error!(
                    gateway = self.inner.name(),
                    operation,
                    attempts,
                    error = %err,
                    "Gateway call failed after max retries"
                );
                return Err(CallFailure::Exhausted {
                    attempts,
                    last: err,
                });
            }

            let delay: Duration = backoff.next_delay(&mut *self.rng.lock());
            warn!(
                gateway = self.inner.name(),
                operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Gateway call failed, retrying..."
            );
            for observer in &self.observers {
                observer.on_gateway_retry(operation, attempts);
            }
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qtrader_core::{OrderSide, OrderStatus};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    enum Reply {
        Ok,
        Err(GatewayError),
        Hang,
    }

    struct FlakyGateway {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicU32,
    }

    impl FlakyGateway {
        fn with(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            }
        }

        async fn next(&self) -> Result<(), GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().pop_front().unwrap_or(Reply::Ok);
            match reply {
                Reply::Ok => Ok(()),
                Reply::Err(e) => Err(e),
                Reply::Hang => {
                    sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    #[async_trait]
    impl ExchangeGateway for FlakyGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
            self.next().await?;
            Ok(OrderAck {
                order_id: "1".into(),
                request_id: request.request_id.clone(),
                status: OrderStatus::Filled,
                filled_size: request.size,
                avg_price: dec!(100),
                fee: Decimal::ZERO,
            })
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<(), GatewayError> {
            self.next().await
        }

        async fn query_position(&self, _symbol: &str) -> Result<Option<GatewayPosition>, GatewayError> {
            self.next().await.map(|_| None)
        }

        async fn query_balance(&self) -> Result<Account, GatewayError> {
            self.next().await.map(|_| Account::new(dec!(1000)))
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: Decimal) -> Result<(), GatewayError> {
            self.next().await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            max_retries: 3,
            retry_base_ms: 100,
            retry_max_ms: 1_000,
            call_timeout_ms: 500,
            balance_poll_secs: 30,
        }
    }

    fn request() -> OrderRequest {
        OrderRequest::market("qt-BTCUSDT-1", "BTCUSDT", OrderSide::Buy, dec!(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_with_backoff() {
        let gateway = RetryingGateway::new(
            FlakyGateway::with(vec![
                Reply::Err(GatewayError::RateLimited),
                Reply::Err(GatewayError::Network("reset".into())),
            ]),
            config(),
        )
        .with_seed(1);

        let start = Instant::now();
        let ack = gateway.place_order(&request()).await.unwrap();
        assert_eq!(ack.request_id, "qt-BTCUSDT-1");
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_retries() {
        let gateway = RetryingGateway::new(
            FlakyGateway::with(vec![
                Reply::Err(GatewayError::RateLimited),
                Reply::Err(GatewayError::RateLimited),
                Reply::Err(GatewayError::RateLimited),
                Reply::Err(GatewayError::RateLimited),
            ]),
            config(),
        );
        let err = gateway.query_balance().await.unwrap_err();
        assert_eq!(
            err,
            CallFailure::Exhausted {
                attempts: 3,
                last: GatewayError::RateLimited
            }
        );
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_not_retried() {
        let gateway = RetryingGateway::new(
            FlakyGateway::with(vec![Reply::Err(GatewayError::Rejected("qty".into()))]),
            config(),
        );
        let err = gateway.place_order(&request()).await.unwrap_err();
        assert!(matches!(err, CallFailure::Failed(GatewayError::Rejected(_))));
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_timeout_is_unknown_outcome() {
        let gateway = RetryingGateway::new(FlakyGateway::with(vec![Reply::Hang]), config());
        let err = gateway.place_order(&request()).await.unwrap_err();
        assert!(matches!(err, CallFailure::Unknown(GatewayError::Timeout(_))));
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            err.into_execution_error("qt-BTCUSDT-1"),
            ExecutionError::UnknownOrderOutcome {
                request_id: "qt-BTCUSDT-1".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_retried() {
        let gateway = RetryingGateway::new(FlakyGateway::with(vec![Reply::Hang]), config());
        assert_eq!(gateway.query_position("BTCUSDT").await.unwrap(), None);
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 2);
    }
}
