//! Metrics and health HTTP server
//!
//! Serves prometheus text on `/metrics`, a liveness probe on `/health` and the runner
//! status as JSON on `/health/status`.

use crate::metrics::{gather_metrics, register_metrics};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use parking_lot::RwLock;
use qtrader_core::{MetricsConfig, RunnerStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Runner status shared with the HTTP handlers
pub type StatusHandle = Arc<RwLock<RunnerStatus>>;

/// Health and metrics server
pub struct HealthServer {
    bind_address: String,
    status: StatusHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthServer {
    pub fn new(
        config: &MetricsConfig,
        status: StatusHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            status,
            shutdown_rx,
        }
    }

    /// Serve until the shutdown signal flips
    pub async fn run(self) -> Result<(), std::io::Error> {
        register_metrics();
        let addr: SocketAddr = self.bind_address.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid bind address {}: {}", self.bind_address, e),
            )
        })?;
        let app = create_router(self.status);

        info!(address = %addr, "Starting metrics server");
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let mut shutdown_rx = self.shutdown_rx;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
                info!("Metrics server shutting down");
            })
            .await
    }

    /// Start the server in a background task
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
        tokio::spawn(self.run())
    }
}

pub fn create_router(status: StatusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
        .route("/health/status", get(status_check))
        .with_state(status)
}

async fn metrics_handler() -> String {
    gather_metrics()
}

/// 200 while running with a connected feed and nothing halted
async fn health_check(State(status): State<StatusHandle>) -> impl IntoResponse {
    if status.read().is_healthy() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED")
    }
}

async fn status_check(State(status): State<StatusHandle>) -> Json<RunnerStatus> {
    Json(status.read().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtrader_core::TradingMode;

    fn handle() -> StatusHandle {
        Arc::new(RwLock::new(RunnerStatus::new(
            TradingMode::Demo,
            vec!["BTCUSDT".to_string()],
        )))
    }

    #[tokio::test]
    async fn test_health_follows_runner_status() {
        let status = handle();
        let response = health_check(State(Arc::clone(&status))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        {
            let mut s = status.write();
            s.running = true;
            s.feed_connected = true;
        }
        let response = health_check(State(Arc::clone(&status))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_body() {
        let status = handle();
        status.write().metrics.ticks = 12;
        let Json(body) = status_check(State(status)).await;
        assert_eq!(body.metrics.ticks, 12);
        assert_eq!(body.symbols, vec!["BTCUSDT".to_string()]);
    }

    #[tokio::test]
    async fn test_bad_bind_address() {
        let (_tx, rx) = watch::channel(false);
        let config = MetricsConfig {
            enabled: true,
            bind_address: "not an address".to_string(),
        };
        let err = HealthServer::new(&config, handle(), rx).run().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
