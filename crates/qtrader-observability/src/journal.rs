//! Append-only JSON lines journal of trades, orders and risk events

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qtrader_core::{ExecutionObserver, JournalConfig, OrderRequest, RiskEvent, TradeRecord};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalEventType {
    Trade,
    Order,
    Risk,
    Error,
}

#[derive(Debug, Serialize)]
struct JournalLine<'a> {
    timestamp: DateTime<Utc>,
    session_id: &'a str,
    event_type: JournalEventType,
    data: Value,
}

/// One JSON object per line: `{timestamp, session_id, event_type, data}`
pub struct TradeJournal {
    path: PathBuf,
    session_id: String,
    file: Mutex<File>,
}

impl TradeJournal {
    /// Open (or create) the journal file, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            session_id: format!("session_{}", Utc::now().timestamp()),
            path,
            file: Mutex::new(file),
        })
    }

    /// Journal configured by `config`, or `None` when disabled
    pub fn from_config(config: &JournalConfig) -> std::io::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::open(&config.path).map(Some)
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append one event; write failures are logged and dropped
    pub fn log_event(&self, event_type: JournalEventType, data: Value) {
        let line = JournalLine {
            timestamp: Utc::now(),
            session_id: &self.session_id,
            event_type,
            data,
        };
        let mut encoded = match serde_json::to_string(&line) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode journal line");
                return;
            }
        };
        encoded.push('\n');

        let mut file = self.file.lock();
        if let Err(e) = file.write_all(encoded.as_bytes()).and_then(|_| file.flush()) {
            warn!(path = %self.path.display(), error = %e, "Failed to write journal");
            return;
        }
        debug!(event_type = ?event_type, "Journaled event");
    }

    pub fn log_error(&self, message: &str) {
        self.log_event(JournalEventType::Error, json!({ "message": message }));
    }
}

impl ExecutionObserver for TradeJournal {
    fn on_trade_closed(&self, trade: &TradeRecord) {
        match serde_json::to_value(trade) {
            Ok(mut data) => {
                data["net_pnl"] = json!(trade.net_pnl());
                self.log_event(JournalEventType::Trade, data);
            }
            Err(e) => warn!(error = %e, "Failed to encode trade"),
        }
    }

    fn on_order(&self, request: &OrderRequest, status: &str) {
        self.log_event(
            JournalEventType::Order,
            json!({
                "request_id": request.request_id,
                "symbol": request.symbol,
                "side": request.side.to_string(),
                "size": request.size,
                "reduce_only": request.reduce_only,
                "status": status,
            }),
        );
    }

    fn on_risk_event(&self, event: &RiskEvent) {
        match serde_json::to_value(event) {
            Ok(data) => self.log_event(JournalEventType::Risk, data),
            Err(e) => warn!(error = %e, "Failed to encode risk event"),
        }
    }
}
