//! Historical tick loading from JSONL or CSV tapes

use crate::error::{BacktestError, Result};
use chrono::{DateTime, TimeZone, Utc};
use qtrader_core::{Symbol, Tick};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Loads a recorded tick tape
///
/// JSONL tapes hold one serialized `Tick` per line. CSV tapes use the columns
/// `timestamp,symbol,price[,volume]` with an optional header row; timestamps are
/// RFC 3339 or integer epoch milliseconds.
#[derive(Debug, Clone, Default)]
pub struct TapeLoader {
    symbols: Vec<Symbol>,
}

impl TapeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only ticks for these symbols
    pub fn with_symbols(mut self, symbols: &[Symbol]) -> Self {
        self.symbols = symbols.to_vec();
        self
    }

    /// Load and time-order the tape at `path`
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Vec<Tick>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);

        let ticks = if is_csv {
            self.parse_csv(&content)?
        } else {
            self.parse_jsonl(&content)?
        };

        info!(path = %path.display(), count = ticks.len(), "Loaded tape");
        Ok(ticks)
    }

    pub fn parse_jsonl(&self, content: &str) -> Result<Vec<Tick>> {
        let mut ticks = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let tick: Tick = serde_json::from_str(line).map_err(|e| BacktestError::ParseError {
                line: idx + 1,
                message: e.to_string(),
            })?;
            ticks.push(tick);
        }
        self.finish(ticks)
    }

    pub fn parse_csv(&self, content: &str) -> Result<Vec<Tick>> {
        let mut ticks = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || (idx == 0 && line.starts_with("timestamp")) {
                continue;
            }
            ticks.push(parse_csv_row(line).map_err(|message| BacktestError::ParseError {
                line: idx + 1,
                message,
            })?);
        }
        self.finish(ticks)
    }

    fn finish(&self, mut ticks: Vec<Tick>) -> Result<Vec<Tick>> {
        if !self.symbols.is_empty() {
            ticks.retain(|t| self.symbols.contains(&t.symbol));
        }
        if ticks.is_empty() {
            return Err(BacktestError::NoData);
        }
        // stable: ticks sharing a timestamp keep file order
        ticks.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(ticks)
    }
}

fn parse_csv_row(line: &str) -> std::result::Result<Tick, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 {
        return Err(format!("expected at least 3 columns, found {}", fields.len()));
    }

    let timestamp = parse_timestamp(fields[0])?;
    let symbol = fields[1];
    if symbol.is_empty() {
        return Err("empty symbol".to_string());
    }
    let price = Decimal::from_str(fields[2]).map_err(|e| format!("price: {}", e))?;
    if price <= Decimal::ZERO {
        return Err(format!("non-positive price {}", price));
    }
    let volume = match fields.get(3) {
        Some(v) if !v.is_empty() => Decimal::from_str(v).map_err(|e| format!("volume: {}", e))?,
        _ => Decimal::ZERO,
    };

    Ok(Tick::new(symbol, price, timestamp).with_volume(volume))
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| format!("timestamp out of range: {}", raw));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("timestamp: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_csv_with_header_sorted_by_time() {
        let csv = "timestamp,symbol,price,volume\n\
                   1704067202000,BTCUSDT,42010.5,1.2\n\
                   2024-01-01T00:00:01Z,ETHUSDT,2300,\n\
                   1704067200000,BTCUSDT,42000,0.5\n";
        let ticks = TapeLoader::new().parse_csv(csv).unwrap();

        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].price, dec!(42000));
        assert_eq!(ticks[1].symbol, "ETHUSDT");
        assert_eq!(ticks[1].volume, Decimal::ZERO);
        assert_eq!(ticks[2].volume, dec!(1.2));
    }

    #[test]
    fn test_symbol_filter() {
        let csv = "1,BTCUSDT,100\n2,ETHUSDT,10\n3,BTCUSDT,101\n";
        let ticks = TapeLoader::new()
            .with_symbols(&["ETHUSDT".to_string()])
            .parse_csv(csv)
            .unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].price, dec!(10));
    }

    #[test]
    fn test_bad_row_reports_line() {
        let csv = "timestamp,symbol,price\n1,BTCUSDT,100\n2,BTCUSDT,abc\n";
        match TapeLoader::new().parse_csv(csv) {
            Err(BacktestError::ParseError { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_filtered_to_nothing_is_no_data() {
        let csv = "1,BTCUSDT,100\n";
        let result = TapeLoader::new()
            .with_symbols(&["SOLUSDT".to_string()])
            .parse_csv(csv);
        assert!(matches!(result, Err(BacktestError::NoData)));
    }

    #[test]
    fn test_load_jsonl_file() {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        writeln!(
            file,
            r#"{{"symbol":"BTCUSDT","price":"42000","timestamp":"2024-01-01T00:00:00Z"}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"symbol":"BTCUSDT","price":"42001","timestamp":"2024-01-01T00:00:01Z","volume":"2"}}"#
        )
        .unwrap();

        let ticks = TapeLoader::new().load(file.path()).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[1].volume, dec!(2));
    }
}
