// Append-only daily CSV of closed trades: trades_YYYY-MM-DD.csv with a fixed
// header. Quoting follows CSV convention (fields with commas, quotes or
// newlines are wrapped, inner quotes doubled).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub closed_at: String,
    pub coin: String,
    pub side: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size_usd: f64,
    pub pnl_usd: f64,
    pub pnl_percent: f64,
    pub reason: String,
    pub anchor_price: f64,
    pub anchor_value_usd: f64,
    pub held_secs: u64,
}

pub struct TradeLog {
    dir: PathBuf,
}

impl TradeLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, now: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("trades_{}.csv", now.format("%Y-%m-%d")))
    }

    /// Append one closed trade. Failures are logged, never fatal: a broken
    /// disk must not stop trading.
    pub fn record(&self, trade: &ClosedTrade) {
        if let Err(e) = self.write(trade, Utc::now()) {
            warn!(error = %e, coin = %trade.coin, "failed to write trade log");
        }
    }

    fn write(&self, trade: &ClosedTrade, now: DateTime<Utc>) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context("create trade log dir")?;
        let path = self.file_for(now);
        let needs_header = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("open trade log file")?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(trade).context("serialize trade row")?;
        writer.flush().context("flush trade log")?;
        Ok(())
    }
}

/// List of day-files currently present, oldest first. Used by tests and the
/// startup banner.
pub fn existing_day_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("trades_") && n.ends_with(".csv"))
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("trade_log_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn trade(coin: &str, reason: &str) -> ClosedTrade {
        ClosedTrade {
            closed_at: "2026-08-02T10:00:00Z".into(),
            coin: coin.into(),
            side: "long".into(),
            entry_price: 50000.0,
            exit_price: 50250.0,
            size_usd: 1000.0,
            pnl_usd: 5.0,
            pnl_percent: 0.5,
            reason: reason.into(),
            anchor_price: 50000.0,
            anchor_value_usd: 3_000_000.0,
            held_secs: 120,
        }
    }

    #[test]
    fn writes_header_once_and_appends() {
        let dir = temp_dir("append");
        let log = TradeLog::new(&dir);
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 0).unwrap();
        log.write(&trade("BTC", "tp_all_hit"), now).unwrap();
        log.write(&trade("ETH", "anchor_value_below_threshold"), now)
            .unwrap();

        let path = log.file_for(now);
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("closed_at,coin,side,entry_price"));
        assert!(lines[1].contains("BTC"));
        assert!(lines[2].contains("ETH"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn quotes_fields_containing_commas_and_quotes() {
        let dir = temp_dir("quoting");
        let log = TradeLog::new(&dir);
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 0).unwrap();
        log.write(&trade("BTC", "weird,\"reason\""), now).unwrap();

        let content = std::fs::read_to_string(log.file_for(now)).unwrap();
        assert!(content.contains("\"weird,\"\"reason\"\"\""));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn day_rollover_creates_new_file() {
        let dir = temp_dir("rollover");
        let log = TradeLog::new(&dir);
        let day1 = Utc.with_ymd_and_hms(2026, 8, 2, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 8, 3, 0, 1, 0).unwrap();
        log.write(&trade("BTC", "tp_hit"), day1).unwrap();
        log.write(&trade("BTC", "tp_hit"), day2).unwrap();

        let files = existing_day_files(&dir);
        assert_eq!(files.len(), 2);
        assert!(files[0].to_string_lossy().contains("2026-08-02"));
        assert!(files[1].to_string_lossy().contains("2026-08-03"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
