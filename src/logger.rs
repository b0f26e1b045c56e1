// Operational event log: JSON-line records through a bounded channel into a
// background writer with daily files, a per-file size cap and bounded
// retention. A slow disk drops events instead of blocking the engine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::warn;

const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;
const MAX_FILES: usize = 20;
const CHANNEL_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type")]
pub enum LogEvent {
    #[serde(rename = "large_order")]
    LargeOrderSeen {
        timestamp: u64,
        coin: String,
        side: String,
        price: f64,
        value_usd: f64,
        distance_percent: f64,
    },
    #[serde(rename = "position_opened")]
    PositionOpened {
        timestamp: u64,
        coin: String,
        side: String,
        entry_price: f64,
        size_usd: f64,
        anchor_price: f64,
        anchor_value_usd: f64,
        policy_reason: String,
    },
    #[serde(rename = "position_closed")]
    PositionClosed {
        timestamp: u64,
        coin: String,
        side: String,
        entry_price: f64,
        exit_price: f64,
        size_usd: f64,
        pnl_usd: f64,
        pnl_percent: f64,
        reason: String,
    },
    #[serde(rename = "order_placed")]
    OrderPlaced {
        timestamp: u64,
        coin: String,
        order_id: String,
        side: String,
        price: f64,
        size_usd: f64,
        purpose: String,
    },
    #[serde(rename = "order_cancelled")]
    OrderCancelled {
        timestamp: u64,
        coin: String,
        order_id: String,
        reason: String,
    },
    #[serde(rename = "trade_rejected")]
    TradeRejected {
        timestamp: u64,
        coin: String,
        reason: String,
    },
    #[serde(rename = "emergency_stop")]
    EmergencyStop {
        timestamp: u64,
        coin: String,
        pnl_usd: f64,
        max_risk_usd: f64,
    },
}

/// Size-and-date rotating JSON-line writer. Synchronous; lives inside the
/// logger's background task.
pub struct RotatingWriter {
    dir: PathBuf,
    current: Option<(PathBuf, File, u64)>,
    current_day: String,
    part: u32,
}

impl RotatingWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: None,
            current_day: String::new(),
            part: 0,
        }
    }

    // Zero-padded part keeps lexicographic order chronological, which the
    // retention sweep relies on.
    fn file_name(day: &str, part: u32) -> String {
        format!("events_{day}.{part:03}.jsonl")
    }

    pub fn write_line(&mut self, line: &str, now: DateTime<Utc>) -> std::io::Result<()> {
        let day = now.format("%Y-%m-%d").to_string();
        if day != self.current_day {
            self.current_day = day;
            self.part = 0;
            self.current = None;
        }

        let needed = line.len() as u64 + 1;
        if let Some((_, _, written)) = &self.current {
            if written + needed > MAX_FILE_BYTES {
                self.part += 1;
                self.current = None;
            }
        }

        if self.current.is_none() {
            std::fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(Self::file_name(&self.current_day, self.part));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let written = file.metadata().map(|m| m.len()).unwrap_or(0);
            self.current = Some((path, file, written));
            enforce_retention(&self.dir, MAX_FILES);
        }

        let (_, file, written) = self.current.as_mut().expect("writer just opened");
        writeln!(file, "{line}")?;
        *written += needed;
        Ok(())
    }
}

/// Delete the oldest event files beyond `max_files`. Name order is
/// chronological by construction.
fn enforce_retention(dir: &Path, max_files: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("events_") && n.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    if files.len() <= max_files {
        return;
    }
    files.sort();
    let excess = files.len() - max_files;
    for path in files.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(file = %path.display(), error = %e, "failed to prune old event log");
        }
    }
}

/// Channel-fed logger handle. Cloneable; dropping every handle stops the
/// writer task after it drains.
#[derive(Clone)]
pub struct EventLogger {
    tx: Option<mpsc::Sender<LogEvent>>,
}

impl EventLogger {
    pub fn new(dir: impl Into<PathBuf>) -> (Self, tokio::task::JoinHandle<()>) {
        let dir = dir.into();
        let (tx, mut rx) = mpsc::channel::<LogEvent>(CHANNEL_BUFFER_SIZE);
        let handle = tokio::spawn(async move {
            let mut writer = RotatingWriter::new(dir);
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if let Err(e) = writer.write_line(&json, Utc::now()) {
                            warn!(error = %e, "event log write failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "event log serialize failed"),
                }
            }
        });
        (Self { tx: Some(tx) }, handle)
    }

    /// A logger that discards everything; used when no log dir is wanted.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Non-blocking; events are dropped when the writer is saturated.
    pub fn log(&self, event: LogEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}
