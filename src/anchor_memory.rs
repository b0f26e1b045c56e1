// Persistent per-anchor trade statistics. One JSON file, rewritten whole on
// every update; load-on-startup, absent file = empty.

use crate::types::{round_anchor_price, BookSide};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Identity of an anchor. Price is canonically rounded to 1e-4 so float noise
/// from different snapshots collapses to one key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorId {
    pub coin: String,
    price_key: i64,
    pub side: BookSide,
}

impl AnchorId {
    pub fn new(coin: &str, price: f64, side: BookSide) -> Self {
        Self {
            coin: coin.to_ascii_uppercase(),
            price_key: (price * 1e4).round() as i64,
            side,
        }
    }

    pub fn price(&self) -> f64 {
        self.price_key as f64 / 1e4
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorStats {
    pub coin: String,
    pub anchor_price: f64,
    pub side: BookSide,
    pub total_trades: u32,
    pub win_trades: u32,
    pub loss_trades: u32,
    pub first_trade_at: u64,
    pub last_trade_at: u64,
    pub total_pnl_usd: f64,
    pub avg_pnl_percent: f64,
    pub last_trade_size: f64,
}

pub struct AnchorMemory {
    path: PathBuf,
    stats: HashMap<AnchorId, AnchorStats>,
}

impl AnchorMemory {
    /// Load from `path`; a missing file is an empty memory, a corrupt file is
    /// logged and treated as empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stats = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<AnchorStats>>(&content) {
                Ok(entries) => {
                    info!(file = %path.display(), entries = entries.len(), "anchor memory loaded");
                    entries
                        .into_iter()
                        .map(|s| (AnchorId::new(&s.coin, s.anchor_price, s.side), s))
                        .collect()
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "anchor memory unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, stats }
    }

    pub fn get(&self, id: &AnchorId) -> Option<&AnchorStats> {
        self.stats.get(id)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// True for unknown anchors, or while the anchor has fewer than
    /// `max_wins` winning trades.
    pub fn can_trade(&self, id: &AnchorId, max_wins: u32) -> bool {
        match self.stats.get(id) {
            None => true,
            Some(s) => s.win_trades < max_wins,
        }
    }

    /// Fold a closed trade into the anchor's stats and persist. Zero-PnL
    /// trades count in neither the win nor the loss column. Persist failure
    /// is logged and the in-memory state kept.
    pub fn record_trade(
        &mut self,
        id: &AnchorId,
        pnl_usd: f64,
        pnl_percent: f64,
        size_usd: f64,
        now_ms: u64,
    ) {
        let entry = self.stats.entry(id.clone()).or_insert_with(|| AnchorStats {
            coin: id.coin.clone(),
            anchor_price: round_anchor_price(id.price()),
            side: id.side,
            total_trades: 0,
            win_trades: 0,
            loss_trades: 0,
            first_trade_at: now_ms,
            last_trade_at: now_ms,
            total_pnl_usd: 0.0,
            avg_pnl_percent: 0.0,
            last_trade_size: 0.0,
        });

        entry.total_trades += 1;
        if pnl_usd > 0.0 {
            entry.win_trades += 1;
        } else if pnl_usd < 0.0 {
            entry.loss_trades += 1;
        }
        entry.total_pnl_usd += pnl_usd;
        // Running mean over all recorded trades.
        let n = entry.total_trades as f64;
        entry.avg_pnl_percent += (pnl_percent - entry.avg_pnl_percent) / n;
        entry.last_trade_at = now_ms.max(entry.first_trade_at);
        entry.last_trade_size = size_usd;

        if let Err(e) = self.persist() {
            warn!(file = %self.path.display(), error = %e, "failed to persist anchor memory");
        }
    }

    /// Whole-document rewrite: serialize everything to a temp file next to
    /// the target and rename it into place.
    fn persist(&self) -> Result<()> {
        let mut entries: Vec<&AnchorStats> = self.stats.values().collect();
        entries.sort_by(|a, b| {
            (&a.coin, a.side as u8)
                .cmp(&(&b.coin, b.side as u8))
                .then(a.anchor_price.total_cmp(&b.anchor_price))
        });
        let json = serde_json::to_string_pretty(&entries)?;
        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, json).context("write anchor memory temp file")?;
        std::fs::rename(&tmp, &self.path).context("replace anchor memory file")?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "anchor_memory_{tag}_{}.json",
            std::process::id()
        ))
    }

    #[test]
    fn identity_collapses_float_noise() {
        let a = AnchorId::new("btc", 50000.00001, BookSide::Bid);
        let b = AnchorId::new("BTC", 50000.0, BookSide::Bid);
        assert_eq!(a, b);
        assert_ne!(a, AnchorId::new("BTC", 50000.0, BookSide::Ask));
    }

    #[test]
    fn win_loss_classification_and_invariants() {
        let path = temp_file("classify");
        let _ = std::fs::remove_file(&path);
        let mut mem = AnchorMemory::load(&path);
        let id = AnchorId::new("ETH", 3000.0, BookSide::Bid);

        mem.record_trade(&id, 10.0, 1.0, 500.0, 100);
        mem.record_trade(&id, -5.0, -0.5, 500.0, 200);
        mem.record_trade(&id, 0.0, 0.0, 500.0, 300);

        let s = mem.get(&id).unwrap();
        assert_eq!(s.total_trades, 3);
        assert_eq!(s.win_trades, 1);
        assert_eq!(s.loss_trades, 1);
        assert!(s.win_trades + s.loss_trades <= s.total_trades);
        assert_eq!(s.first_trade_at, 100);
        assert_eq!(s.last_trade_at, 300);
        assert!((s.total_pnl_usd - 5.0).abs() < 1e-12);
        assert!((s.avg_pnl_percent - (1.0 - 0.5 + 0.0) / 3.0).abs() < 1e-12);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn persist_then_reload_round_trips() {
        let path = temp_file("roundtrip");
        let _ = std::fs::remove_file(&path);
        let id = AnchorId::new("BTC", 50000.1234, BookSide::Ask);
        {
            let mut mem = AnchorMemory::load(&path);
            mem.record_trade(&id, 25.0, 2.5, 1000.0, 42);
        }
        let reloaded = AnchorMemory::load(&path);
        let s = reloaded.get(&id).expect("entry survives reload");
        assert_eq!(s.total_trades, 1);
        assert_eq!(s.win_trades, 1);
        assert_eq!(s.last_trade_size, 1000.0);
        assert_eq!(s.anchor_price, 50000.1234);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn can_trade_gates_on_win_count() {
        let path = temp_file("cantrade");
        let _ = std::fs::remove_file(&path);
        let mut mem = AnchorMemory::load(&path);
        let id = AnchorId::new("SOL", 150.0, BookSide::Bid);

        assert!(mem.can_trade(&id, 1));
        mem.record_trade(&id, 3.0, 0.3, 100.0, 1);
        assert!(!mem.can_trade(&id, 1));
        assert!(mem.can_trade(&id, 2));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty_memory() {
        let mem = AnchorMemory::load(temp_file("missing_never_created"));
        assert!(mem.is_empty());
    }
}
