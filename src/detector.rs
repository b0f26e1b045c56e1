// Large-order screener: flags book levels whose resting value clears the
// configured USD threshold close enough to the mid.

use crate::config::ScreenerCfg;
use crate::types::{BookSide, LargeOrder, OrderBookSnapshot};
use std::collections::HashMap;

pub struct LargeOrderDetector {
    min_order_size_usd: f64,
    max_distance_percent: f64,
    overrides: HashMap<String, f64>,
}

impl LargeOrderDetector {
    pub fn new(cfg: &ScreenerCfg) -> Self {
        Self {
            min_order_size_usd: cfg.min_order_size_usd,
            max_distance_percent: cfg.max_distance_percent,
            overrides: cfg.overrides(),
        }
    }

    pub fn effective_min(&self, coin: &str) -> f64 {
        self.overrides
            .get(&coin.to_ascii_uppercase())
            .copied()
            .unwrap_or(self.min_order_size_usd)
    }

    /// Scan one snapshot. Emits every qualifying level on both sides; no
    /// dedup here — that is the alert sink's and the trading gates' job.
    pub fn scan(&self, snapshot: &OrderBookSnapshot) -> Vec<LargeOrder> {
        let Some(mid) = snapshot.mid() else {
            return Vec::new();
        };
        if mid <= 0.0 {
            return Vec::new();
        }
        let min_value = self.effective_min(&snapshot.coin);
        let mut out = Vec::new();
        for (side, levels) in [
            (BookSide::Bid, &snapshot.bids),
            (BookSide::Ask, &snapshot.asks),
        ] {
            for level in levels.iter() {
                let value_usd = level.price * level.size;
                let distance_percent = match side {
                    BookSide::Bid => (mid - level.price) / mid * 100.0,
                    BookSide::Ask => (level.price - mid) / mid * 100.0,
                };
                if value_usd >= min_value
                    && distance_percent >= 0.0
                    && distance_percent <= self.max_distance_percent
                {
                    out.push(LargeOrder {
                        coin: snapshot.coin.clone(),
                        side,
                        price: level.price,
                        size: level.size,
                        value_usd,
                        distance_percent,
                        timestamp: snapshot.time,
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookLevel;

    fn screener(min: f64, dist: f64, overrides: &str) -> LargeOrderDetector {
        LargeOrderDetector::new(&ScreenerCfg {
            min_order_size_usd: min,
            max_distance_percent: dist,
            alert_cooldown_ms: 0,
            min_order_size_overrides: overrides.to_string(),
        })
    }

    fn snap(coin: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBookSnapshot {
        OrderBookSnapshot {
            coin: coin.to_string(),
            time: 1,
            bids: bids.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
            asks: asks.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
        }
    }

    #[test]
    fn flags_big_bid_near_mid() {
        // Scenario from the screener contract: best-bid value 3M at 0.010%.
        let det = screener(2_000_000.0, 0.2, "");
        let snapshot = snap(
            "BTC",
            &[(50000.0, 60.0), (49995.0, 1.0)],
            &[(50010.0, 1.0), (50015.0, 1.0)],
        );
        let found = det.scan(&snapshot);
        assert_eq!(found.len(), 1);
        let order = &found[0];
        assert_eq!(order.side, BookSide::Bid);
        assert_eq!(order.price, 50000.0);
        assert_eq!(order.value_usd, 3_000_000.0);
        assert!((order.distance_percent - 0.009999).abs() < 1e-4);
    }

    #[test]
    fn empty_side_emits_nothing() {
        let det = screener(1.0, 10.0, "");
        let snapshot = snap("BTC", &[(50000.0, 60.0)], &[]);
        assert!(det.scan(&snapshot).is_empty());
    }

    #[test]
    fn distance_beyond_max_is_rejected() {
        let det = screener(1000.0, 0.1, "");
        // Bid 1% below mid: large value but too far.
        let snapshot = snap("ETH", &[(990.0, 1000.0)], &[(1010.0, 1000.0)]);
        assert!(det.scan(&snapshot).is_empty());
    }

    #[test]
    fn per_coin_override_applies() {
        let det = screener(1_000.0, 1.0, "ETH:5000000");
        let snapshot = snap("ETH", &[(1000.0, 100.0)], &[(1000.5, 100.0)]);
        // 100k value clears the global floor but not the ETH override.
        assert!(det.scan(&snapshot).is_empty());
        assert_eq!(det.effective_min("ETH"), 5_000_000.0);
        assert_eq!(det.effective_min("BTC"), 1_000.0);
    }

    #[test]
    fn both_sides_can_emit() {
        let det = screener(50_000.0, 1.0, "");
        let snapshot = snap("SOL", &[(100.0, 1000.0)], &[(100.5, 1000.0)]);
        let found = det.scan(&snapshot);
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|o| o.side == BookSide::Bid));
        assert!(found.iter().any(|o| o.side == BookSide::Ask));
    }
}
