// Rolling per-coin NATR history and the shock feature derived from it.

use std::collections::{HashMap, VecDeque};

const RETENTION_MS: u64 = 60 * 60 * 1000;

/// Sliding one-hour window of `(timestamp, natr)` samples per coin.
#[derive(Debug, Default)]
pub struct ContextFeatures {
    natr_history: HashMap<String, VecDeque<(u64, f64)>>,
}

impl ContextFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_natr_history(&mut self, coin: &str, now_ms: u64, natr: f64) {
        let deque = self
            .natr_history
            .entry(coin.to_ascii_uppercase())
            .or_default();
        deque.push_back((now_ms, natr));
        let cutoff = now_ms.saturating_sub(RETENTION_MS);
        while let Some(&(ts, _)) = deque.front() {
            if ts < cutoff {
                deque.pop_front();
            } else {
                break;
            }
        }
    }

    /// Σ|natr_i − natr_{i−1}| over samples within `window_ms` of `now_ms`.
    /// 0 with fewer than two samples in the window.
    pub fn natr_shock(&self, coin: &str, now_ms: u64, window_ms: u64) -> f64 {
        let Some(deque) = self.natr_history.get(&coin.to_ascii_uppercase()) else {
            return 0.0;
        };
        let cutoff = now_ms.saturating_sub(window_ms);
        let mut prev: Option<f64> = None;
        let mut shock = 0.0;
        let mut samples = 0usize;
        for &(ts, natr) in deque.iter() {
            if ts < cutoff {
                continue;
            }
            samples += 1;
            if let Some(p) = prev {
                shock += (natr - p).abs();
            }
            prev = Some(natr);
        }
        if samples < 2 {
            0.0
        } else {
            shock
        }
    }
}
