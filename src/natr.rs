// Incremental Wilder ATR → NATR% from 5-minute candles, one state per coin.

use crate::types::Candle;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct NatrState {
    period: usize,
    tr_history: Vec<f64>,
    last_close: Option<f64>,
    atr: Option<f64>,
    last_natr: Option<f64>,
}

impl NatrState {
    fn new(period: usize) -> Self {
        Self {
            period,
            tr_history: Vec::new(),
            last_close: None,
            atr: None,
            last_natr: None,
        }
    }

    fn update(&mut self, candle: &Candle) -> Option<f64> {
        let tr = match self.last_close {
            None => candle.high - candle.low,
            Some(prev_close) => (candle.high - candle.low)
                .max((candle.high - prev_close).abs())
                .max((candle.low - prev_close).abs()),
        };
        self.last_close = Some(candle.close);

        match self.atr {
            None => {
                self.tr_history.push(tr);
                if self.tr_history.len() < self.period {
                    return None;
                }
                // Seed ATR with the arithmetic mean of the first `period` TRs.
                let seed = self.tr_history.iter().sum::<f64>() / self.period as f64;
                self.tr_history.clear();
                self.atr = Some(seed);
            }
            Some(prev_atr) => {
                let atr = (prev_atr * (self.period as f64 - 1.0) + tr) / self.period as f64;
                self.atr = Some(atr);
            }
        }

        let atr = self.atr?;
        let close = candle.close;
        if close <= 0.0 {
            return None;
        }
        let natr = atr / close * 100.0;
        if !natr.is_finite() || natr <= 0.0 {
            return None;
        }
        self.last_natr = Some(natr);
        Some(natr)
    }
}

/// Per-coin NATR calculator. Coin keys are uppercased.
#[derive(Debug, Default)]
pub struct NatrCalculator {
    period: usize,
    states: HashMap<String, NatrState>,
}

impl NatrCalculator {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            states: HashMap::new(),
        }
    }

    /// Advance the coin's state with a closed candle. Returns the new NATR,
    /// or None while seeding (or when the value would be degenerate).
    pub fn update(&mut self, coin: &str, candle: &Candle) -> Option<f64> {
        let key = coin.to_ascii_uppercase();
        let period = self.period;
        self.states
            .entry(key)
            .or_insert_with(|| NatrState::new(period))
            .update(candle)
    }

    /// Last published NATR without advancing state.
    pub fn get_natr(&self, coin: &str) -> Option<f64> {
        self.states
            .get(&coin.to_ascii_uppercase())
            .and_then(|s| s.last_natr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp_ms: 0,
            open: close,
            high,
            low,
            close,
        }
    }

    #[test]
    fn returns_none_until_seeded() {
        let mut calc = NatrCalculator::new(3);
        assert_eq!(calc.update("btc", &candle(101.0, 99.0, 100.0)), None);
        assert_eq!(calc.update("BTC", &candle(102.0, 100.0, 101.0)), None);
        assert!(calc.get_natr("BTC").is_none());
        // Third candle seeds and publishes.
        assert!(calc.update("BTC", &candle(103.0, 101.0, 102.0)).is_some());
    }

    #[test]
    fn seed_value_is_mean_of_true_ranges() {
        let mut calc = NatrCalculator::new(2);
        // TR1 = 2.0 (no previous close).
        calc.update("ETH", &candle(101.0, 99.0, 100.0));
        // TR2 = max(2.0, |103-100|, |101-100|) = 3.0; seed ATR = 2.5.
        let natr = calc.update("ETH", &candle(103.0, 101.0, 102.0)).unwrap();
        assert!((natr - 2.5 / 102.0 * 100.0).abs() < 1e-12);
    }

    #[test]
    fn steady_state_uses_wilder_smoothing() {
        let mut calc = NatrCalculator::new(2);
        calc.update("SOL", &candle(101.0, 99.0, 100.0));
        calc.update("SOL", &candle(103.0, 101.0, 102.0)); // ATR = 2.5
        // TR = max(4, |106-102|, |102-102|) = 4; ATR = (2.5*1 + 4)/2 = 3.25.
        let natr = calc.update("SOL", &candle(106.0, 102.0, 104.0)).unwrap();
        assert!((natr - 3.25 / 104.0 * 100.0).abs() < 1e-12);
        assert_eq!(calc.get_natr("sol"), Some(natr));
    }

    #[test]
    fn suppresses_degenerate_output() {
        let mut calc = NatrCalculator::new(1);
        // Zero range and zero close must never publish.
        assert_eq!(calc.update("X", &candle(0.0, 0.0, 0.0)), None);
        assert!(calc.get_natr("X").is_none());
    }

    #[test]
    fn get_natr_does_not_advance_state() {
        let mut calc = NatrCalculator::new(1);
        let first = calc.update("BTC", &candle(101.0, 99.0, 100.0)).unwrap();
        assert_eq!(calc.get_natr("BTC"), Some(first));
        assert_eq!(calc.get_natr("BTC"), Some(first));
    }
}
