// Entry risk gates. Pure checks; the trading module applies the verdict.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    Ok,
    MaxOpenPositions,
    DuplicateCoin,
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    pub max_open_positions: usize,
}

impl RiskManager {
    pub fn new(max_open_positions: usize) -> Self {
        Self { max_open_positions }
    }

    /// Gate a prospective entry against the current book of open and pending
    /// coins. Daily loss caps would slot in here as further verdicts.
    pub fn can_open_position(
        &self,
        coin: &str,
        open_coins: &HashSet<String>,
        pending_coins: &HashSet<String>,
    ) -> RiskVerdict {
        if open_coins.contains(coin) || pending_coins.contains(coin) {
            return RiskVerdict::DuplicateCoin;
        }
        if open_coins.len() + pending_coins.len() >= self.max_open_positions {
            return RiskVerdict::MaxOpenPositions;
        }
        RiskVerdict::Ok
    }
}
