// Abstract execution contract. Two implementations: `paper` (pure in-memory
// state) and `exchange` (Binance USDⓈ-M futures REST).

use crate::types::{now_ms, OrderSide, PositionSide};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPurpose {
    Entry,
    Tp,
}

/// Local view of a resting limit order. `filled` and `cancelled` are sticky
/// terminal states and mutually exclusive.
#[derive(Clone, Debug, Serialize)]
pub struct LimitOrderState {
    pub order_id: String,
    pub coin: String,
    pub price: f64,
    pub size_usd: f64,
    pub contracts: Option<f64>,
    pub side: OrderSide,
    pub purpose: OrderPurpose,
    pub placed_at: u64,
    pub filled: bool,
    pub filled_at: Option<u64>,
    pub cancelled: bool,
    pub cancelled_at: Option<u64>,
}

impl LimitOrderState {
    pub fn new(
        order_id: String,
        coin: &str,
        side: OrderSide,
        price: f64,
        size_usd: f64,
        contracts: Option<f64>,
        purpose: OrderPurpose,
    ) -> Self {
        Self {
            order_id,
            coin: coin.to_string(),
            price,
            size_usd,
            contracts,
            side,
            purpose,
            placed_at: now_ms(),
            filled: false,
            filled_at: None,
            cancelled: false,
            cancelled_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.filled && !self.cancelled
    }

    /// No-op once the order is already terminal.
    pub fn mark_filled(&mut self, at_ms: u64) {
        if self.is_active() {
            self.filled = true;
            self.filled_at = Some(at_ms);
        }
    }

    pub fn mark_cancelled(&mut self, at_ms: u64) {
        if self.is_active() {
            self.cancelled = true;
            self.cancelled_at = Some(at_ms);
        }
    }
}

/// Market-equivalent entry request produced by the trading module.
#[derive(Clone, Debug)]
pub struct EntrySignal {
    pub coin: String,
    pub side: PositionSide,
    pub size_usd: f64,
    /// Price the caller observed (mid); paper fills at this price, live
    /// implementations replace it with the volume-weighted fill average.
    pub reference_price: f64,
}

/// What actually executed for an entry.
#[derive(Clone, Copy, Debug)]
pub struct ExecutedEntry {
    pub price: f64,
    pub size_usd: f64,
    pub contracts: Option<f64>,
}

/// Reduce-only close request. `full` closes drive the post-close
/// reconciliation to zero; partial closes only shrink.
#[derive(Clone, Debug)]
pub struct CloseRequest {
    pub coin: String,
    pub side: PositionSide,
    pub size_usd: f64,
    pub contracts: Option<f64>,
    pub full: bool,
    pub reason: String,
}

#[derive(Clone, Copy, Debug)]
pub struct ExecutedClose {
    pub price: f64,
}

/// Exchange-side position the core does not own; reported at startup,
/// never touched.
#[derive(Clone, Debug)]
pub struct ForeignPosition {
    pub coin: String,
    pub contracts: f64,
    pub entry_price: f64,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Submit a market-equivalent entry. None on rejection or when
    /// normalization collapses the order to nothing.
    async fn open_position(&self, signal: &EntrySignal) -> Result<Option<ExecutedEntry>>;

    /// Reduce-only market close. Full closes must verify the exchange-side
    /// position is flat and escalate if a remainder survives.
    async fn close_position(&self, request: &CloseRequest) -> Result<ExecutedClose>;

    /// Place a resting limit order, normalized to the venue's tick/step
    /// filters. None when normalization produces a zero quantity. TP-purpose
    /// orders are submitted reduce-only.
    async fn place_limit_order(
        &self,
        coin: &str,
        side: OrderSide,
        price: f64,
        size_usd: f64,
        purpose: OrderPurpose,
        contracts: Option<f64>,
    ) -> Result<Option<LimitOrderState>>;

    /// Idempotent: cancelling an already-gone order succeeds and the local
    /// state transitions to cancelled either way.
    async fn cancel_limit_order(&self, order: &mut LimitOrderState) -> Result<()>;

    /// Optional remote poll. `Some(true)` = filled, `Some(false)` = still
    /// resting, None = the venue does not track this order.
    async fn check_limit_order_status(&self, order: &LimitOrderState) -> Result<Option<bool>>;

    /// Read-only startup reconciliation.
    async fn sync_open_positions(&self) -> Result<Vec<ForeignPosition>>;

    /// Current on-exchange size for the coin.
    async fn get_position_contracts(&self, coin: &str) -> Result<f64>;

    /// Mid-price hint from the stream; the paper engine fills from these.
    fn note_mid(&self, _coin: &str, _mid: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> LimitOrderState {
        LimitOrderState::new(
            "1".into(),
            "BTC",
            OrderSide::Buy,
            50000.0,
            500.0,
            None,
            OrderPurpose::Entry,
        )
    }

    #[test]
    fn terminal_states_are_sticky_and_exclusive() {
        let mut o = order();
        assert!(o.is_active());
        o.mark_filled(10);
        assert!(o.filled);
        assert_eq!(o.filled_at, Some(10));
        // A later cancel must not override the fill.
        o.mark_cancelled(20);
        assert!(!o.cancelled);
        assert!(o.cancelled_at.is_none());

        let mut o = order();
        o.mark_cancelled(10);
        o.mark_filled(20);
        assert!(o.cancelled);
        assert!(!o.filled);
        // Repeat cancel is a no-op on the timestamp too.
        o.mark_cancelled(30);
        assert_eq!(o.cancelled_at, Some(10));
    }
}
