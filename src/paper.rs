// Paper execution: the venue is a DashMap. Fills for market-equivalent
// requests happen at the last observed mid; resting limit orders are left to
// the position ledger, which simulates fills from passing mids.

use crate::exec::{
    CloseRequest, EntrySignal, ExecutedClose, ExecutedEntry, ExecutionEngine, ForeignPosition,
    LimitOrderState, OrderPurpose,
};
use crate::types::{now_ms, OrderSide, PositionSide};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Default)]
pub struct PaperEngine {
    mids: DashMap<String, f64>,
    contracts: DashMap<String, f64>,
    next_order_id: AtomicU64,
}

impl PaperEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        let n = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        format!("paper-{n}")
    }

    fn last_mid(&self, coin: &str) -> Option<f64> {
        self.mids.get(coin).map(|m| *m)
    }
}

#[async_trait]
impl ExecutionEngine for PaperEngine {
    async fn open_position(&self, signal: &EntrySignal) -> Result<Option<ExecutedEntry>> {
        // Fills at the caller's reference price (the anchor), falling back to
        // the last mid when no reference was given.
        let price = if signal.reference_price.is_finite() && signal.reference_price > 0.0 {
            signal.reference_price
        } else {
            self.last_mid(&signal.coin).unwrap_or(0.0)
        };
        if !(price.is_finite() && price > 0.0) || signal.size_usd <= 0.0 {
            return Ok(None);
        }
        let contracts = signal.size_usd / price;
        let signed = match signal.side {
            PositionSide::Long => contracts,
            PositionSide::Short => -contracts,
        };
        *self.contracts.entry(signal.coin.clone()).or_insert(0.0) += signed;
        info!(
            coin = %signal.coin,
            side = %signal.side,
            price,
            size_usd = signal.size_usd,
            contracts,
            "paper entry filled"
        );
        Ok(Some(ExecutedEntry {
            price,
            size_usd: signal.size_usd,
            contracts: Some(contracts),
        }))
    }

    async fn close_position(&self, request: &CloseRequest) -> Result<ExecutedClose> {
        let price = self
            .last_mid(&request.coin)
            .ok_or_else(|| anyhow!("no mid seen for {} yet", request.coin))?;
        let mut entry = self.contracts.entry(request.coin.clone()).or_insert(0.0);
        if request.full {
            *entry = 0.0;
        } else {
            let reduce = request
                .contracts
                .unwrap_or_else(|| request.size_usd / price);
            // Reduce-only: never flip through zero.
            let reduce = reduce.min(entry.abs());
            *entry -= reduce.copysign(*entry);
        }
        debug!(
            coin = %request.coin,
            price,
            size_usd = request.size_usd,
            full = request.full,
            reason = %request.reason,
            "paper close executed"
        );
        Ok(ExecutedClose { price })
    }

    async fn place_limit_order(
        &self,
        coin: &str,
        side: OrderSide,
        price: f64,
        size_usd: f64,
        purpose: OrderPurpose,
        contracts: Option<f64>,
    ) -> Result<Option<LimitOrderState>> {
        if !(price.is_finite() && price > 0.0) || size_usd <= 0.0 {
            return Ok(None);
        }
        let contracts = contracts.or(Some(size_usd / price));
        let order = LimitOrderState::new(
            self.next_id(),
            coin,
            side,
            price,
            size_usd,
            contracts,
            purpose,
        );
        debug!(
            coin,
            order_id = %order.order_id,
            side = %side,
            price,
            size_usd,
            purpose = ?purpose,
            "paper limit order placed"
        );
        Ok(Some(order))
    }

    async fn cancel_limit_order(&self, order: &mut LimitOrderState) -> Result<()> {
        order.mark_cancelled(now_ms());
        Ok(())
    }

    async fn check_limit_order_status(&self, _order: &LimitOrderState) -> Result<Option<bool>> {
        // Fill detection is the ledger's job in paper mode.
        Ok(None)
    }

    async fn sync_open_positions(&self) -> Result<Vec<ForeignPosition>> {
        Ok(Vec::new())
    }

    async fn get_position_contracts(&self, coin: &str) -> Result<f64> {
        Ok(self.contracts.get(coin).map(|c| *c).unwrap_or(0.0))
    }

    fn note_mid(&self, coin: &str, mid: f64) {
        if mid.is_finite() && mid > 0.0 {
            self.mids.insert(coin.to_string(), mid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(coin: &str, side: PositionSide, size_usd: f64, price: f64) -> EntrySignal {
        EntrySignal {
            coin: coin.into(),
            side,
            size_usd,
            reference_price: price,
        }
    }

    #[tokio::test]
    async fn open_fills_at_reference_price() {
        let engine = PaperEngine::new();
        engine.note_mid("BTC", 50005.0);
        let entry = engine
            .open_position(&signal("BTC", PositionSide::Long, 1000.0, 50000.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.price, 50000.0);
        assert_eq!(entry.size_usd, 1000.0);
        let contracts = engine.get_position_contracts("BTC").await.unwrap();
        assert!((contracts - 1000.0 / 50000.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn open_falls_back_to_last_mid() {
        let engine = PaperEngine::new();
        engine.note_mid("ETH", 3000.0);
        let entry = engine
            .open_position(&signal("ETH", PositionSide::Short, 500.0, f64::NAN))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.price, 3000.0);
        let contracts = engine.get_position_contracts("ETH").await.unwrap();
        assert!(contracts < 0.0);
    }

    #[tokio::test]
    async fn full_close_flattens_partial_close_reduces() {
        let engine = PaperEngine::new();
        engine.note_mid("BTC", 100.0);
        engine
            .open_position(&signal("BTC", PositionSide::Long, 1000.0, 100.0))
            .await
            .unwrap();

        engine
            .close_position(&CloseRequest {
                coin: "BTC".into(),
                side: PositionSide::Long,
                size_usd: 500.0,
                contracts: None,
                full: false,
                reason: "tp_hit".into(),
            })
            .await
            .unwrap();
        let remaining = engine.get_position_contracts("BTC").await.unwrap();
        assert!((remaining - 5.0).abs() < 1e-9);

        engine
            .close_position(&CloseRequest {
                coin: "BTC".into(),
                side: PositionSide::Long,
                size_usd: 500.0,
                contracts: None,
                full: true,
                reason: "tp_all_hit".into(),
            })
            .await
            .unwrap();
        assert_eq!(engine.get_position_contracts("BTC").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let engine = PaperEngine::new();
        let mut order = engine
            .place_limit_order("BTC", OrderSide::Buy, 100.0, 500.0, OrderPurpose::Entry, None)
            .await
            .unwrap()
            .unwrap();
        engine.cancel_limit_order(&mut order).await.unwrap();
        assert!(order.cancelled);
        let first_cancel_at = order.cancelled_at;
        engine.cancel_limit_order(&mut order).await.unwrap();
        assert_eq!(order.cancelled_at, first_cancel_at);
    }

    #[tokio::test]
    async fn zero_price_rejects_limit_order() {
        let engine = PaperEngine::new();
        let order = engine
            .place_limit_order("BTC", OrderSide::Buy, 0.0, 500.0, OrderPurpose::Entry, None)
            .await
            .unwrap();
        assert!(order.is_none());
    }
}
