// Bounce trading module: the single owner of all trading state. Market data,
// candles and timers arrive as explicit events through one channel; entries,
// ledger updates and the PnL supervisor all run on this task, so no state
// here needs a lock.

use crate::alerts::TelegramAlerter;
use crate::anchor_memory::{AnchorId, AnchorMemory};
use crate::candles::CandleFeedHandle;
use crate::config::{AppCfg, EntryMode, TradeMode};
use crate::context::ContextFeatures;
use crate::detector::LargeOrderDetector;
use crate::exec::{CloseRequest, EntrySignal, ExecutionEngine, OrderPurpose};
use crate::logger::{EventLogger, LogEvent};
use crate::natr::NatrCalculator;
use crate::policy::{PolicyEngine, PolicyFeatures, RuleScope};
use crate::position::{
    build_tp_limit_rungs, build_tp_targets, entry_ladder_prices, CloseReason, LedgerAction,
    PositionParams, PositionState,
};
use crate::risk::{RiskManager, RiskVerdict};
use crate::stream::MarketSubscriptions;
use crate::trade_log::{ClosedTrade, TradeLog};
use crate::types::{now_ms, BookSide, Candle, LargeOrder, OrderBookSnapshot, PositionSide, TradeTick};
use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const SHOCK_30M_MS: u64 = 30 * 60 * 1000;
const SHOCK_60M_MS: u64 = 60 * 60 * 1000;

/// Everything the engine reacts to, serialized through one channel.
#[derive(Debug)]
pub enum EngineEvent {
    Snapshot(OrderBookSnapshot),
    Trades(Vec<TradeTick>),
    AllMids(HashMap<String, f64>),
    Candle(String, Candle),
    SupervisorTick,
    Shutdown,
}

pub struct BounceEngine {
    cfg: AppCfg,
    venue: Arc<dyn ExecutionEngine>,
    subscriptions: Arc<dyn MarketSubscriptions>,
    candles: Option<CandleFeedHandle>,

    detector: LargeOrderDetector,
    natr: NatrCalculator,
    context: ContextFeatures,
    policy: PolicyEngine,
    anchor_memory: AnchorMemory,
    risk: RiskManager,
    trade_log: TradeLog,
    event_log: EventLogger,
    alerter: TelegramAlerter,

    positions: HashMap<String, PositionState>,
    pending_coins: HashSet<String>,
    last_mids: HashMap<String, f64>,
    paper_mode: bool,
}

impl BounceEngine {
    pub fn new(
        cfg: AppCfg,
        venue: Arc<dyn ExecutionEngine>,
        subscriptions: Arc<dyn MarketSubscriptions>,
        candles: Option<CandleFeedHandle>,
        event_log: EventLogger,
    ) -> Self {
        let detector = LargeOrderDetector::new(&cfg.screener);
        let natr = NatrCalculator::new(cfg.trade.natr_period);
        let policy = if cfg.policy.enabled {
            PolicyEngine::load(&cfg.policy.rules_file)
        } else {
            PolicyEngine::empty()
        };
        let anchor_memory = AnchorMemory::load(&cfg.policy.anchor_memory_file);
        let risk = RiskManager::new(cfg.trade.max_open_positions);
        let trade_log = TradeLog::new(&cfg.trade_log_dir);
        let alerter = TelegramAlerter::new(&cfg.telegram, cfg.screener.alert_cooldown_ms);
        let paper_mode = cfg.trade.mode != TradeMode::TradeLive;

        Self {
            cfg,
            venue,
            subscriptions,
            candles,
            detector,
            natr,
            context: ContextFeatures::new(),
            policy,
            anchor_memory,
            risk,
            trade_log,
            event_log,
            alerter,
            positions: HashMap::new(),
            pending_coins: HashSet::new(),
            last_mids: HashMap::new(),
            paper_mode,
        }
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn position(&self, coin: &str) -> Option<&PositionState> {
        self.positions.get(coin)
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending_coins.is_empty()
    }

    /// Main loop. Returns after a `Shutdown` event or when every sender is
    /// gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineEvent>) {
        info!(
            mode = ?self.cfg.trade.mode,
            entry_mode = ?self.cfg.trade.entry_mode,
            max_open = self.cfg.trade.max_open_positions,
            "bounce engine started"
        );
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Shutdown => break,
                other => self.handle_event(other).await,
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(candles) = &self.candles {
            candles.shutdown();
        }
        // No forced closure in paper mode; outstanding positions are logged
        // for the operator. Live closes go through the reduce-only path
        // before shutdown is requested.
        for (coin, pos) in self.positions.iter() {
            warn!(
                %coin,
                side = %pos.side,
                size_usd = pos.size_usd,
                entry_price = pos.entry_price,
                "position still open at shutdown"
            );
        }
        info!(open_positions = self.positions.len(), "bounce engine stopped");
    }

    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Snapshot(snapshot) => self.on_snapshot(snapshot).await,
            EngineEvent::Trades(trades) => self.on_trades(trades),
            EngineEvent::AllMids(mids) => self.on_all_mids(mids),
            EngineEvent::Candle(coin, candle) => self.on_candle(&coin, &candle),
            EngineEvent::SupervisorTick => self.on_supervisor_tick().await,
            EngineEvent::Shutdown => {}
        }
    }

    fn on_candle(&mut self, coin: &str, candle: &Candle) {
        if let Some(natr) = self.natr.update(coin, candle) {
            self.context.update_natr_history(coin, now_ms(), natr);
        }
    }

    fn on_trades(&mut self, trades: Vec<TradeTick>) {
        for t in trades {
            debug!(coin = %t.coin, price = t.price, size = t.size, "trade tick");
        }
    }

    fn on_all_mids(&mut self, mids: HashMap<String, f64>) {
        for (coin, mid) in mids {
            if mid.is_finite() && mid > 0.0 {
                self.venue.note_mid(&coin, mid);
                self.last_mids.insert(coin, mid);
            }
        }
    }

    async fn on_snapshot(&mut self, snapshot: OrderBookSnapshot) {
        let coin = snapshot.coin.to_ascii_uppercase();
        if let Some(mid) = snapshot.mid() {
            self.venue.note_mid(&coin, mid);
            self.last_mids.insert(coin.clone(), mid);
        }

        // Ledger first: an open position reacts to every snapshot of its
        // coin. A failure here is contained so other positions keep going.
        if self.positions.contains_key(&coin) {
            if let Err(e) = self.update_position_from_snapshot(&coin, &snapshot).await {
                error!(%coin, error = %e, "position snapshot update failed");
            }
        }

        for order in self.detector.scan(&snapshot) {
            self.event_log.log(LogEvent::LargeOrderSeen {
                timestamp: order.timestamp,
                coin: order.coin.clone(),
                side: order.side.to_string(),
                price: order.price,
                value_usd: order.value_usd,
                distance_percent: order.distance_percent,
            });
            self.alerter.notify_large_order(&order).await;
            if let Err(e) = self.maybe_enter(&order).await {
                error!(coin = %order.coin, error = %e, "entry attempt failed");
            }
        }
    }

    async fn update_position_from_snapshot(
        &mut self,
        coin: &str,
        snapshot: &OrderBookSnapshot,
    ) -> Result<()> {
        let actions = {
            let Some(pos) = self.positions.get_mut(coin) else {
                return Ok(());
            };
            pos.on_snapshot(
                snapshot,
                self.cfg.trade.entry_limit_density_min_percent,
                self.paper_mode,
            )
        };
        self.apply_ledger_actions(coin, actions).await
    }

    async fn apply_ledger_actions(&mut self, coin: &str, actions: Vec<LedgerAction>) -> Result<()> {
        for action in actions {
            match action {
                LedgerAction::CancelEntryLimits => {
                    self.cancel_entry_limits(coin, "entry_ladder_guard").await;
                }
                LedgerAction::EntryLimitFilled { order_id, size_usd } => {
                    info!(%coin, %order_id, size_usd, "entry limit filled");
                }
                LedgerAction::InstallTpLadder => {
                    if let Err(e) = self.install_tp_ladder(coin).await {
                        warn!(%coin, error = %e, "failed to install TP ladder");
                    }
                }
                LedgerAction::TpLimitFilled { order_id, size_usd } => {
                    info!(%coin, %order_id, size_usd, "tp limit filled");
                }
                LedgerAction::PartialClose { size_usd, reason } => {
                    self.partial_close(coin, size_usd, reason).await?;
                }
                LedgerAction::CloseFull { reason } => {
                    self.close_position_full(coin, reason).await?;
                    // The position is gone; drop any remaining actions.
                    break;
                }
            }
        }
        Ok(())
    }

    async fn cancel_entry_limits(&mut self, coin: &str, reason: &str) {
        let Some(pos) = self.positions.get_mut(coin) else {
            return;
        };
        for order in pos.entry_limit_orders.iter_mut().filter(|o| o.is_active()) {
            match self.venue.cancel_limit_order(order).await {
                Ok(()) => {
                    self.event_log.log(LogEvent::OrderCancelled {
                        timestamp: now_ms(),
                        coin: coin.to_string(),
                        order_id: order.order_id.clone(),
                        reason: reason.to_string(),
                    });
                }
                Err(e) => warn!(%coin, order_id = %order.order_id, error = %e, "cancel failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Entry path
    // ------------------------------------------------------------------

    async fn maybe_enter(&mut self, order: &LargeOrder) -> Result<()> {
        if !self.cfg.trade.enabled || self.cfg.trade.mode == TradeMode::ScreenOnly {
            return Ok(());
        }
        let coin = order.coin.to_ascii_uppercase();
        if self.pending_coins.contains(&coin) || self.positions.contains_key(&coin) {
            return Ok(());
        }

        let Some(natr) = self.natr.get_natr(&coin) else {
            debug!(%coin, "no NATR yet, abstaining");
            return Ok(());
        };

        let now = now_ms();
        let anchor = AnchorId::new(&coin, order.price, order.side);
        if !self
            .anchor_memory
            .can_trade(&anchor, self.cfg.trade.max_anchor_wins)
        {
            self.reject(&coin, "anchor_win_limit");
            return Ok(());
        }

        let features = self.entry_features(&coin, &anchor, now);
        let decision = self.policy.evaluate(RuleScope::NewEntry, &features);
        if !decision.allow_trade {
            self.reject(&coin, &format!("policy:{}", decision.reason));
            return Ok(());
        }

        let base_size = self.base_position_size(natr);
        let final_size = base_size * decision.size_multiplier;
        if final_size <= 0.0 {
            self.reject(&coin, "zero_size");
            return Ok(());
        }

        let open_coins: HashSet<String> = self.positions.keys().cloned().collect();
        match self
            .risk
            .can_open_position(&coin, &open_coins, &self.pending_coins)
        {
            RiskVerdict::Ok => {}
            verdict => {
                debug!(%coin, ?verdict, "risk gate refused entry");
                return Ok(());
            }
        }

        // Guard against re-entrant entry: a second snapshot of this coin can
        // arrive while the venue call below is in flight.
        self.pending_coins.insert(coin.clone());
        let outcome = self
            .execute_entry(&coin, order, natr, final_size, &decision.reason, decision.tp_natr_multiplier, decision.sl_natr_multiplier)
            .await;
        self.pending_coins.remove(&coin);

        match outcome {
            Ok(Some(pos)) => {
                self.subscriptions.subscribe_trades(&coin);
                if let Some(candles) = &self.candles {
                    candles.track(&coin);
                }
                self.event_log.log(LogEvent::PositionOpened {
                    timestamp: now,
                    coin: coin.clone(),
                    side: pos.side.to_string(),
                    entry_price: pos.entry_price,
                    size_usd: pos.size_usd,
                    anchor_price: pos.anchor_price,
                    anchor_value_usd: pos.anchor_initial_value_usd,
                    policy_reason: decision.reason.clone(),
                });
                info!(
                    %coin,
                    side = %pos.side,
                    entry_price = pos.entry_price,
                    size_usd = pos.size_usd,
                    anchor_price = pos.anchor_price,
                    "position opened"
                );
                self.positions.insert(coin, pos);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn reject(&self, coin: &str, reason: &str) {
        debug!(%coin, reason, "entry rejected");
        self.event_log.log(LogEvent::TradeRejected {
            timestamp: now_ms(),
            coin: coin.to_string(),
            reason: reason.to_string(),
        });
    }

    fn entry_features(&self, coin: &str, anchor: &AnchorId, now: u64) -> PolicyFeatures {
        let stats = self.anchor_memory.get(anchor);
        PolicyFeatures {
            shock_30m_natr: self.context.natr_shock(coin, now, SHOCK_30M_MS),
            shock_60m_natr: self.context.natr_shock(coin, now, SHOCK_60M_MS),
            anchor_trade_count: stats.map(|s| s.total_trades).unwrap_or(0),
            anchor_win_count: stats.map(|s| s.win_trades).unwrap_or(0),
            anchor_last_trade_ago_min: stats
                .map(|s| now.saturating_sub(s.last_trade_at) as f64 / 60_000.0),
            time_in_anchor_zone_min: 0.0,
            time_since_entry_min: 0.0,
            tp_hits_count: 0,
        }
    }

    /// Risk-scaled base size: `max_risk / (natr · mult / 100)` when a risk
    /// budget is set, the flat configured size otherwise.
    fn base_position_size(&self, natr: f64) -> f64 {
        let t = &self.cfg.trade;
        if t.max_risk_per_trade > 0.0 && natr > 0.0 {
            t.max_risk_per_trade / ((natr * t.risk_natr_multiplier) / 100.0)
        } else {
            t.position_size_usd
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_entry(
        &mut self,
        coin: &str,
        order: &LargeOrder,
        natr: f64,
        size_usd: f64,
        _policy_reason: &str,
        tp_mult: f64,
        sl_mult: f64,
    ) -> Result<Option<PositionState>> {
        let side = match order.side {
            BookSide::Bid => PositionSide::Long,
            BookSide::Ask => PositionSide::Short,
        };
        let mid = self
            .last_mids
            .get(coin)
            .copied()
            .unwrap_or(order.price);

        let entry_mode = self.cfg.trade.entry_mode;
        let (market_size, limit_size) = match entry_mode {
            EntryMode::Market => (size_usd, 0.0),
            EntryMode::Limit => (0.0, size_usd),
            EntryMode::Mixed => (
                size_usd * self.cfg.trade.entry_market_percent / 100.0,
                size_usd * self.cfg.trade.entry_limit_percent / 100.0,
            ),
        };

        let mut entry_price = order.price;
        let mut market_filled = 0.0;
        let mut contracts = None;

        if market_size > 0.0 {
            let executed = self
                .venue
                .open_position(&EntrySignal {
                    coin: coin.to_string(),
                    side,
                    size_usd: market_size,
                    reference_price: order.price,
                })
                .await?;
            match executed {
                Some(e) => {
                    entry_price = e.price;
                    market_filled = e.size_usd;
                    contracts = e.contracts;
                }
                None => {
                    // Rejected or normalized away; in MIXED mode the limit
                    // part is abandoned too.
                    return Ok(None);
                }
            }
        }

        let mut pos = PositionState::new(
            PositionParams {
                coin: coin.to_string(),
                side,
                entry_price,
                size_usd,
                size_contracts: contracts,
                anchor_price: order.price,
                anchor_value_usd: order.value_usd,
                natr,
                tp_natr_multiplier: tp_mult,
                sl_natr_multiplier: sl_mult,
                opened_at: now_ms(),
            },
            self.cfg.trade.anchor_min_value_fraction,
            self.cfg.trade.anchor_min_value_usd,
        );
        pos.market_filled_size_usd = market_filled;
        pos.last_mid = mid;

        if limit_size > 0.0 {
            self.place_entry_ladder(&mut pos, natr, limit_size).await;
        }

        // MARKET installs TPs right away; MIXED too (its market leg is
        // filled); LIMIT waits for the first ladder fill.
        if market_size > 0.0 {
            self.install_tp_ladder_for(&mut pos).await;
        }

        Ok(Some(pos))
    }

    async fn place_entry_ladder(&self, pos: &mut PositionState, natr: f64, total_size: f64) {
        let t = &self.cfg.trade;
        let proportions = &t.entry_limit_proportions;
        let prices = entry_ladder_prices(
            pos.anchor_price,
            natr,
            t.entry_limit_natr_range[0],
            t.entry_limit_natr_range[1],
            proportions.len(),
            pos.side,
        );
        for (price, proportion) in prices.into_iter().zip(proportions.iter()) {
            let rung_size = total_size * proportion / 100.0;
            if rung_size <= 0.0 {
                continue;
            }
            match self
                .venue
                .place_limit_order(
                    &pos.coin,
                    pos.side.entry_order_side(),
                    price,
                    rung_size,
                    OrderPurpose::Entry,
                    None,
                )
                .await
            {
                Ok(Some(order)) => {
                    self.event_log.log(LogEvent::OrderPlaced {
                        timestamp: now_ms(),
                        coin: pos.coin.clone(),
                        order_id: order.order_id.clone(),
                        side: order.side.to_string(),
                        price: order.price,
                        size_usd: order.size_usd,
                        purpose: "entry".to_string(),
                    });
                    pos.entry_limit_orders.push(order);
                }
                Ok(None) => {
                    debug!(coin = %pos.coin, price, "entry rung normalized away");
                }
                Err(e) => {
                    warn!(coin = %pos.coin, price, error = %e, "entry rung placement failed");
                }
            }
        }
    }

    async fn install_tp_ladder(&mut self, coin: &str) -> Result<()> {
        let Some(mut pos) = self.positions.remove(coin) else {
            return Ok(());
        };
        self.install_tp_ladder_for(&mut pos).await;
        self.positions.insert(coin.to_string(), pos);
        Ok(())
    }

    /// Limit TPs when proportions are configured, market-on-touch targets
    /// otherwise. Both shrink `size_usd` as they hit.
    async fn install_tp_ladder_for(&self, pos: &mut PositionState) {
        let t = &self.cfg.trade;
        if !t.tp_limit_proportions.is_empty() {
            let rungs = build_tp_limit_rungs(
                pos.entry_price,
                pos.natr_at_entry,
                pos.side,
                &t.tp_natr_levels,
                &t.tp_percents,
                &t.tp_limit_proportions,
                pos.initial_size_usd,
                pos.tp_natr_multiplier,
            );
            for rung in rungs {
                match self
                    .venue
                    .place_limit_order(
                        &pos.coin,
                        pos.side.exit_order_side(),
                        rung.price,
                        rung.size_usd,
                        OrderPurpose::Tp,
                        None,
                    )
                    .await
                {
                    Ok(Some(order)) => {
                        self.event_log.log(LogEvent::OrderPlaced {
                            timestamp: now_ms(),
                            coin: pos.coin.clone(),
                            order_id: order.order_id.clone(),
                            side: order.side.to_string(),
                            price: order.price,
                            size_usd: order.size_usd,
                            purpose: "tp".to_string(),
                        });
                        pos.tp_limit_orders.push(order);
                    }
                    Ok(None) => {
                        debug!(coin = %pos.coin, price = rung.price, "tp rung normalized away");
                    }
                    Err(e) => {
                        warn!(coin = %pos.coin, price = rung.price, error = %e, "tp rung placement failed");
                    }
                }
            }
        } else {
            pos.tp_targets = build_tp_targets(
                pos.entry_price,
                pos.natr_at_entry,
                pos.side,
                &t.tp_natr_levels,
                &t.tp_percents,
                pos.initial_size_usd,
                pos.tp_natr_multiplier,
            );
        }
    }

    // ------------------------------------------------------------------
    // Close paths
    // ------------------------------------------------------------------

    async fn partial_close(&mut self, coin: &str, size_usd: f64, reason: CloseReason) -> Result<()> {
        let Some(pos) = self.positions.get(coin) else {
            return Ok(());
        };
        let contracts = pos
            .size_contracts
            .map(|c| c * size_usd / pos.initial_size_usd.max(f64::EPSILON));
        let request = CloseRequest {
            coin: coin.to_string(),
            side: pos.side,
            size_usd,
            contracts,
            full: false,
            reason: reason.to_string(),
        };
        let executed = self.venue.close_position(&request).await?;
        let Some(pos) = self.positions.get_mut(coin) else {
            return Ok(());
        };
        pos.exit_trades.push(crate::position::TradeFill {
            price: executed.price,
            size_usd,
            time: now_ms(),
        });
        info!(
            %coin,
            size_usd,
            price = executed.price,
            reason = %reason,
            remaining = pos.size_usd,
            "partial take-profit"
        );
        Ok(())
    }

    async fn close_position_full(&mut self, coin: &str, reason: CloseReason) -> Result<()> {
        let Some(mut pos) = self.positions.remove(coin) else {
            return Ok(());
        };

        // Limit orders never outlive their position.
        for order in pos
            .entry_limit_orders
            .iter_mut()
            .chain(pos.tp_limit_orders.iter_mut())
            .filter(|o| o.is_active())
        {
            if let Err(e) = self.venue.cancel_limit_order(order).await {
                warn!(%coin, order_id = %order.order_id, error = %e, "cancel on close failed");
            }
        }

        let request = CloseRequest {
            coin: coin.to_string(),
            side: pos.side,
            size_usd: pos.size_usd,
            contracts: pos.size_contracts,
            full: true,
            reason: reason.to_string(),
        };
        let exit_price = match self.venue.close_position(&request).await {
            Ok(executed) => executed.price,
            Err(e) => {
                error!(%coin, error = %e, reason = %reason, "close failed, dropping position from ledger");
                pos.last_mid
            }
        };

        let (pnl_percent, pnl_usd) = pos.pnl_at(exit_price);
        let now = now_ms();

        let anchor = AnchorId::new(&pos.coin, pos.anchor_price, pos.anchor_side);
        self.anchor_memory
            .record_trade(&anchor, pnl_usd, pnl_percent, pos.initial_size_usd, now);

        self.trade_log.record(&ClosedTrade {
            closed_at: Utc::now().to_rfc3339(),
            coin: pos.coin.clone(),
            side: pos.side.to_string(),
            entry_price: pos.entry_price,
            exit_price,
            size_usd: pos.initial_size_usd,
            pnl_usd,
            pnl_percent,
            reason: reason.to_string(),
            anchor_price: pos.anchor_price,
            anchor_value_usd: pos.anchor_initial_value_usd,
            held_secs: now.saturating_sub(pos.opened_at) / 1000,
        });
        self.event_log.log(LogEvent::PositionClosed {
            timestamp: now,
            coin: pos.coin.clone(),
            side: pos.side.to_string(),
            entry_price: pos.entry_price,
            exit_price,
            size_usd: pos.initial_size_usd,
            pnl_usd,
            pnl_percent,
            reason: reason.to_string(),
        });
        info!(
            %coin,
            side = %pos.side,
            entry_price = pos.entry_price,
            exit_price,
            pnl_usd,
            pnl_percent,
            reason = %reason,
            "position closed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // PnL supervisor
    // ------------------------------------------------------------------

    async fn on_supervisor_tick(&mut self) {
        if !self.paper_mode {
            self.poll_live_limit_orders().await;
        }

        let max_risk = self.cfg.trade.max_risk_per_trade;
        if max_risk <= 0.0 {
            return;
        }
        let coins: Vec<String> = self.positions.keys().cloned().collect();
        for coin in coins {
            // One bad position must not stop supervision of the others.
            if let Err(e) = self.supervise_position(&coin, max_risk).await {
                error!(%coin, error = %e, "pnl supervisor error");
            }
        }
    }

    async fn supervise_position(&mut self, coin: &str, max_risk: f64) -> Result<()> {
        let Some(pos) = self.positions.get(coin) else {
            return Ok(());
        };
        let mid = self
            .last_mids
            .get(coin)
            .copied()
            .unwrap_or(pos.last_mid);
        let (_, pnl_usd) = pos.pnl_at(mid);
        if pnl_usd < -max_risk {
            warn!(
                %coin,
                pnl_usd,
                max_risk,
                "emergency stop loss triggered"
            );
            self.event_log.log(LogEvent::EmergencyStop {
                timestamp: now_ms(),
                coin: coin.to_string(),
                pnl_usd,
                max_risk_usd: max_risk,
            });
            self.close_position_full(coin, CloseReason::EmergencyStopLoss { pnl_usd })
                .await?;
        }
        Ok(())
    }

    /// Live mode: resting orders fill on the exchange, not in the ledger.
    /// Poll their status and feed fills back through the same bookkeeping.
    async fn poll_live_limit_orders(&mut self) {
        let coins: Vec<String> = self.positions.keys().cloned().collect();
        for coin in coins {
            let orders: Vec<crate::exec::LimitOrderState> = match self.positions.get(&coin) {
                Some(pos) => pos
                    .entry_limit_orders
                    .iter()
                    .chain(pos.tp_limit_orders.iter())
                    .filter(|o| o.is_active())
                    .cloned()
                    .collect(),
                None => continue,
            };
            for order in orders {
                match self.venue.check_limit_order_status(&order).await {
                    Ok(Some(true)) => {
                        let actions = match self.positions.get_mut(&coin) {
                            Some(pos) => pos.apply_remote_fill(&order.order_id, now_ms()),
                            None => continue,
                        };
                        if let Err(e) = self.apply_ledger_actions(&coin, actions).await {
                            error!(%coin, error = %e, "remote fill handling failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(%coin, order_id = %order.order_id, error = %e, "order status poll failed");
                    }
                }
            }
        }
    }
}

/// Spawns the supervisor metronome; the engine receives a tick every
/// `interval_ms` until the channel closes.
pub fn spawn_supervisor_timer(tx: mpsc::Sender<EngineEvent>, interval_ms: u64) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(tokio::time::Duration::from_millis(
            interval_ms.max(100),
        ));
        tick.tick().await;
        loop {
            tick.tick().await;
            if tx.send(EngineEvent::SupervisorTick).await.is_err() {
                return;
            }
        }
    });
}
