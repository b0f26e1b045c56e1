// Position ledger and per-snapshot state machine: anchor visibility, entry
// and take-profit ladders, PnL math. The functions here decide; the trading
// module executes the resulting actions against the venue.

use crate::exec::LimitOrderState;
use crate::types::{
    round_anchor_price, BookSide, OrderBookSnapshot, PositionSide,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub enum CloseReason {
    AnchorLostOutOfViewAgainst,
    AnchorRemovedFromBookInView,
    AnchorValueBelowThreshold,
    TpHit,
    TpAllHit,
    TpLimitAllHit,
    EmergencyStopLoss { pnl_usd: f64 },
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::AnchorLostOutOfViewAgainst => write!(f, "anchor_lost_out_of_view_against"),
            CloseReason::AnchorRemovedFromBookInView => {
                write!(f, "anchor_removed_from_book_in_view")
            }
            CloseReason::AnchorValueBelowThreshold => write!(f, "anchor_value_below_threshold"),
            CloseReason::TpHit => write!(f, "tp_hit"),
            CloseReason::TpAllHit => write!(f, "tp_all_hit"),
            CloseReason::TpLimitAllHit => write!(f, "tp_limit_all_hit"),
            CloseReason::EmergencyStopLoss { pnl_usd } => {
                write!(f, "emergency_stop_loss_pnl={pnl_usd:.2}")
            }
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TpTarget {
    pub price: f64,
    pub size_usd: f64,
    pub hit: bool,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct TradeFill {
    pub price: f64,
    pub size_usd: f64,
    pub time: u64,
}

/// What a snapshot (or a poll) asks the trading module to do. Ordering
/// matters: cancels come before closes.
#[derive(Clone, Debug, PartialEq)]
pub enum LedgerAction {
    CancelEntryLimits,
    PartialClose { size_usd: f64, reason: CloseReason },
    CloseFull { reason: CloseReason },
    InstallTpLadder,
    TpLimitFilled { order_id: String, size_usd: f64 },
    EntryLimitFilled { order_id: String, size_usd: f64 },
}

#[derive(Clone, Debug)]
pub struct PositionState {
    pub id: String,
    pub coin: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub size_usd: f64,
    pub size_contracts: Option<f64>,
    pub initial_size_usd: f64,
    pub opened_at: u64,

    pub anchor_side: BookSide,
    pub anchor_price: f64,
    pub anchor_initial_value_usd: f64,
    pub anchor_min_value_usd: f64,

    pub tp_targets: Vec<TpTarget>,
    pub entry_limit_orders: Vec<LimitOrderState>,
    pub tp_limit_orders: Vec<LimitOrderState>,

    pub market_filled_size_usd: f64,
    pub limit_filled_size_usd: f64,
    pub entry_trades: Vec<TradeFill>,
    pub exit_trades: Vec<TradeFill>,

    pub natr_at_entry: f64,
    pub tp_natr_multiplier: f64,
    pub sl_natr_multiplier: f64,
    pub tp_hits: u32,
    pub last_mid: f64,
}

pub struct PositionParams {
    pub coin: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub size_usd: f64,
    pub size_contracts: Option<f64>,
    pub anchor_price: f64,
    pub anchor_value_usd: f64,
    pub natr: f64,
    pub tp_natr_multiplier: f64,
    pub sl_natr_multiplier: f64,
    pub opened_at: u64,
}

impl PositionState {
    /// `anchor_min_value_usd = max(initial · fraction, floor)`.
    pub fn new(p: PositionParams, min_value_fraction: f64, min_value_usd: f64) -> Self {
        let anchor_min_value_usd =
            (p.anchor_value_usd * min_value_fraction).max(min_value_usd);
        Self {
            id: Uuid::new_v4().to_string(),
            coin: p.coin,
            side: p.side,
            entry_price: p.entry_price,
            size_usd: p.size_usd,
            size_contracts: p.size_contracts,
            initial_size_usd: p.size_usd,
            opened_at: p.opened_at,
            anchor_side: p.side.anchor_side(),
            anchor_price: p.anchor_price,
            anchor_initial_value_usd: p.anchor_value_usd,
            anchor_min_value_usd,
            tp_targets: Vec::new(),
            entry_limit_orders: Vec::new(),
            tp_limit_orders: Vec::new(),
            market_filled_size_usd: 0.0,
            limit_filled_size_usd: 0.0,
            entry_trades: Vec::new(),
            exit_trades: Vec::new(),
            natr_at_entry: p.natr,
            tp_natr_multiplier: p.tp_natr_multiplier,
            sl_natr_multiplier: p.sl_natr_multiplier,
            tp_hits: 0,
            last_mid: p.entry_price,
        }
    }

    pub fn has_active_entry_limits(&self) -> bool {
        self.entry_limit_orders.iter().any(|o| o.is_active())
    }

    pub fn filled_size_usd(&self) -> f64 {
        self.market_filled_size_usd + self.limit_filled_size_usd
    }

    /// `(pnl_percent, pnl_usd)` at the given mid.
    pub fn pnl_at(&self, mid: f64) -> (f64, f64) {
        if self.entry_price <= 0.0 {
            return (0.0, 0.0);
        }
        let price_diff = match self.side {
            PositionSide::Long => mid - self.entry_price,
            PositionSide::Short => self.entry_price - mid,
        };
        let pnl_percent = price_diff / self.entry_price * 100.0;
        let pnl_usd = self.size_usd * pnl_percent / 100.0;
        (pnl_percent, pnl_usd)
    }

    pub fn minutes_open(&self, now_ms: u64) -> f64 {
        now_ms.saturating_sub(self.opened_at) as f64 / 60_000.0
    }

    /// Per-snapshot update. Mutates the ladders and size bookkeeping and
    /// returns the venue actions the caller must carry out, in order.
    ///
    /// `simulate_limit_fills` is set in paper mode, where resting orders fill
    /// when the mid crosses them; live fills arrive via order polling instead.
    pub fn on_snapshot(
        &mut self,
        snapshot: &OrderBookSnapshot,
        entry_limit_density_min_percent: f64,
        simulate_limit_fills: bool,
    ) -> Vec<LedgerAction> {
        let mut actions = Vec::new();

        let levels = snapshot.side_levels(self.anchor_side);
        // An empty side is a degenerate snapshot: skip, never a false close.
        if levels.is_empty() {
            return actions;
        }

        let first = levels.first().map(|l| l.price).unwrap_or(0.0);
        let last = levels.last().map(|l| l.price).unwrap_or(0.0);
        let (min_visible, max_visible) = if first <= last {
            (first, last)
        } else {
            (last, first)
        };

        let anchor_in_range =
            self.anchor_price >= min_visible && self.anchor_price <= max_visible;
        let anchor_key = round_anchor_price(self.anchor_price);
        let current_value_usd: f64 = levels
            .iter()
            .filter(|l| round_anchor_price(l.price) == anchor_key)
            .map(|l| l.price * l.size)
            .sum();

        if !anchor_in_range {
            let against = match self.anchor_side {
                BookSide::Bid => self.anchor_price > max_visible,
                BookSide::Ask => self.anchor_price < min_visible,
            };
            if against {
                actions.push(LedgerAction::CancelEntryLimits);
                actions.push(LedgerAction::CloseFull {
                    reason: CloseReason::AnchorLostOutOfViewAgainst,
                });
            }
            // Anchor out of view on the profit side: leave the position be.
            return actions;
        }

        if current_value_usd == 0.0 {
            actions.push(LedgerAction::CancelEntryLimits);
            actions.push(LedgerAction::CloseFull {
                reason: CloseReason::AnchorRemovedFromBookInView,
            });
            return actions;
        }

        if current_value_usd <= self.anchor_min_value_usd {
            actions.push(LedgerAction::CloseFull {
                reason: CloseReason::AnchorValueBelowThreshold,
            });
            return actions;
        }

        if self.anchor_initial_value_usd > 0.0
            && current_value_usd / self.anchor_initial_value_usd * 100.0
                < entry_limit_density_min_percent
            && self.has_active_entry_limits()
        {
            actions.push(LedgerAction::CancelEntryLimits);
        }

        let Some(mid) = snapshot.mid() else {
            return actions;
        };
        self.last_mid = mid;

        if simulate_limit_fills {
            self.simulate_entry_fills(mid, snapshot.time, &mut actions);
            self.simulate_tp_limit_fills(mid, snapshot.time, &mut actions);
        }
        self.check_tp_targets(mid, &mut actions);

        actions
    }

    fn simulate_entry_fills(&mut self, mid: f64, time: u64, actions: &mut Vec<LedgerAction>) {
        let had_fill_before = self.limit_filled_size_usd > 0.0;
        let mut newly_filled = false;
        for order in self.entry_limit_orders.iter_mut().filter(|o| o.is_active()) {
            let crossed = match order.side {
                crate::types::OrderSide::Buy => mid <= order.price,
                crate::types::OrderSide::Sell => mid >= order.price,
            };
            if crossed {
                order.mark_filled(time);
                self.limit_filled_size_usd += order.size_usd;
                self.entry_trades.push(TradeFill {
                    price: order.price,
                    size_usd: order.size_usd,
                    time,
                });
                actions.push(LedgerAction::EntryLimitFilled {
                    order_id: order.order_id.clone(),
                    size_usd: order.size_usd,
                });
                newly_filled = true;
            }
        }
        // First entry fill installs the TP ladder if none exists yet.
        if newly_filled && !had_fill_before && self.tp_limit_orders.is_empty() {
            actions.push(LedgerAction::InstallTpLadder);
        }
    }

    fn simulate_tp_limit_fills(&mut self, mid: f64, time: u64, actions: &mut Vec<LedgerAction>) {
        let mut filled_any = false;
        for order in self.tp_limit_orders.iter_mut().filter(|o| o.is_active()) {
            let reached = match order.side {
                crate::types::OrderSide::Sell => mid >= order.price,
                crate::types::OrderSide::Buy => mid <= order.price,
            };
            if reached {
                order.mark_filled(time);
                self.size_usd -= order.size_usd;
                self.tp_hits += 1;
                self.exit_trades.push(TradeFill {
                    price: order.price,
                    size_usd: order.size_usd,
                    time,
                });
                actions.push(LedgerAction::TpLimitFilled {
                    order_id: order.order_id.clone(),
                    size_usd: order.size_usd,
                });
                filled_any = true;
            }
        }
        if filled_any && self.size_usd <= 1e-9 {
            self.size_usd = 0.0;
            actions.push(LedgerAction::CloseFull {
                reason: CloseReason::TpLimitAllHit,
            });
        }
    }

    fn check_tp_targets(&mut self, mid: f64, actions: &mut Vec<LedgerAction>) {
        let side = self.side;
        let mut any_hit = false;
        for target in self.tp_targets.iter_mut().filter(|t| !t.hit) {
            let reached = match side {
                PositionSide::Long => mid >= target.price,
                PositionSide::Short => mid <= target.price,
            };
            if reached {
                target.hit = true;
                self.tp_hits += 1;
                self.size_usd -= target.size_usd;
                actions.push(LedgerAction::PartialClose {
                    size_usd: target.size_usd,
                    reason: CloseReason::TpHit,
                });
                any_hit = true;
            }
        }
        if any_hit && self.size_usd <= 1e-9 {
            self.size_usd = 0.0;
            actions.push(LedgerAction::CloseFull {
                reason: CloseReason::TpAllHit,
            });
        }
    }

    /// Live-mode bookkeeping for a resting order the venue reports filled.
    /// Returns the follow-up actions (TP installation or a final close).
    pub fn apply_remote_fill(&mut self, order_id: &str, time: u64) -> Vec<LedgerAction> {
        let mut actions = Vec::new();
        let had_fill_before = self.limit_filled_size_usd > 0.0;

        if let Some(order) = self
            .entry_limit_orders
            .iter_mut()
            .find(|o| o.order_id == order_id && o.is_active())
        {
            order.mark_filled(time);
            let size = order.size_usd;
            let price = order.price;
            self.limit_filled_size_usd += size;
            self.entry_trades.push(TradeFill {
                price,
                size_usd: size,
                time,
            });
            actions.push(LedgerAction::EntryLimitFilled {
                order_id: order_id.to_string(),
                size_usd: size,
            });
            if !had_fill_before && self.tp_limit_orders.is_empty() {
                actions.push(LedgerAction::InstallTpLadder);
            }
            return actions;
        }

        if let Some(order) = self
            .tp_limit_orders
            .iter_mut()
            .find(|o| o.order_id == order_id && o.is_active())
        {
            order.mark_filled(time);
            let size = order.size_usd;
            let price = order.price;
            self.size_usd -= size;
            self.tp_hits += 1;
            self.exit_trades.push(TradeFill {
                price,
                size_usd: size,
                time,
            });
            actions.push(LedgerAction::TpLimitFilled {
                order_id: order_id.to_string(),
                size_usd: size,
            });
            if self.size_usd <= 1e-9 {
                self.size_usd = 0.0;
                actions.push(LedgerAction::CloseFull {
                    reason: CloseReason::TpLimitAllHit,
                });
            }
        }
        actions
    }
}

// ============================================================================
// Ladder math
// ============================================================================

/// Entry-limit ladder prices around the anchor. With `natr_step =
/// anchor · natr / 100`, rung i sits at `min + (max−min)·i/(n−1)` NATR units
/// from the anchor (midpoint when n = 1), added for longs and subtracted for
/// shorts so a negative offset lands behind the anchor. Degenerate prices
/// are dropped.
pub fn entry_ladder_prices(
    anchor_price: f64,
    natr: f64,
    min_natr: f64,
    max_natr: f64,
    n: usize,
    side: PositionSide,
) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let natr_step = anchor_price * natr / 100.0;
    (0..n)
        .filter_map(|i| {
            let offset = if n == 1 {
                (min_natr + max_natr) / 2.0
            } else {
                min_natr + (max_natr - min_natr) * i as f64 / (n as f64 - 1.0)
            };
            let price = match side {
                PositionSide::Long => anchor_price + natr_step * offset,
                PositionSide::Short => anchor_price - natr_step * offset,
            };
            (price.is_finite() && price > 0.0).then_some(price)
        })
        .collect()
}

/// Market-on-touch TP targets at NATR-scaled distances from the entry.
pub fn build_tp_targets(
    entry_price: f64,
    natr: f64,
    side: PositionSide,
    levels: &[f64],
    percents: &[f64],
    initial_size_usd: f64,
    tp_natr_multiplier: f64,
) -> Vec<TpTarget> {
    levels
        .iter()
        .zip(percents.iter())
        .filter_map(|(&level, &percent)| {
            let distance = entry_price * natr / 100.0 * level * tp_natr_multiplier;
            let price = match side {
                PositionSide::Long => entry_price + distance,
                PositionSide::Short => entry_price - distance,
            };
            let size_usd = initial_size_usd * percent / 100.0;
            (price.is_finite() && price > 0.0 && size_usd > 0.0).then_some(TpTarget {
                price,
                size_usd,
                hit: false,
            })
        })
        .collect()
}

/// One rung of the resting TP-limit ladder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TpRung {
    pub price: f64,
    pub size_usd: f64,
}

/// Resting-limit variant of the TP ladder: each `(level, percent)` order is
/// subdivided by `proportions` into same-price slices.
pub fn build_tp_limit_rungs(
    entry_price: f64,
    natr: f64,
    side: PositionSide,
    levels: &[f64],
    percents: &[f64],
    proportions: &[f64],
    initial_size_usd: f64,
    tp_natr_multiplier: f64,
) -> Vec<TpRung> {
    let targets = build_tp_targets(
        entry_price,
        natr,
        side,
        levels,
        percents,
        initial_size_usd,
        tp_natr_multiplier,
    );
    let proportions: Vec<f64> = if proportions.is_empty() {
        vec![100.0]
    } else {
        proportions.to_vec()
    };
    let mut rungs = Vec::new();
    for target in targets {
        for &p in &proportions {
            let size_usd = target.size_usd * p / 100.0;
            if size_usd > 0.0 {
                rungs.push(TpRung {
                    price: target.price,
                    size_usd,
                });
            }
        }
    }
    rungs
}
