// End-to-end scenarios against the paper venue: entry, anchor-loss closes,
// TP ladder, policy veto, emergency stop.

use density_bounce::anchor_memory::{AnchorId, AnchorMemory};
use density_bounce::bounce::{BounceEngine, EngineEvent};
use density_bounce::config::AppCfg;
use density_bounce::exec::ExecutionEngine;
use density_bounce::logger::EventLogger;
use density_bounce::paper::PaperEngine;
use density_bounce::stream::MarketSubscriptions;
use density_bounce::types::{BookLevel, BookSide, Candle, OrderBookSnapshot, PositionSide};
use std::path::PathBuf;
use std::sync::Arc;

struct NoopSubs;

impl MarketSubscriptions for NoopSubs {
    fn subscribe_order_book(&self, _coin: &str) {}
    fn subscribe_trades(&self, _coin: &str) {}
}

struct Harness {
    engine: BounceEngine,
    venue: Arc<PaperEngine>,
    trade_log_dir: PathBuf,
    anchor_memory_file: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.trade_log_dir);
        let _ = std::fs::remove_file(&self.anchor_memory_file);
    }
}

fn temp_path(tag: &str, suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("bounce_{tag}_{}{suffix}", std::process::id()))
}

fn base_cfg(tag: &str) -> AppCfg {
    let yaml = r#"
coins: ["BTC"]
screener:
  min_order_size_usd: 2000000
  max_distance_percent: 0.2
trade:
  enabled: true
  mode: TRADE_PAPER
  entry_mode: MARKET
  position_size_usd: 1000
  max_risk_per_trade: 0
  max_open_positions: 2
  natr_period: 1
  tp_natr_levels: [2, 3]
  tp_percents: [50, 50]
  tp_limit_proportions: []
"#;
    let mut cfg: AppCfg = serde_yaml::from_str(yaml).unwrap();
    cfg.trade_log_dir = temp_path(tag, "_trades").to_string_lossy().into_owned();
    cfg.policy.anchor_memory_file = temp_path(tag, "_anchors.json")
        .to_string_lossy()
        .into_owned();
    cfg
}

fn harness(cfg: AppCfg) -> Harness {
    let trade_log_dir = PathBuf::from(&cfg.trade_log_dir);
    let anchor_memory_file = PathBuf::from(&cfg.policy.anchor_memory_file);
    let venue = Arc::new(PaperEngine::new());
    let engine = BounceEngine::new(
        cfg,
        venue.clone(),
        Arc::new(NoopSubs),
        None,
        EventLogger::disabled(),
    );
    Harness {
        engine,
        venue,
        trade_log_dir,
        anchor_memory_file,
    }
}

fn snap(coin: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> EngineEvent {
    EngineEvent::Snapshot(OrderBookSnapshot {
        coin: coin.to_string(),
        time: 1,
        bids: bids.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
        asks: asks.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
    })
}

fn candle(coin: &str, high: f64, low: f64, close: f64) -> EngineEvent {
    EngineEvent::Candle(
        coin.to_string(),
        Candle {
            timestamp_ms: 1,
            open: close,
            high,
            low,
            close,
        },
    )
}

fn trade_log_contents(dir: &PathBuf) -> String {
    let mut out = String::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(content) = std::fs::read_to_string(entry.path()) {
                out.push_str(&content);
            }
        }
    }
    out
}

/// Scenario A: a 3M bid resting 0.01% under the mid opens a long of 1000 at
/// the anchor price.
#[tokio::test]
async fn large_bid_opens_long() {
    let mut h = harness(base_cfg("scenario_a"));
    h.engine.handle_event(candle("BTC", 50500.0, 50000.0, 50250.0)).await;
    h.engine
        .handle_event(snap(
            "BTC",
            &[(50000.0, 60.0), (49995.0, 1.0)],
            &[(50010.0, 1.0), (50015.0, 1.0)],
        ))
        .await;

    assert_eq!(h.engine.open_position_count(), 1);
    let pos = h.engine.position("BTC").expect("position opened");
    assert_eq!(pos.side, PositionSide::Long);
    assert_eq!(pos.entry_price, 50000.0);
    assert_eq!(pos.size_usd, 1000.0);
    assert_eq!(pos.anchor_price, 50000.0);
    assert_eq!(pos.anchor_initial_value_usd, 3_000_000.0);
    assert!(h.engine.pending_is_empty());
    let contracts = h.venue.get_position_contracts("BTC").await.unwrap();
    assert!(contracts > 0.0);
}

/// Scenario B: the anchor level vanishes while its price is still inside the
/// visible window → close with anchor_removed_from_book_in_view.
#[tokio::test]
async fn anchor_removed_in_view_closes_position() {
    let mut h = harness(base_cfg("scenario_b"));
    h.engine.handle_event(candle("BTC", 50500.0, 50000.0, 50250.0)).await;
    h.engine
        .handle_event(snap(
            "BTC",
            &[(50000.0, 60.0), (49995.0, 1.0)],
            &[(50010.0, 1.0)],
        ))
        .await;
    assert_eq!(h.engine.open_position_count(), 1);

    h.engine
        .handle_event(snap(
            "BTC",
            &[(50004.0, 1.0), (50002.0, 1.0), (49995.0, 1.0)],
            &[(50010.0, 1.0)],
        ))
        .await;

    assert_eq!(h.engine.open_position_count(), 0);
    let log = trade_log_contents(&h.trade_log_dir);
    assert!(log.contains("anchor_removed_from_book_in_view"), "log: {log}");
    // The venue is flat again.
    assert_eq!(h.venue.get_position_contracts("BTC").await.unwrap(), 0.0);
}

/// Scenario C: anchor drops out of the window on the profit side of a long →
/// no action.
#[tokio::test]
async fn anchor_out_of_view_on_profit_side_holds() {
    let mut h = harness(base_cfg("scenario_c"));
    h.engine.handle_event(candle("BTC", 50500.0, 50000.0, 50250.0)).await;
    h.engine
        .handle_event(snap(
            "BTC",
            &[(50000.0, 60.0), (49995.0, 1.0)],
            &[(50010.0, 1.0)],
        ))
        .await;
    assert_eq!(h.engine.open_position_count(), 1);

    // Price ran up: visible bids [50050, 50100], anchor 50000 below.
    h.engine
        .handle_event(snap(
            "BTC",
            &[(50100.0, 1.0), (50050.0, 1.0)],
            &[(50110.0, 1.0)],
        ))
        .await;

    assert_eq!(h.engine.open_position_count(), 1);
    let pos = h.engine.position("BTC").unwrap();
    assert_eq!(pos.size_usd, 1000.0);
}

/// Scenario D: NATR-scaled market-on-touch TP ladder; two partials then the
/// final tp_all_hit close.
#[tokio::test]
async fn tp_ladder_partial_fills_then_full_close() {
    let mut h = harness(base_cfg("scenario_d"));
    // TR = 1.0 on close 100 → NATR 1%.
    h.engine.handle_event(candle("TPX", 100.5, 99.5, 100.0)).await;
    h.engine
        .handle_event(snap("TPX", &[(100.0, 30000.0)], &[(100.02, 1.0)]))
        .await;
    let pos = h.engine.position("TPX").expect("position opened");
    assert_eq!(pos.entry_price, 100.0);
    assert_eq!(pos.tp_targets.len(), 2);
    assert_eq!(pos.tp_targets[0].price, 102.0);
    assert_eq!(pos.tp_targets[1].price, 103.0);

    // Mid 102: first TP fires, half the size comes off.
    h.engine
        .handle_event(snap("TPX", &[(100.0, 30000.0)], &[(104.0, 1.0)]))
        .await;
    let pos = h.engine.position("TPX").expect("still open");
    assert_eq!(pos.size_usd, 500.0);
    assert!(pos.tp_targets[0].hit);
    assert!(!pos.tp_targets[1].hit);

    // Mid 103: second TP fires and the remainder closes.
    h.engine
        .handle_event(snap("TPX", &[(100.0, 30000.0)], &[(106.0, 1.0)]))
        .await;
    assert_eq!(h.engine.open_position_count(), 0);
    let log = trade_log_contents(&h.trade_log_dir);
    assert!(log.contains("tp_all_hit"), "log: {log}");
}

/// Scenario E: anchor memory + policy veto. Five recorded wins on the anchor
/// trip `anchorWinCountGte: 5` and the entry is refused with a clean pending
/// set.
#[tokio::test]
async fn policy_vetoes_overtraded_anchor() {
    let mut cfg = base_cfg("scenario_e");
    let rules_file = temp_path("scenario_e", "_rules.yaml");
    std::fs::write(
        &rules_file,
        r#"
- name: block-hot-anchor
  priority: 10
  scope: new_entry
  when: { anchorWinCountGte: 5 }
  then: { allowTrade: false }
"#,
    )
    .unwrap();
    cfg.policy.enabled = true;
    cfg.policy.rules_file = rules_file.to_string_lossy().into_owned();
    cfg.coins = vec!["ETH".into()];
    // Keep the anchor-memory win gate out of the way so the policy rule is
    // what refuses the trade.
    cfg.trade.max_anchor_wins = 10;

    // Seed the anchor memory with five winning trades at (ETH, 3000, bid).
    {
        let mut memory = AnchorMemory::load(&cfg.policy.anchor_memory_file);
        let id = AnchorId::new("ETH", 3000.0, BookSide::Bid);
        for i in 0..5 {
            memory.record_trade(&id, 10.0, 1.0, 1000.0, i);
        }
    }

    let mut h = harness(cfg);
    h.engine.handle_event(candle("ETH", 3010.0, 2990.0, 3000.0)).await;
    h.engine
        .handle_event(snap("ETH", &[(3000.0, 1000.0)], &[(3000.5, 1.0)]))
        .await;

    assert_eq!(h.engine.open_position_count(), 0);
    assert!(h.engine.pending_is_empty());
    assert_eq!(h.venue.get_position_contracts("ETH").await.unwrap(), 0.0);

    let _ = std::fs::remove_file(&rules_file);
}

/// Emergency stop: unrealized loss beyond the risk budget force-closes on the
/// supervisor tick.
#[tokio::test]
async fn pnl_supervisor_emergency_stop() {
    let mut cfg = base_cfg("emergency");
    cfg.trade.max_risk_per_trade = 50.0;
    cfg.trade.risk_natr_multiplier = 1.0;
    // Resting TP limits so the close path also exercises cancels.
    cfg.trade.tp_limit_proportions = vec![100.0];

    let mut h = harness(cfg);
    // NATR = 1% → base size = 50 / (1/100) = 5000.
    h.engine.handle_event(candle("BTC", 100.5, 99.5, 100.0)).await;
    h.engine
        .handle_event(snap("BTC", &[(100.0, 30000.0)], &[(100.02, 1.0)]))
        .await;
    let pos = h.engine.position("BTC").expect("position opened");
    assert!((pos.size_usd - 5000.0).abs() < 1e-9);
    assert!(!pos.tp_limit_orders.is_empty());

    // Mid collapses to 95 while the anchor keeps its value: -5% on 5000 is
    // -250, far past the 50 risk budget.
    h.engine
        .handle_event(snap("BTC", &[(100.0, 30000.0)], &[(90.0, 1.0)]))
        .await;
    assert_eq!(h.engine.open_position_count(), 1);

    h.engine.handle_event(EngineEvent::SupervisorTick).await;
    assert_eq!(h.engine.open_position_count(), 0);

    let log = trade_log_contents(&h.trade_log_dir);
    assert!(log.contains("emergency_stop_loss_pnl="), "log: {log}");
    assert_eq!(h.venue.get_position_contracts("BTC").await.unwrap(), 0.0);
}

/// LIMIT entry mode: a ladder of resting entries, TP installation on the
/// first fill.
#[tokio::test]
async fn limit_entry_ladder_fills_and_installs_tps() {
    let mut cfg = base_cfg("limit_entry");
    cfg.trade.entry_mode = density_bounce::config::EntryMode::Limit;
    cfg.trade.entry_limit_natr_range = vec![-0.5, 0.5];
    cfg.trade.entry_limit_proportions = vec![50.0, 50.0];
    cfg.trade.tp_limit_proportions = vec![100.0];

    let mut h = harness(cfg);
    h.engine.handle_event(candle("BTC", 100.5, 99.5, 100.0)).await;
    // Anchor bid at 100; NATR 1% → natr_step 1.0; rungs at 99.5 and 100.5.
    h.engine
        .handle_event(snap("BTC", &[(100.0, 30000.0)], &[(100.2, 1.0)]))
        .await;

    let pos = h.engine.position("BTC").expect("limit position created");
    assert_eq!(pos.market_filled_size_usd, 0.0);
    assert_eq!(pos.entry_limit_orders.len(), 2);
    assert!(pos.tp_limit_orders.is_empty());
    let rung_prices: Vec<f64> = pos.entry_limit_orders.iter().map(|o| o.price).collect();
    assert_eq!(rung_prices, vec![99.5, 100.5]);

    // Mid falls to 99.4: both buy rungs cross, the TP ladder goes in.
    h.engine
        .handle_event(snap("BTC", &[(100.0, 30000.0)], &[(98.8, 1.0)]))
        .await;
    let pos = h.engine.position("BTC").expect("still open");
    assert!(pos.entry_limit_orders.iter().all(|o| o.filled));
    assert_eq!(pos.limit_filled_size_usd, 1000.0);
    assert!(!pos.tp_limit_orders.is_empty());
}

/// Duplicate-coin and max-open gates: a second large order on the same coin
/// is ignored, and a third coin is refused at the cap.
#[tokio::test]
async fn entry_gates_enforce_caps() {
    let mut cfg = base_cfg("gates");
    cfg.trade.max_open_positions = 2;
    let mut h = harness(cfg);

    for coin in ["BTC", "ETH", "SOL"] {
        h.engine.handle_event(candle(coin, 100.5, 99.5, 100.0)).await;
    }
    h.engine
        .handle_event(snap("BTC", &[(100.0, 30000.0)], &[(100.02, 1.0)]))
        .await;
    // Same coin again: no double entry.
    h.engine
        .handle_event(snap("BTC", &[(100.0, 30000.0)], &[(100.02, 1.0)]))
        .await;
    assert_eq!(h.engine.open_position_count(), 1);

    h.engine
        .handle_event(snap("ETH", &[(100.0, 30000.0)], &[(100.02, 1.0)]))
        .await;
    assert_eq!(h.engine.open_position_count(), 2);

    // Cap reached.
    h.engine
        .handle_event(snap("SOL", &[(100.0, 30000.0)], &[(100.02, 1.0)]))
        .await;
    assert_eq!(h.engine.open_position_count(), 2);
    assert!(h.engine.position("SOL").is_none());
}

/// SCREEN_ONLY mode never trades, whatever the screener finds.
#[tokio::test]
async fn screen_only_mode_never_enters() {
    let mut cfg = base_cfg("screen_only");
    cfg.trade.mode = density_bounce::config::TradeMode::ScreenOnly;
    let mut h = harness(cfg);
    h.engine.handle_event(candle("BTC", 100.5, 99.5, 100.0)).await;
    h.engine
        .handle_event(snap("BTC", &[(100.0, 30000.0)], &[(100.02, 1.0)]))
        .await;
    assert_eq!(h.engine.open_position_count(), 0);
}

/// No NATR yet → abstain.
#[tokio::test]
async fn entry_abstains_without_natr() {
    let mut h = harness(base_cfg("no_natr"));
    h.engine
        .handle_event(snap("BTC", &[(100.0, 30000.0)], &[(100.02, 1.0)]))
        .await;
    assert_eq!(h.engine.open_position_count(), 0);
}
