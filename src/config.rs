// Configuration loaded from config.yaml (path via --config), with env
// fallbacks for credentials.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum TradeMode {
    #[serde(rename = "SCREEN_ONLY")]
    ScreenOnly,
    #[serde(rename = "TRADE_PAPER")]
    TradePaper,
    #[serde(rename = "TRADE_LIVE")]
    TradeLive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum ExecutionVenue {
    #[serde(rename = "PAPER")]
    Paper,
    #[serde(rename = "HYPERLIQUID")]
    Hyperliquid,
    #[serde(rename = "BINANCE")]
    Binance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum EntryMode {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "MIXED")]
    Mixed,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScreenerCfg {
    #[serde(default = "default_min_order_size_usd")]
    pub min_order_size_usd: f64,
    #[serde(default = "default_max_distance_percent")]
    pub max_distance_percent: f64,
    #[serde(default = "default_alert_cooldown_ms")]
    pub alert_cooldown_ms: u64,
    /// Per-coin minimum overrides, `"BTC:5000000,ETH:3000000"`.
    #[serde(default)]
    pub min_order_size_overrides: String,
}

impl ScreenerCfg {
    pub fn overrides(&self) -> HashMap<String, f64> {
        parse_coin_overrides(&self.min_order_size_overrides)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TradeCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trade_mode")]
    pub mode: TradeMode,
    #[serde(default = "default_execution_venue")]
    pub execution_venue: ExecutionVenue,
    #[serde(default = "default_entry_mode")]
    pub entry_mode: EntryMode,

    #[serde(default = "default_position_size_usd")]
    pub position_size_usd: f64,
    #[serde(default)]
    pub max_risk_per_trade: f64,
    #[serde(default = "default_risk_natr_multiplier")]
    pub risk_natr_multiplier: f64,
    #[serde(default = "default_pnl_check_interval_ms")]
    pub pnl_check_interval_ms: u64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,

    #[serde(default = "default_natr_period")]
    pub natr_period: usize,
    #[serde(default = "default_tp_natr_levels")]
    pub tp_natr_levels: Vec<f64>,
    #[serde(default = "default_tp_percents")]
    pub tp_percents: Vec<f64>,
    #[serde(default = "default_sl_tick_offset")]
    pub sl_tick_offset: u32,

    #[serde(default = "default_anchor_min_value_fraction")]
    pub anchor_min_value_fraction: f64,
    #[serde(default = "default_anchor_min_value_usd")]
    pub anchor_min_value_usd: f64,

    /// `[min, max]` NATR offsets for the entry-limit ladder. Negative values
    /// sit behind the anchor for the given side.
    #[serde(default = "default_entry_limit_natr_range")]
    pub entry_limit_natr_range: Vec<f64>,
    #[serde(default = "default_entry_limit_proportions")]
    pub entry_limit_proportions: Vec<f64>,
    #[serde(default = "default_entry_limit_density_min_percent")]
    pub entry_limit_density_min_percent: f64,
    #[serde(default = "default_tp_limit_proportions")]
    pub tp_limit_proportions: Vec<f64>,
    #[serde(default = "default_entry_market_percent")]
    pub entry_market_percent: f64,
    #[serde(default = "default_entry_limit_percent")]
    pub entry_limit_percent: f64,

    #[serde(default = "default_max_anchor_wins")]
    pub max_anchor_wins: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_policy_rules_file")]
    pub rules_file: String,
    #[serde(default = "default_anchor_memory_file")]
    pub anchor_memory_file: String,
}

impl Default for PolicyCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            rules_file: default_policy_rules_file(),
            anchor_memory_file: default_anchor_memory_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BinanceCfg {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_recv_window")]
    pub recv_window_ms: u64,
    #[serde(default = "default_futures_base")]
    pub futures_base: String,
}

impl Default for BinanceCfg {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            recv_window_ms: default_recv_window(),
            futures_base: default_futures_base(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamCfg {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_info_url")]
    pub info_url: String,
    #[serde(default = "default_candle_poll_ms")]
    pub candle_poll_ms: u64,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            info_url: default_info_url(),
            candle_poll_ms: default_candle_poll_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct TelegramCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppCfg {
    #[serde(default)]
    pub coins: Vec<String>,
    pub screener: ScreenerCfg,
    pub trade: TradeCfg,
    #[serde(default)]
    pub policy: PolicyCfg,
    #[serde(default)]
    pub binance: BinanceCfg,
    #[serde(default)]
    pub stream: StreamCfg,
    #[serde(default)]
    pub telegram: TelegramCfg,
    #[serde(default = "default_trade_log_dir")]
    pub trade_log_dir: String,
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,
}

fn default_min_order_size_usd() -> f64 { 2_000_000.0 }
fn default_max_distance_percent() -> f64 { 0.2 }
fn default_alert_cooldown_ms() -> u64 { 300_000 }
fn default_trade_mode() -> TradeMode { TradeMode::ScreenOnly }
fn default_execution_venue() -> ExecutionVenue { ExecutionVenue::Paper }
fn default_entry_mode() -> EntryMode { EntryMode::Market }
fn default_position_size_usd() -> f64 { 1000.0 }
fn default_risk_natr_multiplier() -> f64 { 1.0 }
fn default_pnl_check_interval_ms() -> u64 { 4000 }
fn default_max_open_positions() -> usize { 3 }
fn default_natr_period() -> usize { 14 }
fn default_tp_natr_levels() -> Vec<f64> { vec![1.0, 2.0, 3.0] }
fn default_tp_percents() -> Vec<f64> { vec![40.0, 30.0, 30.0] }
fn default_sl_tick_offset() -> u32 { 2 }
fn default_anchor_min_value_fraction() -> f64 { 0.5 }
fn default_anchor_min_value_usd() -> f64 { 200_000.0 }
fn default_entry_limit_natr_range() -> Vec<f64> { vec![-0.3, 0.3] }
fn default_entry_limit_proportions() -> Vec<f64> { vec![50.0, 50.0] }
fn default_entry_limit_density_min_percent() -> f64 { 30.0 }
fn default_tp_limit_proportions() -> Vec<f64> { vec![100.0] }
fn default_entry_market_percent() -> f64 { 50.0 }
fn default_entry_limit_percent() -> f64 { 50.0 }
fn default_max_anchor_wins() -> u32 { 3 }
fn default_policy_rules_file() -> String { "policy_rules.yaml".to_string() }
fn default_anchor_memory_file() -> String { "anchor_memory.json".to_string() }
fn default_recv_window() -> u64 { 5000 }
fn default_futures_base() -> String { "https://fapi.binance.com".to_string() }
fn default_ws_url() -> String { "wss://api.hyperliquid.xyz/ws".to_string() }
fn default_info_url() -> String { "https://api.hyperliquid.xyz/info".to_string() }
fn default_candle_poll_ms() -> u64 { 20_000 }
fn default_trade_log_dir() -> String { "trades".to_string() }
fn default_event_log_dir() -> String { "logs".to_string() }

/// `"BTC:5000000,ETH:3000000"` → map. Malformed entries are skipped.
pub fn parse_coin_overrides(raw: &str) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((coin, value)) = part.split_once(':') else {
            continue;
        };
        let coin = coin.trim().to_ascii_uppercase();
        if coin.is_empty() {
            continue;
        }
        if let Ok(v) = value.trim().parse::<f64>() {
            if v.is_finite() && v > 0.0 {
                out.insert(coin, v);
            }
        }
    }
    out
}

/// Load configuration from config.yaml (or the --config path).
pub fn load_config() -> Result<AppCfg> {
    let args: Vec<String> = std::env::args().collect();
    let path = args
        .windows(2)
        .find_map(|w| {
            if w[0] == "--config" {
                Some(w[1].clone())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "./config.yaml".to_string());

    let content = std::fs::read_to_string(&path)?;
    let mut cfg: AppCfg = serde_yaml::from_str(&content)?;

    // Credentials may come from the environment instead of the file.
    if cfg.binance.api_key.trim().is_empty() {
        if let Ok(k) = std::env::var("BINANCE_API_KEY") {
            cfg.binance.api_key = k;
        }
    }
    if cfg.binance.secret_key.trim().is_empty() {
        if let Ok(s) = std::env::var("BINANCE_API_SECRET") {
            cfg.binance.secret_key = s;
        }
    }
    if cfg.telegram.bot_token.trim().is_empty() {
        if let Ok(t) = std::env::var("TELEGRAM_BOT_TOKEN") {
            cfg.telegram.bot_token = t;
        }
    }

    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_config(cfg: &AppCfg) -> Result<()> {
    if cfg.screener.min_order_size_usd <= 0.0 {
        return Err(anyhow!("screener.min_order_size_usd must be positive"));
    }
    if cfg.screener.max_distance_percent < 0.0 {
        return Err(anyhow!("screener.max_distance_percent must be non-negative"));
    }
    if cfg.trade.position_size_usd <= 0.0 {
        return Err(anyhow!("trade.position_size_usd must be positive"));
    }
    if cfg.trade.natr_period == 0 {
        return Err(anyhow!("trade.natr_period must be at least 1"));
    }
    if cfg.trade.tp_natr_levels.len() != cfg.trade.tp_percents.len() {
        return Err(anyhow!(
            "trade.tp_natr_levels and trade.tp_percents must have equal length"
        ));
    }
    if cfg.trade.entry_limit_natr_range.len() != 2 {
        return Err(anyhow!("trade.entry_limit_natr_range must be [min, max]"));
    }
    if cfg.trade.entry_limit_natr_range[0] > cfg.trade.entry_limit_natr_range[1] {
        return Err(anyhow!("trade.entry_limit_natr_range must be ordered"));
    }
    if cfg.trade.enabled && cfg.trade.mode == TradeMode::TradeLive {
        match cfg.trade.execution_venue {
            ExecutionVenue::Binance => {
                if cfg.binance.api_key.trim().is_empty() || cfg.binance.secret_key.trim().is_empty()
                {
                    return Err(anyhow!("binance credentials required for TRADE_LIVE"));
                }
            }
            ExecutionVenue::Hyperliquid => {
                // Venue-specific execution has not been designed; refuse
                // loudly instead of trading through a stub.
                return Err(anyhow!(
                    "execution_venue HYPERLIQUID is not supported; use PAPER or BINANCE"
                ));
            }
            ExecutionVenue::Paper => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> &'static str {
        r#"
coins: ["BTC", "ETH"]
screener:
  min_order_size_usd: 2000000
  max_distance_percent: 0.2
  min_order_size_overrides: "BTC:5000000, eth:3000000,BAD,X:oops"
trade:
  enabled: true
  mode: TRADE_PAPER
  entry_mode: MARKET
  position_size_usd: 1000
  max_open_positions: 2
"#
    }

    #[test]
    fn parses_and_validates_minimal_config() {
        let cfg: AppCfg = serde_yaml::from_str(base_yaml()).unwrap();
        validate_config(&cfg).unwrap();
        assert_eq!(cfg.trade.mode, TradeMode::TradePaper);
        assert_eq!(cfg.trade.max_open_positions, 2);
        assert_eq!(cfg.trade.pnl_check_interval_ms, 4000);
        assert_eq!(cfg.binance.recv_window_ms, 5000);
    }

    #[test]
    fn coin_overrides_skip_malformed_entries() {
        let cfg: AppCfg = serde_yaml::from_str(base_yaml()).unwrap();
        let overrides = cfg.screener.overrides();
        assert_eq!(overrides.get("BTC"), Some(&5_000_000.0));
        assert_eq!(overrides.get("ETH"), Some(&3_000_000.0));
        assert_eq!(overrides.len(), 2);
    }

    #[test]
    fn rejects_mismatched_tp_arrays() {
        let mut cfg: AppCfg = serde_yaml::from_str(base_yaml()).unwrap();
        cfg.trade.tp_natr_levels = vec![1.0, 2.0];
        cfg.trade.tp_percents = vec![100.0];
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn rejects_hyperliquid_live_venue() {
        let mut cfg: AppCfg = serde_yaml::from_str(base_yaml()).unwrap();
        cfg.trade.mode = TradeMode::TradeLive;
        cfg.trade.execution_venue = ExecutionVenue::Hyperliquid;
        assert!(validate_config(&cfg).is_err());
    }
}
