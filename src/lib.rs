// Density-anchor screener and bounce trading bot.
//
// Market data comes in over a Hyperliquid-style L2 websocket, the screener
// flags unusually large resting orders ("density anchors"), and the bounce
// module trades reversals off those anchors with NATR-scaled take-profit
// ladders. Execution is either simulated (paper) or routed to Binance
// USDⓈ-M futures.

pub mod alerts;
pub mod anchor_memory;
pub mod bounce;
pub mod candles;
pub mod config;
pub mod context;
pub mod detector;
pub mod exec;
pub mod exchange;
pub mod logger;
pub mod natr;
pub mod paper;
pub mod policy;
pub mod position;
pub mod risk;
pub mod stream;
pub mod trade_log;
pub mod types;

pub use config::AppCfg;
pub use types::*;
