// Core domain types shared across the screener and the trading engine.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch")
        .as_millis() as u64
}

/// Side of the order book a resting order sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

impl std::fmt::Display for BookSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookSide::Bid => write!(f, "bid"),
            BookSide::Ask => write!(f, "ask"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Book side a bounce entry anchors to: longs lean on bid densities,
    /// shorts on ask densities.
    pub fn anchor_side(self) -> BookSide {
        match self {
            PositionSide::Long => BookSide::Bid,
            PositionSide::Short => BookSide::Ask,
        }
    }

    pub fn entry_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    pub fn exit_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

// ============================================================================
// Order book
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// The exchange publishes levels either as pair-arrays `[price, size, ...]`
/// or as keyed objects `{px|price, sz|size}`, with values that may be strings
/// or numbers. Both shapes parse into the same `BookLevel`.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(f64),
    Str(String),
}

impl NumOrStr {
    fn value(&self) -> Option<f64> {
        match self {
            NumOrStr::Num(n) => Some(*n),
            NumOrStr::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLevel {
    Pair(Vec<NumOrStr>),
    Keyed {
        #[serde(alias = "px")]
        price: NumOrStr,
        #[serde(alias = "sz")]
        size: NumOrStr,
    },
}

impl<'de> Deserialize<'de> for BookLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let raw = RawLevel::deserialize(deserializer)?;
        match raw {
            RawLevel::Pair(items) => {
                if items.len() < 2 {
                    return Err(D::Error::custom("level array needs price and size"));
                }
                let price = items[0]
                    .value()
                    .ok_or_else(|| D::Error::custom("bad level price"))?;
                let size = items[1]
                    .value()
                    .ok_or_else(|| D::Error::custom("bad level size"))?;
                Ok(BookLevel { price, size })
            }
            RawLevel::Keyed { price, size } => Ok(BookLevel {
                price: price.value().ok_or_else(|| D::Error::custom("bad level price"))?,
                size: size.value().ok_or_else(|| D::Error::custom("bad level size"))?,
            }),
        }
    }
}

/// L2 snapshot as delivered by the stream: bids descending, asks ascending,
/// a finite visible window (~20 levels per side).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub coin: String,
    #[serde(default)]
    pub time: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    /// Mid price; None when either side is empty.
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    pub fn side_levels(&self, side: BookSide) -> &[BookLevel] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }
}

/// Wire payload of an `l2Book` frame: `{coin, time, levels: [bids, asks]}`.
#[derive(Deserialize)]
pub struct L2BookData {
    pub coin: String,
    #[serde(default)]
    pub time: u64,
    pub levels: Vec<Vec<BookLevel>>,
}

impl L2BookData {
    pub fn into_snapshot(mut self) -> Option<OrderBookSnapshot> {
        if self.levels.len() < 2 {
            return None;
        }
        let asks = self.levels.pop()?;
        let bids = self.levels.pop()?;
        Some(OrderBookSnapshot {
            coin: self.coin,
            time: self.time,
            bids,
            asks,
        })
    }
}

// ============================================================================
// Trades and candles
// ============================================================================

fn num_or_str<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    NumOrStr::deserialize(deserializer)?
        .value()
        .ok_or_else(|| D::Error::custom("expected a number or numeric string"))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeTick {
    pub coin: String,
    #[serde(alias = "px", deserialize_with = "num_or_str")]
    pub price: f64,
    #[serde(alias = "sz", deserialize_with = "num_or_str")]
    pub size: f64,
    #[serde(default)]
    pub time: u64,
}

/// 5-minute OHLC bar.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

// ============================================================================
// Screener output
// ============================================================================

/// One book level that cleared the screener thresholds. Derived, ephemeral.
#[derive(Clone, Debug, Serialize)]
pub struct LargeOrder {
    pub coin: String,
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
    pub value_usd: f64,
    pub distance_percent: f64,
    pub timestamp: u64,
}

/// Canonical price rounding used wherever an anchor acts as an identity:
/// `50000.00001` and `50000.0` must collapse to the same key.
pub fn round_anchor_price(price: f64) -> f64 {
    (price * 1e4).round() / 1e4
}
