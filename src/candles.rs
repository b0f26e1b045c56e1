// Candle feed: periodic poll of the /info candle endpoint for every tracked
// coin, forwarding newly closed 5-minute bars to the engine. Tracking is
// additive; a coin is never dropped.

use crate::types::{now_ms, Candle};
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

pub const CANDLE_INTERVAL: &str = "5m";
pub const CANDLE_INTERVAL_MS: u64 = 5 * 60 * 1000;

#[derive(Debug)]
enum FeedCommand {
    Track(String),
    Shutdown,
}

#[derive(Clone)]
pub struct CandleFeedHandle {
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
}

impl CandleFeedHandle {
    pub fn track(&self, coin: &str) {
        let _ = self
            .cmd_tx
            .send(FeedCommand::Track(coin.to_ascii_uppercase()));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(FeedCommand::Shutdown);
    }
}

pub struct CandleFeed;

impl CandleFeed {
    /// Spawn the poller. `warmup_bars` closed candles are backfilled when a
    /// coin is first tracked so the NATR seed does not wait for live bars.
    pub fn spawn(
        client: Client,
        info_url: String,
        poll_ms: u64,
        warmup_bars: usize,
        candle_tx: mpsc::Sender<(String, Candle)>,
    ) -> CandleFeedHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(client, info_url, poll_ms, warmup_bars, candle_tx, cmd_rx));
        CandleFeedHandle { cmd_tx }
    }
}

async fn run(
    client: Client,
    info_url: String,
    poll_ms: u64,
    warmup_bars: usize,
    candle_tx: mpsc::Sender<(String, Candle)>,
    mut cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
) {
    let mut tracked: HashSet<String> = HashSet::new();
    let mut last_sent: HashMap<String, u64> = HashMap::new();
    let mut tick = interval(Duration::from_millis(poll_ms.max(1000)));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(FeedCommand::Track(coin)) => {
                    if tracked.insert(coin.clone()) {
                        info!(%coin, "candle feed tracking coin");
                        backfill(&client, &info_url, &coin, warmup_bars, &mut last_sent, &candle_tx)
                            .await;
                    }
                }
                Some(FeedCommand::Shutdown) | None => {
                    info!("candle feed stopped");
                    return;
                }
            },
            _ = tick.tick() => {
                for coin in tracked.iter() {
                    // A failing coin is skipped, never the whole tick.
                    match fetch_recent(&client, &info_url, coin, 3).await {
                        Ok(candles) => {
                            forward_closed(coin, candles, &mut last_sent, &candle_tx).await;
                        }
                        Err(e) => {
                            warn!(%coin, error = %e, "candle fetch failed, skipping coin this tick");
                        }
                    }
                }
            }
        }
    }
}

async fn backfill(
    client: &Client,
    info_url: &str,
    coin: &str,
    warmup_bars: usize,
    last_sent: &mut HashMap<String, u64>,
    candle_tx: &mpsc::Sender<(String, Candle)>,
) {
    match fetch_recent(client, info_url, coin, warmup_bars + 2).await {
        Ok(candles) => {
            let n = candles.len();
            forward_closed(coin, candles, last_sent, candle_tx).await;
            debug!(%coin, bars = n, "candle warm-up backfill done");
        }
        Err(e) => {
            warn!(%coin, error = %e, "candle warm-up backfill failed");
        }
    }
}

async fn forward_closed(
    coin: &str,
    candles: Vec<Candle>,
    last_sent: &mut HashMap<String, u64>,
    candle_tx: &mpsc::Sender<(String, Candle)>,
) {
    let now = now_ms();
    let last = last_sent.entry(coin.to_string()).or_insert(0);
    for candle in candles {
        let closes_at = candle.timestamp_ms + CANDLE_INTERVAL_MS;
        if closes_at > now || candle.timestamp_ms <= *last {
            continue;
        }
        *last = candle.timestamp_ms;
        if candle_tx
            .send((coin.to_string(), candle))
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn fetch_recent(
    client: &Client,
    info_url: &str,
    coin: &str,
    bars: usize,
) -> Result<Vec<Candle>> {
    let end = now_ms();
    let start = end.saturating_sub(CANDLE_INTERVAL_MS * (bars as u64 + 1));
    let payload = json!({
        "type": "candleSnapshot",
        "req": {
            "coin": coin,
            "interval": CANDLE_INTERVAL,
            "startTime": start,
            "endTime": end
        }
    });
    let resp = client.post(info_url).json(&payload).send().await?;
    if !resp.status().is_success() {
        return Err(anyhow!("candleSnapshot HTTP {}", resp.status()));
    }
    let value: Value = resp.json().await?;
    parse_candles(&value)
}

/// One tradeable asset from the exchange universe.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct AssetMeta {
    pub name: String,
    #[serde(rename = "szDecimals", default)]
    pub sz_decimals: u32,
}

#[derive(serde::Deserialize)]
struct MetaResponse {
    universe: Vec<AssetMeta>,
}

/// `POST /info {type:"meta"}` → the exchange universe.
pub async fn fetch_universe(client: &Client, info_url: &str) -> Result<Vec<AssetMeta>> {
    let resp = client
        .post(info_url)
        .json(&json!({"type": "meta"}))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(anyhow!("meta HTTP {}", resp.status()));
    }
    let meta: MetaResponse = resp.json().await?;
    Ok(meta.universe)
}

/// `POST /info {type:"allMids"}` → current mid per coin (string prices).
pub async fn fetch_all_mids(
    client: &Client,
    info_url: &str,
) -> Result<std::collections::HashMap<String, f64>> {
    let resp = client
        .post(info_url)
        .json(&json!({"type": "allMids"}))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(anyhow!("allMids HTTP {}", resp.status()));
    }
    let raw: std::collections::HashMap<String, Value> = resp.json().await?;
    let mut out = std::collections::HashMap::with_capacity(raw.len());
    for (coin, px) in raw {
        let parsed = match &px {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        };
        if let Some(p) = parsed {
            out.insert(coin, p);
        }
    }
    Ok(out)
}

fn num_field(obj: &Value, key: &str) -> Option<f64> {
    let v = obj.get(key)?;
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_candles(value: &Value) -> Result<Vec<Candle>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow!("candleSnapshot response is not an array"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(t) = item.get("t").and_then(Value::as_u64) else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            num_field(item, "o"),
            num_field(item, "h"),
            num_field(item, "l"),
            num_field(item, "c"),
        ) else {
            continue;
        };
        out.push(Candle {
            timestamp_ms: t,
            open,
            high,
            low,
            close,
        });
    }
    out.sort_by_key(|c| c.timestamp_ms);
    Ok(out)
}
