// Order-book stream client: one websocket, replayed subscriptions, bounded
// reconnect with exponential backoff. Parsed events flow into a single
// channel; snapshots for one coin keep exchange order.

use crate::types::{L2BookData, OrderBookSnapshot, TradeTick};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Snapshot(OrderBookSnapshot),
    Trades(Vec<TradeTick>),
    AllMids(HashMap<String, f64>),
}

#[derive(Debug)]
enum StreamCommand {
    Subscribe(SubKey),
    Shutdown,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
enum SubKey {
    L2Book(String),
    Trades(String),
    AllMids,
}

impl SubKey {
    fn to_subscribe_json(&self) -> Value {
        match self {
            SubKey::L2Book(coin) => {
                json!({"method": "subscribe", "subscription": {"type": "l2Book", "coin": coin}})
            }
            SubKey::Trades(coin) => {
                json!({"method": "subscribe", "subscription": {"type": "trades", "coin": coin}})
            }
            SubKey::AllMids => {
                json!({"method": "subscribe", "subscription": {"type": "allMids"}})
            }
        }
    }
}

/// On-demand subscription capability handed to the trading module, so it can
/// pull trade channels for coins it starts tracking without a back-reference
/// to the client.
pub trait MarketSubscriptions: Send + Sync {
    fn subscribe_order_book(&self, coin: &str);
    fn subscribe_trades(&self, coin: &str);
}

#[derive(Clone)]
pub struct StreamHandle {
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamHandle {
    pub fn subscribe_all_assets(&self) {
        let _ = self.cmd_tx.send(StreamCommand::Subscribe(SubKey::AllMids));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(StreamCommand::Shutdown);
    }
}

impl MarketSubscriptions for StreamHandle {
    fn subscribe_order_book(&self, coin: &str) {
        let _ = self
            .cmd_tx
            .send(StreamCommand::Subscribe(SubKey::L2Book(coin.to_ascii_uppercase())));
    }

    fn subscribe_trades(&self, coin: &str) {
        let _ = self
            .cmd_tx
            .send(StreamCommand::Subscribe(SubKey::Trades(coin.to_ascii_uppercase())));
    }
}

/// `5s · 2^(attempt−1)`, capped at 60 s.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 5u64.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(6));
    Duration::from_secs(secs.min(60))
}

/// Parse one inbound frame. Anything malformed is logged and dropped; a bad
/// message never tears the socket down.
fn parse_frame(text: &str) -> Option<StreamEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable websocket frame dropped");
            return None;
        }
    };
    let channel = value.get("channel").and_then(Value::as_str).unwrap_or("");
    let data = value.get("data")?;
    match channel {
        "l2Book" => match serde_json::from_value::<L2BookData>(data.clone()) {
            Ok(book) => book.into_snapshot().map(StreamEvent::Snapshot),
            Err(e) => {
                warn!(error = %e, "bad l2Book payload dropped");
                None
            }
        },
        "trades" => match serde_json::from_value::<Vec<TradeTick>>(data.clone()) {
            Ok(trades) => Some(StreamEvent::Trades(trades)),
            Err(e) => {
                warn!(error = %e, "bad trades payload dropped");
                None
            }
        },
        "allMids" => {
            let mids = data.get("mids").unwrap_or(data);
            let map = mids.as_object()?;
            let mut out = HashMap::with_capacity(map.len());
            for (coin, px) in map {
                let parsed = match px {
                    Value::String(s) => s.parse::<f64>().ok(),
                    Value::Number(n) => n.as_f64(),
                    _ => None,
                };
                if let Some(p) = parsed {
                    out.insert(coin.clone(), p);
                }
            }
            Some(StreamEvent::AllMids(out))
        }
        "subscriptionResponse" | "pong" => None,
        other => {
            debug!(channel = other, "ignoring unknown channel");
            None
        }
    }
}

enum ConnectionExit {
    Closed,
    Shutdown,
}

pub struct OrderBookStream;

impl OrderBookStream {
    /// Spawn the client task. Events are delivered in arrival order through
    /// `event_tx`; subscriptions survive reconnects.
    pub fn spawn(ws_url: String, event_tx: mpsc::Sender<StreamEvent>) -> StreamHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(ws_url, event_tx, cmd_rx));
        StreamHandle { cmd_tx }
    }
}

async fn run(
    ws_url: String,
    event_tx: mpsc::Sender<StreamEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCommand>,
) {
    let mut subscriptions: HashSet<SubKey> = HashSet::new();
    let mut attempt: u32 = 0;

    loop {
        info!(url = %ws_url, attempt, "connecting order-book stream");
        match connect_async(&ws_url).await {
            Ok((ws, _)) => {
                attempt = 0;
                info!(url = %ws_url, "order-book stream connected");
                match run_connection(ws, &event_tx, &mut cmd_rx, &mut subscriptions).await {
                    ConnectionExit::Shutdown => {
                        info!("order-book stream shut down");
                        return;
                    }
                    ConnectionExit::Closed => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "order-book stream connect failed");
            }
        }

        attempt += 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            error!(
                attempts = MAX_RECONNECT_ATTEMPTS,
                "order-book stream gave up reconnecting"
            );
            return;
        }
        let delay = backoff_delay(attempt);
        warn!(attempt, delay_s = delay.as_secs(), "order-book stream reconnecting");

        // Keep absorbing subscription requests while backing off so they are
        // replayed once the socket is back.
        let sleep_until = sleep(delay);
        tokio::pin!(sleep_until);
        loop {
            tokio::select! {
                _ = &mut sleep_until => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(StreamCommand::Subscribe(key)) => { subscriptions.insert(key); }
                    Some(StreamCommand::Shutdown) | None => return,
                },
            }
        }
    }
}

async fn run_connection(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    event_tx: &mpsc::Sender<StreamEvent>,
    cmd_rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
    subscriptions: &mut HashSet<SubKey>,
) -> ConnectionExit {
    let (mut sink, mut source) = ws.split();

    // Replay every known subscription before reading a single message.
    for key in subscriptions.iter() {
        let msg = key.to_subscribe_json().to_string();
        if let Err(e) = sink.send(Message::Text(msg)).await {
            warn!(error = %e, "subscription replay failed");
            return ConnectionExit::Closed;
        }
    }
    if !subscriptions.is_empty() {
        info!(count = subscriptions.len(), "subscriptions replayed");
    }

    let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_frame(&text) {
                            if event_tx.send(event).await.is_err() {
                                // Engine is gone; nothing left to feed.
                                return ConnectionExit::Shutdown;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return ConnectionExit::Closed;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("order-book stream closed by peer");
                        return ConnectionExit::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "order-book stream read error");
                        return ConnectionExit::Closed;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(StreamCommand::Subscribe(key)) => {
                        if subscriptions.insert(key.clone()) {
                            let msg = key.to_subscribe_json().to_string();
                            if let Err(e) = sink.send(Message::Text(msg)).await {
                                warn!(error = %e, "subscribe send failed");
                                return ConnectionExit::Closed;
                            }
                        }
                    }
                    Some(StreamCommand::Shutdown) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return ConnectionExit::Shutdown;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return ConnectionExit::Closed;
                }
            }
        }
    }
}
