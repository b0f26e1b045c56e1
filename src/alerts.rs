// Telegram alert sink for screener hits. One message per large order,
// debounced per (coin, side); a 429 from the API pauses all sending for the
// server-provided retry window.

use crate::config::TelegramCfg;
use crate::types::{now_ms, BookSide, LargeOrder};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct TelegramAlerter {
    client: Client,
    bot_token: String,
    chat_id: String,
    enabled: bool,
    cooldown_ms: u64,
    last_sent: HashMap<(String, BookSide), u64>,
    paused_until_ms: u64,
}

impl TelegramAlerter {
    pub fn new(cfg: &TelegramCfg, cooldown_ms: u64) -> Self {
        Self {
            client: Client::new(),
            bot_token: cfg.bot_token.clone(),
            chat_id: cfg.chat_id.clone(),
            enabled: cfg.enabled && !cfg.bot_token.is_empty() && !cfg.chat_id.is_empty(),
            cooldown_ms,
            last_sent: HashMap::new(),
            paused_until_ms: 0,
        }
    }

    /// Debounce decision; records the send time when it says yes.
    fn should_send(&mut self, coin: &str, side: BookSide, now: u64) -> bool {
        if now < self.paused_until_ms {
            return false;
        }
        let key = (coin.to_ascii_uppercase(), side);
        match self.last_sent.get(&key) {
            Some(&last) if now.saturating_sub(last) < self.cooldown_ms => false,
            _ => {
                self.last_sent.insert(key, now);
                true
            }
        }
    }

    pub async fn notify_large_order(&mut self, order: &LargeOrder) {
        if !self.enabled {
            return;
        }
        let now = now_ms();
        if !self.should_send(&order.coin, order.side, now) {
            debug!(coin = %order.coin, side = %order.side, "alert suppressed by cooldown");
            return;
        }
        let text = format!(
            "{} {} density ${:.0} @ {} ({:.3}% from mid)",
            order.coin,
            order.side,
            order.value_usd,
            order.price,
            order.distance_percent,
        );
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({"chat_id": self.chat_id, "text": text});
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().as_u16() == 429 => {
                let retry_after = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| {
                        v.get("parameters")
                            .and_then(|p| p.get("retry_after"))
                            .and_then(Value::as_u64)
                    })
                    .unwrap_or(30);
                self.paused_until_ms = now + retry_after * 1000;
                info!(retry_after, "telegram rate limited, alerts paused");
            }
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "telegram send failed");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "telegram send error"),
        }
    }
}
