// Live execution on Binance USDⓈ-M futures: signed REST, tick/step
// normalization, reduce-only closes with post-close verification.

use crate::config::BinanceCfg;
use crate::exec::{
    CloseRequest, EntrySignal, ExecutedClose, ExecutedEntry, ExecutionEngine, ForeignPosition,
    LimitOrderState, OrderPurpose,
};
use crate::types::{now_ms, OrderSide};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, Response};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use urlencoding::encode;

/// Exchange filters per symbol, cached for the process lifetime.
#[derive(Clone, Debug)]
pub struct SymbolRules {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub price_precision: usize,
    pub qty_precision: usize,
}

static FUT_RULES: Lazy<DashMap<String, Arc<SymbolRules>>> = Lazy::new(DashMap::new);

#[derive(Deserialize)]
#[serde(tag = "filterType")]
#[allow(non_snake_case)]
enum FutFilter {
    #[serde(rename = "PRICE_FILTER")]
    PriceFilter { tickSize: String },
    #[serde(rename = "LOT_SIZE")]
    LotSize { stepSize: String, minQty: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct FutExchangeInfo {
    symbols: Vec<FutExchangeSymbol>,
}

#[derive(Deserialize)]
struct FutExchangeSymbol {
    symbol: String,
    #[serde(default)]
    filters: Vec<FutFilter>,
    #[serde(rename = "pricePrecision", default)]
    price_precision: Option<usize>,
    #[serde(rename = "quantityPrecision", default)]
    qty_precision: Option<usize>,
}

#[derive(Deserialize)]
struct FutPlacedOrder {
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "avgPrice", default)]
    avg_price: Option<String>,
}

#[derive(Deserialize)]
struct FutOrderStatus {
    status: String,
}

#[derive(Deserialize)]
struct FutUserTrade {
    price: String,
    qty: String,
}

#[derive(Deserialize)]
struct FutPosition {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice", default)]
    mark_price: Option<String>,
}

fn str_dec(s: &str) -> Decimal {
    Decimal::from_str_radix(s, 10).unwrap_or(Decimal::ZERO)
}

fn scale_from_step(step: Decimal) -> usize {
    if step.is_zero() || step >= Decimal::ONE {
        return 0;
    }
    step.normalize().scale() as usize
}

fn rules_from_fut_symbol(sym: FutExchangeSymbol) -> SymbolRules {
    let mut tick = Decimal::ZERO;
    let mut step = Decimal::ZERO;
    let mut min_qty = Decimal::ZERO;

    for f in sym.filters {
        match f {
            FutFilter::PriceFilter { tickSize } => tick = str_dec(&tickSize),
            FutFilter::LotSize { stepSize, minQty } => {
                step = str_dec(&stepSize);
                min_qty = str_dec(&minQty);
            }
            FutFilter::Other => {}
        }
    }

    let tick = if tick.is_zero() { Decimal::new(1, 2) } else { tick };
    let step = if step.is_zero() { Decimal::new(1, 3) } else { step };

    SymbolRules {
        tick_size: tick,
        step_size: step,
        min_qty,
        price_precision: sym.price_precision.unwrap_or_else(|| scale_from_step(tick)),
        qty_precision: sym.qty_precision.unwrap_or_else(|| scale_from_step(step)),
    }
}

pub fn quantize_decimal(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() || step.is_sign_negative() {
        return value;
    }
    (value / step).floor() * step
}

pub fn format_decimal_fixed(value: Decimal, precision: usize) -> String {
    let scale = precision.min(28) as u32;
    let truncated = value.round_dp_with_strategy(scale, RoundingStrategy::ToZero);
    let s = truncated.to_string();
    if scale == 0 {
        return match s.find('.') {
            Some(dot) => s[..dot].to_string(),
            None => s,
        };
    }
    match s.find('.') {
        Some(dot) => {
            let (int_part, dec_part) = (&s[..dot], &s[dot + 1..]);
            if dec_part.len() < scale as usize {
                format!("{int_part}.{dec_part}{}", "0".repeat(scale as usize - dec_part.len()))
            } else {
                format!("{int_part}.{}", &dec_part[..scale as usize])
            }
        }
        None => format!("{s}.{}", "0".repeat(scale as usize)),
    }
}

/// The stream names coins bare ("BTC"); Binance futures trades the USDT perp.
pub fn symbol_for(coin: &str) -> String {
    format!("{}USDT", coin.trim().to_ascii_uppercase())
}

async fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("binance api error: {} - {}", status, body))
    }
}

async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T> {
    let resp = builder.send().await?;
    let resp = ensure_success(resp).await?;
    Ok(resp.json().await?)
}

async fn send_void(builder: RequestBuilder) -> Result<()> {
    let resp = builder.send().await?;
    ensure_success(resp).await?;
    Ok(())
}

/// "Unknown order" responses (-2011 cancel-rejected, -2013 no-such-order) are
/// success for our purposes: the order is gone either way.
fn is_unknown_order_error(err: &anyhow::Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("-2011") || text.contains("-2013") || text.contains("unknown order")
}

#[derive(Clone)]
pub struct BinanceFutures {
    base: String,
    client: Client,
    api_key: String,
    secret_key: String,
    recv_window_ms: u64,
}

impl BinanceFutures {
    pub fn new(cfg: &BinanceCfg) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base: cfg.futures_base.trim_end_matches('/').to_string(),
            client,
            api_key: cfg.api_key.clone(),
            secret_key: cfg.secret_key.clone(),
            recv_window_ms: cfg.recv_window_ms,
        })
    }

    fn sign(&self, qs: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC key initialization failed");
        mac.update(qs.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_url(&self, path: &str, mut params: Vec<String>) -> String {
        params.push(format!("timestamp={}", now_ms()));
        params.push(format!("recvWindow={}", self.recv_window_ms));
        let qs = params.join("&");
        let sig = self.sign(&qs);
        format!("{}{}?{}&signature={}", self.base, path, qs, sig)
    }

    pub async fn rules_for(&self, symbol: &str) -> Result<Arc<SymbolRules>> {
        if let Some(r) = FUT_RULES.get(symbol) {
            return Ok(r.clone());
        }
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base, encode(symbol));
        let info: FutExchangeInfo = send_json(self.client.get(url)).await?;
        let sym = info
            .symbols
            .into_iter()
            .find(|s| s.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| anyhow!("symbol {symbol} missing from exchangeInfo"))?;
        let rules = Arc::new(rules_from_fut_symbol(sym));
        FUT_RULES.insert(symbol.to_string(), rules.clone());
        Ok(rules)
    }

    async fn fetch_position(&self, symbol: &str) -> Result<(Decimal, Decimal, Option<Decimal>)> {
        let url = self.signed_url(
            "/fapi/v2/positionRisk",
            vec![format!("symbol={symbol}")],
        );
        let positions: Vec<FutPosition> =
            send_json(self.client.get(url).header("X-MBX-APIKEY", &self.api_key)).await?;
        let pos = positions
            .into_iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol));
        match pos {
            Some(p) => Ok((
                str_dec(&p.position_amt),
                str_dec(&p.entry_price),
                p.mark_price.as_deref().map(str_dec),
            )),
            None => Ok((Decimal::ZERO, Decimal::ZERO, None)),
        }
    }

    /// Volume-weighted average fill price for an order, when fills are
    /// already visible.
    async fn vwap_for_order(&self, symbol: &str, order_id: u64) -> Result<Option<(f64, f64)>> {
        let url = self.signed_url(
            "/fapi/v1/userTrades",
            vec![format!("symbol={symbol}"), format!("orderId={order_id}")],
        );
        let trades: Vec<FutUserTrade> =
            send_json(self.client.get(url).header("X-MBX-APIKEY", &self.api_key)).await?;
        let mut qty_sum = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        for t in trades {
            let price = str_dec(&t.price);
            let qty = str_dec(&t.qty);
            qty_sum += qty;
            notional += price * qty;
        }
        if qty_sum.is_zero() {
            return Ok(None);
        }
        let vwap = (notional / qty_sum).to_f64().unwrap_or(0.0);
        Ok(Some((vwap, qty_sum.to_f64().unwrap_or(0.0))))
    }

    async fn submit_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty_str: &str,
        reduce_only: bool,
    ) -> Result<FutPlacedOrder> {
        let mut params = vec![
            format!("symbol={symbol}"),
            format!("side={}", side_str(side)),
            "type=MARKET".to_string(),
            format!("quantity={qty_str}"),
            "newOrderRespType=RESULT".to_string(),
        ];
        if reduce_only {
            params.push("reduceOnly=true".to_string());
        }
        let url = self.signed_url("/fapi/v1/order", params);
        send_json(self.client.post(&url).header("X-MBX-APIKEY", &self.api_key)).await
    }

    /// Reduce-only market order for `contracts` scaled by `safety`, quantized
    /// to the step size. Returns the submitted order, or None when the
    /// quantity quantizes away (nothing left worth closing).
    async fn submit_reduce_close(
        &self,
        symbol: &str,
        exit_side: OrderSide,
        contracts: Decimal,
        safety: Decimal,
        rules: &SymbolRules,
    ) -> Result<Option<FutPlacedOrder>> {
        let qty = quantize_decimal(contracts.abs() * safety, rules.step_size);
        if qty <= Decimal::ZERO {
            return Ok(None);
        }
        let qty_str = format_decimal_fixed(qty, rules.qty_precision);
        let order = self.submit_market(symbol, exit_side, &qty_str, true).await?;
        Ok(Some(order))
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn dec_from_f64(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or(Decimal::ZERO)
}

#[async_trait]
impl ExecutionEngine for BinanceFutures {
    async fn open_position(&self, signal: &EntrySignal) -> Result<Option<ExecutedEntry>> {
        let symbol = symbol_for(&signal.coin);
        let rules = self.rules_for(&symbol).await?;

        if signal.reference_price <= 0.0 || signal.size_usd <= 0.0 {
            return Ok(None);
        }
        let raw_qty = dec_from_f64(signal.size_usd / signal.reference_price);
        let qty = quantize_decimal(raw_qty, rules.step_size);
        if qty <= Decimal::ZERO || qty < rules.min_qty {
            warn!(%symbol, %raw_qty, "entry quantity collapses under exchange filters, abstaining");
            return Ok(None);
        }
        let qty_str = format_decimal_fixed(qty, rules.qty_precision);

        let order = match self
            .submit_market(&symbol, signal.side.entry_order_side(), &qty_str, false)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!(%symbol, error = %e, "entry order rejected");
                return Ok(None);
            }
        };

        // Read back the actual fills; the response avgPrice is the fallback.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (price, filled_qty) = match self.vwap_for_order(&symbol, order.order_id).await {
            Ok(Some((vwap, fq))) => (vwap, fq),
            _ => {
                let avg = order
                    .avg_price
                    .as_deref()
                    .map(str_dec)
                    .and_then(|d| d.to_f64())
                    .filter(|p| *p > 0.0)
                    .unwrap_or(signal.reference_price);
                (avg, qty.to_f64().unwrap_or(0.0))
            }
        };

        let size_usd = price * filled_qty;
        info!(%symbol, order_id = order.order_id, price, size_usd, "live entry filled");
        Ok(Some(ExecutedEntry {
            price,
            size_usd,
            contracts: Some(filled_qty),
        }))
    }

    async fn close_position(&self, request: &CloseRequest) -> Result<ExecutedClose> {
        let symbol = symbol_for(&request.coin);
        let rules = self.rules_for(&symbol).await?;
        let exit_side = request.side.exit_order_side();

        let contracts = match request.contracts {
            Some(c) if c > 0.0 => dec_from_f64(c),
            _ => {
                let (amt, _, _) = self.fetch_position(&symbol).await?;
                amt.abs()
            }
        };

        // 110% + reduceOnly: the exchange clips the overshoot, we get a full
        // close even when the local contract count has drifted a little.
        let safety = Decimal::new(110, 2);
        let submitted = self
            .submit_reduce_close(&symbol, exit_side, contracts, safety, &rules)
            .await?;
        let order_id = submitted.map(|o| o.order_id);

        let mut exit_price = None;
        if let Some(id) = order_id {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Ok(Some((vwap, _))) = self.vwap_for_order(&symbol, id).await {
                exit_price = Some(vwap);
            }
        }

        if request.full {
            let (remaining, _, mark) = self.fetch_position(&symbol).await?;
            if !remaining.is_zero() {
                warn!(
                    %symbol,
                    remaining = %remaining,
                    reason = %request.reason,
                    "residual position after close, submitting emergency reduce-only close"
                );
                let emergency = Decimal::new(120, 2);
                self.submit_reduce_close(&symbol, exit_side, remaining, emergency, &rules)
                    .await?;
                tokio::time::sleep(Duration::from_millis(1000)).await;
                let (after, _, _) = self.fetch_position(&symbol).await?;
                if !after.is_zero() {
                    error!(
                        %symbol,
                        remaining = %after,
                        "EMERGENCY CLOSE FAILED - manual intervention required"
                    );
                    return Err(anyhow!(
                        "position {} not flat after emergency close, remaining {}",
                        symbol,
                        after
                    ));
                }
            }
            if exit_price.is_none() {
                exit_price = mark.and_then(|m| m.to_f64()).filter(|p| *p > 0.0);
            }
        }

        let price = match exit_price {
            Some(p) => p,
            None => {
                let (_, _, mark) = self.fetch_position(&symbol).await?;
                mark.and_then(|m| m.to_f64()).unwrap_or(0.0)
            }
        };
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
        let symbol = symbol_for(coin);
        let rules = self.rules_for(&symbol).await?;

        let px = quantize_decimal(dec_from_f64(price), rules.tick_size);
        let raw_qty = contracts
            .map(dec_from_f64)
            .unwrap_or_else(|| {
                if price > 0.0 {
                    dec_from_f64(size_usd / price)
                } else {
                    Decimal::ZERO
                }
            });
        let qty = quantize_decimal(raw_qty, rules.step_size);
        if px <= Decimal::ZERO || qty <= Decimal::ZERO || qty < rules.min_qty {
            warn!(%symbol, price, size_usd, "limit order normalizes to zero, abstaining");
            return Ok(None);
        }

        let price_str = format_decimal_fixed(px, rules.price_precision);
        let qty_str = format_decimal_fixed(qty, rules.qty_precision);

        let mut params = vec![
            format!("symbol={symbol}"),
            format!("side={}", side_str(side)),
            "type=LIMIT".to_string(),
            "timeInForce=GTC".to_string(),
            format!("price={price_str}"),
            format!("quantity={qty_str}"),
            "newOrderRespType=RESULT".to_string(),
        ];
        if purpose == OrderPurpose::Tp {
            params.push("reduceOnly=true".to_string());
        }
        let url = self.signed_url("/fapi/v1/order", params);
        let placed: FutPlacedOrder =
            send_json(self.client.post(&url).header("X-MBX-APIKEY", &self.api_key)).await?;

        info!(%symbol, order_id = placed.order_id, %price_str, %qty_str, ?purpose, "limit order placed");
        Ok(Some(LimitOrderState::new(
            placed.order_id.to_string(),
            coin,
            side,
            px.to_f64().unwrap_or(price),
            size_usd,
            qty.to_f64(),
            purpose,
        )))
    }

    async fn cancel_limit_order(&self, order: &mut LimitOrderState) -> Result<()> {
        if !order.is_active() {
            return Ok(());
        }
        let symbol = symbol_for(&order.coin);
        let url = self.signed_url(
            "/fapi/v1/order",
            vec![
                format!("symbol={symbol}"),
                format!("orderId={}", order.order_id),
            ],
        );
        match send_void(self.client.delete(&url).header("X-MBX-APIKEY", &self.api_key)).await {
            Ok(()) => {
                order.mark_cancelled(now_ms());
                Ok(())
            }
            Err(e) if is_unknown_order_error(&e) => {
                // Already gone on the exchange; locally it is cancelled now.
                order.mark_cancelled(now_ms());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn check_limit_order_status(&self, order: &LimitOrderState) -> Result<Option<bool>> {
        let symbol = symbol_for(&order.coin);
        let url = self.signed_url(
            "/fapi/v1/order",
            vec![
                format!("symbol={symbol}"),
                format!("orderId={}", order.order_id),
            ],
        );
        let status: FutOrderStatus =
            send_json(self.client.get(url).header("X-MBX-APIKEY", &self.api_key)).await?;
        Ok(Some(status.status.eq_ignore_ascii_case("FILLED")))
    }

    async fn sync_open_positions(&self) -> Result<Vec<ForeignPosition>> {
        let url = self.signed_url("/fapi/v2/positionRisk", Vec::new());
        let positions: Vec<FutPosition> =
            send_json(self.client.get(url).header("X-MBX-APIKEY", &self.api_key)).await?;
        let mut foreign = Vec::new();
        for p in positions {
            let amt = str_dec(&p.position_amt);
            if amt.is_zero() {
                continue;
            }
            foreign.push(ForeignPosition {
                coin: p.symbol.clone(),
                contracts: amt.to_f64().unwrap_or(0.0),
                entry_price: str_dec(&p.entry_price).to_f64().unwrap_or(0.0),
            });
        }
        Ok(foreign)
    }

    async fn get_position_contracts(&self, coin: &str) -> Result<f64> {
        let symbol = symbol_for(coin);
        let (amt, _, _) = self.fetch_position(&symbol).await?;
        Ok(amt.to_f64().unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantize_floors_to_step() {
        assert_eq!(quantize_decimal(dec!(0.2593620616), dec!(0.001)), dec!(0.259));
        assert_eq!(quantize_decimal(dec!(76.4964), dec!(0.001)), dec!(76.496));
        assert_eq!(quantize_decimal(dec!(5), dec!(0)), dec!(5));
    }

    #[test]
    fn format_truncates_and_pads() {
        assert_eq!(format_decimal_fixed(dec!(0.123456), 3), "0.123");
        assert_eq!(format_decimal_fixed(dec!(5), 0), "5");
        assert_eq!(format_decimal_fixed(dec!(1.2), 4), "1.2000");
        assert_eq!(format_decimal_fixed(dec!(100.5), 0), "100");
        assert_eq!(format_decimal_fixed(dec!(202.129776525), 2), "202.12");
    }

    #[test]
    fn scale_from_step_matches_precision() {
        assert_eq!(scale_from_step(dec!(0.01)), 2);
        assert_eq!(scale_from_step(dec!(0.0001)), 4);
        assert_eq!(scale_from_step(dec!(1)), 0);
        assert_eq!(scale_from_step(dec!(10)), 0);
    }

    #[test]
    fn coin_maps_to_usdt_perp_symbol() {
        assert_eq!(symbol_for("btc"), "BTCUSDT");
        assert_eq!(symbol_for(" ETH "), "ETHUSDT");
    }

    #[test]
    fn unknown_order_errors_are_recognized() {
        assert!(is_unknown_order_error(&anyhow!(
            "binance api error: 400 - {{\"code\":-2011,\"msg\":\"Unknown order sent.\"}}"
        )));
        assert!(is_unknown_order_error(&anyhow!("code -2013: no such order")));
        assert!(!is_unknown_order_error(&anyhow!("code -1111: precision")));
    }

    #[test]
    fn lot_size_parsing_keeps_min_qty() {
        let raw = r#"{
            "symbols": [{
                "symbol": "BTCUSDT",
                "pricePrecision": 2,
                "quantityPrecision": 3,
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                    {"filterType": "PERCENT_PRICE", "multiplierUp": "1.1"}
                ]
            }]
        }"#;
        let info: FutExchangeInfo = serde_json::from_str(raw).unwrap();
        let rules = rules_from_fut_symbol(info.symbols.into_iter().next().unwrap());
        assert_eq!(rules.tick_size, dec!(0.10));
        assert_eq!(rules.step_size, dec!(0.001));
        assert_eq!(rules.min_qty, dec!(0.001));
        assert_eq!(rules.price_precision, 2);
        assert_eq!(rules.qty_precision, 3);
    }
}
