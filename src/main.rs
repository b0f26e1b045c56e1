// Process wiring: config, logging, market data, execution venue, engine,
// shutdown.

use anyhow::{anyhow, Result};
use density_bounce::bounce::{spawn_supervisor_timer, BounceEngine, EngineEvent};
use density_bounce::candles::CandleFeed;
use density_bounce::config::{load_config, ExecutionVenue, TradeMode};
use density_bounce::exchange::BinanceFutures;
use density_bounce::exec::ExecutionEngine;
use density_bounce::logger::EventLogger;
use density_bounce::paper::PaperEngine;
use density_bounce::stream::{MarketSubscriptions, OrderBookStream, StreamEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    let cfg = load_config()?;
    info!(
        coins = cfg.coins.len(),
        mode = ?cfg.trade.mode,
        venue = ?cfg.trade.execution_venue,
        entry_mode = ?cfg.trade.entry_mode,
        min_order_size_usd = cfg.screener.min_order_size_usd,
        max_distance_percent = cfg.screener.max_distance_percent,
        "configuration loaded"
    );

    let (event_log, log_task) = EventLogger::new(&cfg.event_log_dir);

    // Execution venue. Paper covers SCREEN_ONLY and TRADE_PAPER; live needs
    // credentials and a startup reconciliation pass.
    let venue: Arc<dyn ExecutionEngine> = if cfg.trade.mode == TradeMode::TradeLive {
        match cfg.trade.execution_venue {
            ExecutionVenue::Binance => {
                let live = BinanceFutures::new(&cfg.binance)?;
                match live.sync_open_positions().await {
                    Ok(foreign) => {
                        for p in &foreign {
                            warn!(
                                coin = %p.coin,
                                contracts = p.contracts,
                                entry_price = p.entry_price,
                                "exchange position not owned by this bot, leaving untouched"
                            );
                        }
                        info!(foreign = foreign.len(), "startup reconciliation done");
                    }
                    Err(e) => warn!(error = %e, "startup reconciliation failed"),
                }
                Arc::new(live)
            }
            ExecutionVenue::Paper => Arc::new(PaperEngine::new()),
            ExecutionVenue::Hyperliquid => {
                return Err(anyhow!("HYPERLIQUID execution venue is not supported"));
            }
        }
    } else {
        Arc::new(PaperEngine::new())
    };

    let (engine_tx, engine_rx) = mpsc::channel::<EngineEvent>(2048);

    // Market data → engine events.
    let (stream_tx, mut stream_rx) = mpsc::channel::<StreamEvent>(2048);
    let stream_handle = OrderBookStream::spawn(cfg.stream.ws_url.clone(), stream_tx);
    {
        let tx = engine_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream_rx.recv().await {
                let mapped = match event {
                    StreamEvent::Snapshot(s) => EngineEvent::Snapshot(s),
                    StreamEvent::Trades(t) => EngineEvent::Trades(t),
                    StreamEvent::AllMids(m) => EngineEvent::AllMids(m),
                };
                if tx.send(mapped).await.is_err() {
                    return;
                }
            }
        });
    }

    // Candles → engine events.
    let (candle_tx, mut candle_rx) = mpsc::channel(256);
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;
    let candle_handle = CandleFeed::spawn(
        http.clone(),
        cfg.stream.info_url.clone(),
        cfg.stream.candle_poll_ms,
        cfg.trade.natr_period,
        candle_tx,
    );
    {
        let tx = engine_tx.clone();
        tokio::spawn(async move {
            while let Some((coin, candle)) = candle_rx.recv().await {
                if tx.send(EngineEvent::Candle(coin, candle)).await.is_err() {
                    return;
                }
            }
        });
    }

    // Initial universe: one book and one candle track per configured coin,
    // checked against the exchange universe when it is reachable.
    match density_bounce::candles::fetch_universe(&http, &cfg.stream.info_url).await {
        Ok(universe) => {
            info!(assets = universe.len(), "exchange universe fetched");
            for coin in &cfg.coins {
                if !universe
                    .iter()
                    .any(|a| a.name.eq_ignore_ascii_case(coin))
                {
                    warn!(%coin, "configured coin not in exchange universe");
                }
            }
        }
        Err(e) => warn!(error = %e, "universe fetch failed, skipping coin validation"),
    }
    stream_handle.subscribe_all_assets();
    for coin in &cfg.coins {
        stream_handle.subscribe_order_book(coin);
        candle_handle.track(coin);
    }

    spawn_supervisor_timer(engine_tx.clone(), cfg.trade.pnl_check_interval_ms);

    let engine = BounceEngine::new(
        cfg,
        venue,
        Arc::new(stream_handle.clone()),
        Some(candle_handle),
        event_log,
    );
    let engine_task = tokio::spawn(engine.run(engine_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received");

    let _ = engine_tx.send(EngineEvent::Shutdown).await;
    stream_handle.shutdown();
    let _ = engine_task.await;
    drop(engine_tx);
    let _ = log_task.await;

    info!("bye");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
