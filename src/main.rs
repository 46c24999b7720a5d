// =============================================================================
// kline-ingest - Main Entry Point
// =============================================================================
//
// Backfills every configured (symbol, interval), hands off to live streams,
// persists candles and recomputes indicators on every closed candle.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use kline_ingest::binance::{BinanceRestClient, BinanceWsTransport, RateLimitTracker};
use kline_ingest::market_data::now_ms;
use kline_ingest::stream::Listener;
use kline_ingest::{
    refresh_indicators, CandleUpdate, HistoricalBackfiller, IndicatorEngine, IndicatorRequest,
    IngestConfig, IngestionCoordinator, IntervalScheduler, MarketEvent, MemoryStore, Scheduler,
    SqliteStore, StorageAdapter, StreamId, SubscriptionManager, UpdateSource,
};

const CONFIG_PATH: &str = "ingest_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("kline-ingest starting up");

    let mut config = IngestConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        IngestConfig::default()
    });
    config.apply_env_overrides();
    config.validate().context("invalid ingest config")?;

    info!(
        symbols = ?config.symbols,
        intervals = ?config.intervals,
        lookback_hours = config.backfill_lookback_hours,
        "Configured ingestion"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store: Arc<dyn StorageAdapter> = match &config.storage_path {
        Some(path) => Arc::new(
            SqliteStore::open(path).with_context(|| format!("failed to open SQLite store at {path}"))?,
        ),
        None => {
            info!("No storage_path configured, candles are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // ── 3. Exchange clients ──────────────────────────────────────────────
    let rate_limit = Arc::new(RateLimitTracker::new());
    let rest = Arc::new(
        BinanceRestClient::with_tracker(config.rest_base_url.as_str(), rate_limit.clone())
            .context("failed to build REST client")?,
    );
    let transport = Arc::new(BinanceWsTransport::new(config.ws_base_url.as_str()));

    // The exchange's weight window is one minute.
    let rl = rate_limit.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            rl.reset_1m_weight();
        }
    });

    // ── 4. Core components ───────────────────────────────────────────────
    let streams = Arc::new(SubscriptionManager::new(
        transport,
        config.reconnect_delay(),
        config.retry,
    ));
    let backfiller = Arc::new(HistoricalBackfiller::new(rest, config.page_size, config.retry));
    let coordinator = IngestionCoordinator::new(backfiller, streams.clone()).with_store(store.clone());
    let engine = Arc::new(IndicatorEngine::new());
    let scheduler = IntervalScheduler::new();

    // ── 5. Backfill + live per (symbol, interval) ────────────────────────
    let lookback_ms = i64::try_from(config.backfill_lookback().as_millis()).unwrap_or(i64::MAX);
    let from = now_ms().saturating_sub(lookback_ms);
    let gap_fill = config.gap_fill_schedule()?;
    let mut handles = Vec::new();

    for symbol in &config.symbols {
        for &interval in &config.intervals {
            let mut handle = match coordinator.start(symbol, interval, from).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(symbol = %symbol, interval = %interval, error = %e, "Failed to start ingestion");
                    continue;
                }
            };

            if let Some(updates) = handle.take_updates() {
                tokio::spawn(consume_updates(
                    updates,
                    handle.backfilled(),
                    store.clone(),
                    engine.clone(),
                    config.indicators.clone(),
                    config.indicator_window,
                ));
            }

            if let Some(schedule) = &gap_fill {
                // Re-fetch at least two bars, or two fixed-cadence periods.
                let every = Duration::from_secs(config.gap_fill_every_secs);
                let window = (every * 2).max(Duration::from_millis(interval.duration_ms() as u64 * 2));
                if let Some(job) = coordinator.gap_fill_job(handle.key().clone(), window) {
                    scheduler.schedule_task(&format!("gap-fill:{}", handle.key()), schedule.clone(), job);
                }
            }

            handles.push(handle);
        }
    }

    // ── 6. Depth & trade streams ─────────────────────────────────────────
    for symbol in &config.symbols {
        if config.enable_depth {
            let listener: Listener = Arc::new(|event: &MarketEvent| {
                if let MarketEvent::Depth(d) = event {
                    debug!(
                        symbol = %d.symbol,
                        update_id = d.last_update_id,
                        best_bid = ?d.best_bid(),
                        best_ask = ?d.best_ask(),
                        spread_bps = ?d.spread_bps(),
                        imbalance = d.imbalance(),
                        "depth"
                    );
                }
            });
            if let Err(e) = streams.listen(&StreamId::depth(symbol), listener).await {
                error!(symbol = %symbol, error = %e, "Failed to subscribe to depth");
            }
        }

        if config.enable_trades {
            let listener: Listener = Arc::new(|event: &MarketEvent| {
                if let MarketEvent::Trade(t) = event {
                    debug!(
                        symbol = %t.symbol,
                        price = t.price,
                        quantity = t.quantity,
                        notional = t.notional(),
                        buyer_maker = t.is_buyer_maker,
                        "trade"
                    );
                }
            });
            if let Err(e) = streams.listen(&StreamId::trade(symbol), listener).await {
                error!(symbol = %symbol, error = %e, "Failed to subscribe to trades");
            }
        }
    }

    // ── 7. Stream health report ──────────────────────────────────────────
    let report_streams = streams.clone();
    let report_rl = rate_limit.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            for id in report_streams.active_streams() {
                let stats = report_streams.stats(&id);
                info!(
                    stream = %id,
                    state = ?report_streams.state(&id),
                    frames = stats.frames_received,
                    dispatched = stats.events_dispatched,
                    malformed = stats.malformed_messages,
                    stale_depth = stats.stale_depth_dropped,
                    reconnects = stats.reconnects,
                    failed_reconnects = stats.failed_reconnects,
                    "stream stats"
                );
            }
            info!(used_weight_1m = report_rl.used_weight(), "REST weight");
        }
    });

    info!(ingestions = handles.len(), "All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received - stopping gracefully");

    scheduler.shutdown().await;
    for handle in handles {
        coordinator.stop(handle).await;
    }
    streams.shutdown().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save ingest config on shutdown");
    }

    info!("kline-ingest shut down complete.");
    Ok(())
}

/// Recompute the configured indicators once the backfill has been delivered
/// and again on every closed live candle.
async fn consume_updates(
    mut updates: mpsc::UnboundedReceiver<CandleUpdate>,
    backfilled: usize,
    store: Arc<dyn StorageAdapter>,
    engine: Arc<IndicatorEngine>,
    requests: Vec<IndicatorRequest>,
    window: usize,
) {
    let mut backfill_left = backfilled;

    while let Some(update) = updates.recv().await {
        let recompute = match update.source {
            UpdateSource::Backfill => {
                backfill_left = backfill_left.saturating_sub(1);
                backfill_left == 0
            }
            UpdateSource::Live | UpdateSource::Revision => update.candle.is_closed,
        };
        if recompute {
            recompute_indicators(&store, &engine, &requests, &update, window).await;
        }
    }

    debug!("update consumer finished");
}

async fn recompute_indicators(
    store: &Arc<dyn StorageAdapter>,
    engine: &IndicatorEngine,
    requests: &[IndicatorRequest],
    update: &CandleUpdate,
    window: usize,
) {
    let key = &update.key;
    match refresh_indicators(store.as_ref(), engine, requests, key, &update.candle, window).await {
        Ok(written) => debug!(key = %key, series = written, "indicators recomputed"),
        Err(e) => warn!(key = %key, error = %e, "Failed to refresh indicators"),
    }
}
