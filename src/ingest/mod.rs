// =============================================================================
// Ingestion Coordinator - backfill, then live, through one ordered channel
// =============================================================================
//
// Start-up order for one (symbol, interval):
//
//   1. register the live listener and subscribe (frames buffer from here on)
//   2. backfill [from, now) and emit it, ascending
//   3. drain the live buffer through the seam rule, then keep forwarding
//
// Seam rule, against the last backfilled candle L:
//   open_time <  L.open_time            stale replay, dropped
//   open_time == L.open_time, same      duplicate, dropped
//   open_time == L.open_time, changed   Revision (upsert, last write wins)
//   open_time >  L.open_time            Live
//
// Because the listener exists before the backfill starts, a candle closing
// between the last page and the first live frame is always seen.
// =============================================================================

pub mod refresh;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backfill::HistoricalBackfiller;
use crate::error::IngestError;
use crate::market_data::{now_ms, Candle, CandleKey, KlineInterval};
use crate::scheduler::{Job, JobFuture};
use crate::storage::StorageAdapter;
use crate::stream::{Listener, ListenerId, MarketEvent, StreamId, SubscriptionManager};

pub use refresh::refresh_indicators;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSource {
    Backfill,
    Live,
    /// Replaces the last backfilled candle.
    Revision,
}

/// One candle delivered downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    pub key: CandleKey,
    pub candle: Candle,
    pub source: UpdateSource,
}

/// A running ingestion for one (symbol, interval).
pub struct IngestionHandle {
    key: CandleKey,
    stream: StreamId,
    listener: ListenerId,
    backfilled: usize,
    updates: Option<mpsc::UnboundedReceiver<CandleUpdate>>,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

impl IngestionHandle {
    pub fn key(&self) -> &CandleKey {
        &self.key
    }

    /// Candles delivered by the backfill phase.
    pub fn backfilled(&self) -> usize {
        self.backfilled
    }

    /// Next update, or `None` once the ingestion stops or the receiver has
    /// been taken.
    pub async fn recv(&mut self) -> Option<CandleUpdate> {
        match self.updates.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Move the update receiver out, e.g. into a consumer task, while
    /// keeping the handle for `stop`.
    pub fn take_updates(&mut self) -> Option<mpsc::UnboundedReceiver<CandleUpdate>> {
        self.updates.take()
    }
}

impl std::fmt::Debug for IngestionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionHandle")
            .field("key", &self.key)
            .field("backfilled", &self.backfilled)
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Seam
// ---------------------------------------------------------------------------

/// Merge state for one ingestion: the latest candle known at the seam key.
#[derive(Debug, Default)]
struct Seam {
    last: Option<Candle>,
}

impl Seam {
    fn classify(&mut self, candle: &Candle) -> Option<UpdateSource> {
        let Some(last) = self.last.as_ref() else {
            return Some(UpdateSource::Live);
        };
        if candle.open_time < last.open_time {
            return None;
        }
        if candle.open_time == last.open_time {
            if candle == last {
                return None;
            }
            self.last = Some(candle.clone());
            return Some(UpdateSource::Revision);
        }
        Some(UpdateSource::Live)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct IngestionCoordinator {
    backfiller: Arc<HistoricalBackfiller>,
    streams: Arc<SubscriptionManager>,
    store: Option<Arc<dyn StorageAdapter>>,
}

impl IngestionCoordinator {
    pub fn new(backfiller: Arc<HistoricalBackfiller>, streams: Arc<SubscriptionManager>) -> Self {
        Self {
            backfiller,
            streams,
            store: None,
        }
    }

    /// Upsert every backfilled, live and revised candle into `store`.
    pub fn with_store(mut self, store: Arc<dyn StorageAdapter>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn streams(&self) -> &Arc<SubscriptionManager> {
        &self.streams
    }

    /// Backfill `[from, now)` for `symbol`/`interval` and hand off to the
    /// live kline stream.
    pub async fn start(
        &self,
        symbol: &str,
        interval: KlineInterval,
        from: i64,
    ) -> Result<IngestionHandle, IngestError> {
        let key = CandleKey::new(symbol, interval);
        let stream = StreamId::kline(&key.symbol, interval);

        let (live_tx, mut live_rx) = mpsc::unbounded_channel::<Candle>();
        let expected = key.clone();
        let listener: Listener = Arc::new(move |event: &MarketEvent| {
            if let MarketEvent::Kline { key, candle } = event {
                if *key == expected {
                    let _ = live_tx.send(candle.clone());
                }
            }
        });
        let listener_id = self.streams.listen(&stream, listener).await?;

        let to = now_ms();
        let backfilled = match self.backfill(&key, from, to).await {
            Ok(candles) => candles,
            Err(e) => {
                self.release(&stream, listener_id).await;
                warn!(key = %key, error = %e, "backfill failed, ingestion not started");
                return Err(e);
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        for candle in &backfilled {
            let _ = out_tx.send(CandleUpdate {
                key: key.clone(),
                candle: candle.clone(),
                source: UpdateSource::Backfill,
            });
        }
        let count = backfilled.len();

        let mut seam = Seam {
            last: backfilled.into_iter().last(),
        };
        let cancel = CancellationToken::new();
        let forwarder = {
            let cancel = cancel.clone();
            let store = self.store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let mut dropped = 0_u64;
                loop {
                    let candle = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = live_rx.recv() => match next {
                            Some(candle) => candle,
                            None => break,
                        },
                    };

                    let Some(source) = seam.classify(&candle) else {
                        dropped += 1;
                        debug!(key = %key, open_time = candle.open_time, dropped, "seam duplicate dropped");
                        continue;
                    };

                    if let Some(store) = &store {
                        if let Err(e) = store.save_candles(&key, std::slice::from_ref(&candle)).await {
                            warn!(key = %key, error = %e, "failed to persist live candle");
                        }
                    }

                    let update = CandleUpdate {
                        key: key.clone(),
                        candle,
                        source,
                    };
                    if out_tx.send(update).is_err() {
                        debug!(key = %key, "update receiver dropped");
                        break;
                    }
                }
                debug!(key = %key, "live forwarding stopped");
            })
        };

        info!(key = %key, from, backfilled = count, "ingestion started");
        Ok(IngestionHandle {
            key,
            stream,
            listener: listener_id,
            backfilled: count,
            updates: Some(out_rx),
            cancel,
            forwarder,
        })
    }

    /// Stop forwarding and drop the live listener; the stream is
    /// unsubscribed once nobody else listens to it.
    pub async fn stop(&self, handle: IngestionHandle) {
        handle.cancel.cancel();
        if let Err(e) = handle.forwarder.await {
            warn!(key = %handle.key, error = %e, "forwarder ended abnormally");
        }
        self.release(&handle.stream, handle.listener).await;
        info!(key = %handle.key, "ingestion stopped");
    }

    /// Scheduler job that re-backfills the trailing `window` into the
    /// attached store. `None` without a store.
    pub fn gap_fill_job(&self, key: CandleKey, window: Duration) -> Option<Job> {
        let store = self.store.clone()?;
        let backfiller = self.backfiller.clone();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        Some(Arc::new(move || -> JobFuture {
            let store = store.clone();
            let backfiller = backfiller.clone();
            let key = key.clone();
            Box::pin(async move {
                let to = now_ms();
                let from = to.saturating_sub(window_ms);
                let written = backfiller.backfill_into(store.as_ref(), &key, from, to).await?;
                info!(key = %key, written, "gap fill complete");
                Ok(())
            })
        }))
    }

    async fn backfill(&self, key: &CandleKey, from: i64, to: i64) -> Result<Vec<Candle>, IngestError> {
        let candles = self
            .backfiller
            .fetch_range(&key.symbol, key.interval, from, to)
            .await?;
        if let Some(store) = &self.store {
            if !candles.is_empty() {
                store.save_candles(key, &candles).await?;
            }
        }
        Ok(candles)
    }

    async fn release(&self, stream: &StreamId, listener: ListenerId) {
        self.streams.remove_listener(stream, listener);
        if self.streams.listener_count(stream) == 0 {
            self.streams.unsubscribe(stream).await;
        }
    }
}

impl std::fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("streams", &self.streams)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::tests::MockSource;
    use crate::backfill::{KlineSource, PageRequest};
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryStore;
    use crate::stream::manager::tests::{kline_frame, MockTransport};
    use crate::stream::SubscriptionState;
    use async_trait::async_trait;
    use serde_json::Value;

    const MINUTE: i64 = 60_000;

    /// A live frame identical to the backfill mock's row at `open_time`.
    fn matching_frame(open_time: i64) -> String {
        let close = 100.0 + (open_time / MINUTE) as f64;
        format!(
            r#"{{"e":"kline","s":"BTCUSDT","k":{{"t":{open_time},"T":{},"i":"1m","o":"{close}","h":"{}","l":"{}","c":"{close}","v":"10.5","q":"100.0","n":42,"V":"5.0","Q":"50.0","x":true}}}}"#,
            open_time + MINUTE - 1,
            close + 1.0,
            close - 1.0
        )
    }

    fn coordinator(
        source: Arc<dyn KlineSource>,
        transport: Arc<MockTransport>,
    ) -> IngestionCoordinator {
        let backfiller = Arc::new(HistoricalBackfiller::new(source, 1000, RetryPolicy::immediate(1)));
        let streams = Arc::new(SubscriptionManager::new(
            transport,
            Duration::from_millis(10),
            RetryPolicy::immediate(1),
        ));
        IngestionCoordinator::new(backfiller, streams)
    }

    async fn next(handle: &mut IngestionHandle) -> CandleUpdate {
        tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .expect("timed out waiting for update")
            .expect("update channel closed")
    }

    #[tokio::test]
    async fn backfill_then_live_with_seam_dedup() {
        let transport = Arc::new(MockTransport::default());
        let tx = transport.push_session();

        // Frames already in flight when the subscription opens, i.e. during
        // the backfill.
        tx.send(Ok(matching_frame(3 * MINUTE))).unwrap(); // stale replay
        tx.send(Ok(matching_frame(4 * MINUTE))).unwrap(); // identical to backfill
        tx.send(Ok(kline_frame("BTCUSDT", 4 * MINUTE, 200.0, true))).unwrap(); // revised
        tx.send(Ok(kline_frame("BTCUSDT", 5 * MINUTE, 201.0, false))).unwrap(); // new

        let coord = coordinator(Arc::new(MockSource::new(0, 5)), transport);
        let mut handle = coord.start("btcusdt", KlineInterval::Min1, 0).await.unwrap();
        assert_eq!(handle.backfilled(), 5);
        assert_eq!(handle.key(), &CandleKey::new("BTCUSDT", KlineInterval::Min1));

        for i in 0..5 {
            let update = next(&mut handle).await;
            assert_eq!(update.source, UpdateSource::Backfill);
            assert_eq!(update.candle.open_time, i * MINUTE);
        }

        let revision = next(&mut handle).await;
        assert_eq!(revision.source, UpdateSource::Revision);
        assert_eq!(revision.candle.open_time, 4 * MINUTE);
        assert_eq!(revision.candle.close, 200.0);

        let live = next(&mut handle).await;
        assert_eq!(live.source, UpdateSource::Live);
        assert_eq!(live.candle.open_time, 5 * MINUTE);

        // Later frames keep arriving in order.
        tx.send(Ok(kline_frame("BTCUSDT", 5 * MINUTE, 202.0, true))).unwrap();
        let update = next(&mut handle).await;
        assert_eq!((update.source, update.candle.close), (UpdateSource::Live, 202.0));

        coord.stop(handle).await;
    }

    #[tokio::test]
    async fn store_receives_backfill_and_live_upserts() {
        let transport = Arc::new(MockTransport::default());
        let tx = transport.push_session();
        tx.send(Ok(kline_frame("BTCUSDT", 2 * MINUTE, 300.0, true))).unwrap();
        tx.send(Ok(kline_frame("BTCUSDT", 3 * MINUTE, 301.0, false))).unwrap();

        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(Arc::new(MockSource::new(0, 3)), transport).with_store(store.clone());
        let mut handle = coord.start("BTCUSDT", KlineInterval::Min1, 0).await.unwrap();

        for _ in 0..5 {
            next(&mut handle).await;
        }

        let key = CandleKey::new("BTCUSDT", KlineInterval::Min1);
        let stored = store.load_candles(&key, 0, i64::MAX).await.unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[2].close, 300.0);
        assert_eq!(stored[3].close, 301.0);

        coord.stop(handle).await;
    }

    #[tokio::test]
    async fn empty_history_goes_straight_to_live() {
        let transport = Arc::new(MockTransport::default());
        let tx = transport.push_session();
        let coord = coordinator(Arc::new(MockSource::new(0, 0)), transport);

        let mut handle = coord.start("BTCUSDT", KlineInterval::Min1, 0).await.unwrap();
        assert_eq!(handle.backfilled(), 0);

        tx.send(Ok(kline_frame("BTCUSDT", 0, 1.0, false))).unwrap();
        assert_eq!(next(&mut handle).await.source, UpdateSource::Live);
        coord.stop(handle).await;
    }

    #[tokio::test]
    async fn live_updates_resume_after_a_long_outage() {
        let transport = Arc::new(MockTransport::default());
        let tx = transport.push_session();
        let coord = coordinator(Arc::new(MockSource::new(0, 0)), transport.clone());
        let mut handle = coord.start("BTCUSDT", KlineInterval::Min1, 0).await.unwrap();

        tx.send(Ok(kline_frame("BTCUSDT", 0, 1.0, true))).unwrap();
        assert_eq!(next(&mut handle).await.candle.open_time, 0);

        // Outage outlasting several full retry rounds.
        drop(tx);
        for _ in 0..400 {
            if transport.connects() >= 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(transport.connects() >= 8);
        let id = StreamId::kline("BTCUSDT", KlineInterval::Min1);
        assert_eq!(coord.streams().state(&id), SubscriptionState::Reconnecting);

        let tx = transport.push_session();
        tx.send(Ok(kline_frame("BTCUSDT", MINUTE, 2.0, false))).unwrap();
        let update = next(&mut handle).await;
        assert_eq!((update.source, update.candle.open_time), (UpdateSource::Live, MINUTE));

        coord.stop(handle).await;
    }

    struct BrokenSource;

    #[async_trait]
    impl KlineSource for BrokenSource {
        async fn fetch_page(&self, _: &PageRequest) -> Result<Vec<Value>, IngestError> {
            Ok(vec![serde_json::json!(["not", "a", "kline"])])
        }
    }

    #[tokio::test]
    async fn failed_backfill_releases_the_stream() {
        let transport = Arc::new(MockTransport::default());
        let _tx = transport.push_session();
        let coord = coordinator(Arc::new(BrokenSource), transport);

        let err = coord.start("BTCUSDT", KlineInterval::Min1, 0).await.unwrap_err();
        assert!(matches!(err, IngestError::MalformedPage(_)));

        let id = StreamId::kline("BTCUSDT", KlineInterval::Min1);
        assert_eq!(coord.streams().state(&id), SubscriptionState::Unsubscribed);
        assert_eq!(coord.streams().listener_count(&id), 0);
    }

    #[tokio::test]
    async fn stop_unsubscribes_and_closes_updates() {
        let transport = Arc::new(MockTransport::default());
        let _tx = transport.push_session();
        let coord = coordinator(Arc::new(MockSource::new(0, 2)), transport);

        let mut handle = coord.start("BTCUSDT", KlineInterval::Min1, 0).await.unwrap();
        let mut updates = handle.take_updates().unwrap();
        assert!(handle.recv().await.is_none());

        coord.stop(handle).await;

        let id = StreamId::kline("BTCUSDT", KlineInterval::Min1);
        assert_eq!(coord.streams().state(&id), SubscriptionState::Unsubscribed);

        // Backfilled updates remain readable, then the channel ends.
        assert_eq!(updates.recv().await.unwrap().source, UpdateSource::Backfill);
        assert_eq!(updates.recv().await.unwrap().source, UpdateSource::Backfill);
        assert!(updates.recv().await.is_none());
    }

    #[tokio::test]
    async fn gap_fill_job_backfills_recent_window() {
        let first_open = (now_ms() / MINUTE) * MINUTE - 10 * MINUTE;
        let source = Arc::new(MockSource::new(first_open, 10));
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(source, Arc::new(MockTransport::default())).with_store(store.clone());

        let key = CandleKey::new("BTCUSDT", KlineInterval::Min1);
        let job = coord
            .gap_fill_job(key.clone(), Duration::from_secs(3600))
            .unwrap();
        job().await.unwrap();
        job().await.unwrap();

        assert_eq!(store.candle_count(&key), 10);
    }

    #[test]
    fn no_gap_fill_without_store() {
        let coord = coordinator(Arc::new(MockSource::new(0, 0)), Arc::new(MockTransport::default()));
        assert!(coord
            .gap_fill_job(CandleKey::new("BTCUSDT", KlineInterval::Min1), Duration::from_secs(60))
            .is_none());
    }

    #[test]
    fn seam_rules() {
        let base = Candle {
            open_time: 60_000,
            close_time: 119_999,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            quote_volume: 1.0,
            trades_count: 1,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        };
        let mut seam = Seam { last: Some(base.clone()) };

        let older = Candle { open_time: 0, close_time: 59_999, ..base.clone() };
        assert_eq!(seam.classify(&older), None);
        assert_eq!(seam.classify(&base), None);

        let revised = Candle { close: 2.0, ..base.clone() };
        assert_eq!(seam.classify(&revised), Some(UpdateSource::Revision));
        assert_eq!(seam.classify(&revised), None);

        let newer = Candle { open_time: 120_000, close_time: 179_999, ..base };
        assert_eq!(seam.classify(&newer), Some(UpdateSource::Live));

        assert_eq!(Seam::default().classify(&older), Some(UpdateSource::Live));
    }
}
