// =============================================================================
// Historical Backfiller - gapless candle ranges from a paginated REST feed
// =============================================================================
//
// Pages are requested strictly in time order for one (symbol, interval):
//
//   cursor = from
//   while cursor < to:
//       page   = source.fetch_page(cursor, to - 1, page_size)   (retried)
//       cursor = last_open_time + interval
//       stop on an empty page or a short page
//
// Every row must open strictly after the previous one (across pages) and at or
// after the cursor. A provider that replays or rewinds timestamps fails the
// call with `MalformedPage` instead of spinning forever.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::IngestError;
use crate::market_data::candle::candle_from_rest_row;
use crate::market_data::{now_ms, Candle, CandleKey, KlineInterval};
use crate::retry::{retry, RetryPolicy};
use crate::storage::StorageAdapter;

/// Largest page the exchange serves for klines.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// One bounded page query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub symbol: String,
    pub interval: KlineInterval,
    /// Inclusive.
    pub start_time: i64,
    /// Inclusive.
    pub end_time: i64,
    pub limit: u32,
}

/// Provider of raw historical kline rows in the exchange's native encoding.
#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Value>, IngestError>;
}

/// Reconstructs candle series over arbitrary ranges by paginating a
/// [`KlineSource`].
pub struct HistoricalBackfiller {
    source: Arc<dyn KlineSource>,
    page_size: u32,
    retry: RetryPolicy,
}

impl HistoricalBackfiller {
    pub fn new(source: Arc<dyn KlineSource>, page_size: u32, retry: RetryPolicy) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            retry,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch `[from, to)` ordered by open time, without duplicates.
    #[instrument(skip(self), name = "backfill::fetch_range")]
    pub async fn fetch_range(
        &self,
        symbol: &str,
        interval: KlineInterval,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, IngestError> {
        let step = interval.duration_ms();
        let symbol = symbol.to_uppercase();
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = from;
        let mut last_open: Option<i64> = None;
        let mut pages = 0_u32;

        while cursor < to {
            let request = PageRequest {
                symbol: symbol.clone(),
                interval,
                start_time: cursor,
                end_time: to - 1,
                limit: self.page_size,
            };

            let rows = retry(&self.retry, "klines page", || {
                self.source.fetch_page(&request)
            })
            .await?;
            pages += 1;

            if rows.is_empty() {
                debug!(symbol = %symbol, cursor, "empty page, provider has no more data");
                break;
            }

            let now = now_ms();
            let mut reached_end = false;
            for (i, row) in rows.iter().enumerate() {
                let candle = candle_from_rest_row(row, now).map_err(|e| {
                    IngestError::MalformedPage(format!("row {i} of page at {cursor}: {e}"))
                })?;

                if candle.close_time <= candle.open_time {
                    return Err(IngestError::MalformedPage(format!(
                        "row {i} of page at {cursor}: close time {} not after open time {}",
                        candle.close_time, candle.open_time
                    )));
                }
                if candle.open_time < cursor {
                    return Err(IngestError::MalformedPage(format!(
                        "row {i} of page at {cursor}: open time {} precedes cursor",
                        candle.open_time
                    )));
                }
                if let Some(prev) = last_open {
                    if candle.open_time <= prev {
                        return Err(IngestError::MalformedPage(format!(
                            "non-increasing open time {} after {prev}",
                            candle.open_time
                        )));
                    }
                }
                last_open = Some(candle.open_time);

                if candle.open_time >= to {
                    reached_end = true;
                    break;
                }

                if let Some(prev) = candles.last() {
                    if !prev.is_followed_by(&candle) {
                        warn!(
                            symbol = %symbol,
                            interval = %interval,
                            gap_from = prev.close_time + 1,
                            gap_to = candle.open_time,
                            "provider data has a gap"
                        );
                    }
                }
                candles.push(candle);
            }

            if reached_end || rows.len() < self.page_size as usize {
                break;
            }

            // Loop guard above ensures `last_open` is set and increasing.
            cursor = last_open.map_or(to, |t| t + step);
        }

        info!(
            symbol = %symbol,
            interval = %interval,
            from,
            to,
            pages,
            count = candles.len(),
            "backfill range fetched"
        );
        Ok(candles)
    }

    /// Fetch `[from, to)` and upsert it into `store`. Returns the number of
    /// candles written.
    pub async fn backfill_into(
        &self,
        store: &dyn StorageAdapter,
        key: &CandleKey,
        from: i64,
        to: i64,
    ) -> Result<usize, IngestError> {
        let candles = self.fetch_range(&key.symbol, key.interval, from, to).await?;
        if !candles.is_empty() {
            store.save_candles(key, &candles).await?;
        }
        Ok(candles.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MINUTE: i64 = 60_000;

    pub(crate) fn row(open_time: i64, close: f64) -> Value {
        json!([
            open_time,
            format!("{close}"),
            format!("{}", close + 1.0),
            format!("{}", close - 1.0),
            format!("{close}"),
            "10.5",
            open_time + MINUTE - 1,
            "100.0",
            42,
            "5.0",
            "50.0",
            "0"
        ])
    }

    /// Serves 1m candles opening at `first_open + i * MINUTE` for
    /// `i in 0..count`, honouring start/end/limit like the exchange does.
    pub(crate) struct MockSource {
        pub first_open: i64,
        pub count: i64,
        pub fail_first: AtomicU32,
        pub requests: Mutex<Vec<PageRequest>>,
    }

    impl MockSource {
        pub(crate) fn new(first_open: i64, count: i64) -> Self {
            Self {
                first_open,
                count,
                fail_first: AtomicU32::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl KlineSource for MockSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Value>, IngestError> {
            self.requests.lock().push(request.clone());
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(IngestError::Transport("temporarily unavailable".into()));
            }
            let rows = (0..self.count)
                .map(|i| self.first_open + i * MINUTE)
                .filter(|&t| t >= request.start_time && t <= request.end_time)
                .take(request.limit as usize)
                .map(|t| row(t, 100.0 + (t / MINUTE) as f64))
                .collect();
            Ok(rows)
        }
    }

    /// Always returns the same page, whatever is asked.
    struct StuckSource;

    #[async_trait]
    impl KlineSource for StuckSource {
        async fn fetch_page(&self, _: &PageRequest) -> Result<Vec<Value>, IngestError> {
            Ok((0..3).map(|i| row(i * MINUTE, 1.0)).collect())
        }
    }

    /// Ignores `end_time` and returns rows past the requested range.
    struct OverreachingSource;

    #[async_trait]
    impl KlineSource for OverreachingSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Value>, IngestError> {
            Ok((0..request.limit as i64)
                .map(|i| row(request.start_time + i * MINUTE, 1.0))
                .collect())
        }
    }

    struct RawSource(Vec<Value>);

    #[async_trait]
    impl KlineSource for RawSource {
        async fn fetch_page(&self, _: &PageRequest) -> Result<Vec<Value>, IngestError> {
            Ok(self.0.clone())
        }
    }

    fn backfiller(source: Arc<dyn KlineSource>, page_size: u32) -> HistoricalBackfiller {
        HistoricalBackfiller::new(source, page_size, RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn paginates_a_range_without_gaps() {
        let source = Arc::new(MockSource::new(0, 2_500));
        let bf = backfiller(source.clone(), 1000);

        let candles = bf
            .fetch_range("btcusdt", KlineInterval::Min1, 0, 2_500 * MINUTE)
            .await
            .unwrap();

        assert_eq!(candles.len(), 2_500);
        assert!(candles.windows(2).all(|w| w[0].is_followed_by(&w[1])));

        let requests = source.requests.lock();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].symbol, "BTCUSDT");
        assert_eq!(requests[1].start_time, 1_000 * MINUTE);
        assert_eq!(requests[2].start_time, 2_000 * MINUTE);
        assert!(requests.iter().all(|r| r.end_time == 2_500 * MINUTE - 1));
    }

    #[tokio::test]
    async fn stops_on_short_page() {
        let source = Arc::new(MockSource::new(0, 150));
        let bf = backfiller(source.clone(), 100);

        let candles = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 10_000 * MINUTE)
            .await
            .unwrap();

        assert_eq!(candles.len(), 150);
        assert_eq!(source.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let source = Arc::new(MockSource::new(0, 200));
        let bf = backfiller(source.clone(), 100);

        let candles = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 10_000 * MINUTE)
            .await
            .unwrap();

        // Two full pages, then an empty one ends the loop.
        assert_eq!(candles.len(), 200);
        assert_eq!(source.requests.lock().len(), 3);
    }

    #[tokio::test]
    async fn empty_range_makes_no_requests() {
        let source = Arc::new(MockSource::new(0, 10));
        let bf = backfiller(source.clone(), 100);
        let candles = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 5 * MINUTE, 5 * MINUTE)
            .await
            .unwrap();
        assert!(candles.is_empty());
        assert!(source.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn rows_at_or_after_range_end_are_dropped() {
        let bf = backfiller(Arc::new(OverreachingSource), 10);
        let candles = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 25 * MINUTE)
            .await
            .unwrap();
        assert_eq!(candles.len(), 25);
        assert_eq!(candles.last().unwrap().open_time, 24 * MINUTE);
    }

    #[tokio::test]
    async fn replayed_page_fails_fast() {
        let bf = backfiller(Arc::new(StuckSource), 3);
        let err = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 1_000 * MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MalformedPage(_)), "{err:?}");
    }

    #[tokio::test]
    async fn out_of_order_rows_fail() {
        let bf = backfiller(
            Arc::new(RawSource(vec![row(2 * MINUTE, 1.0), row(MINUTE, 1.0)])),
            10,
        );
        let err = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 10 * MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MalformedPage(_)));
    }

    #[tokio::test]
    async fn non_numeric_field_fails_the_page() {
        let bad = json!([0, "oops", "2", "0", "1", "1", MINUTE - 1, "0", 1, "0", "0"]);
        let bf = backfiller(Arc::new(RawSource(vec![bad])), 10);
        let err = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 10 * MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MalformedPage(_)));
    }

    #[tokio::test]
    async fn numeric_fields_may_arrive_as_numbers() {
        let r = json!([0, 1.0, 2.0, 0.5, 1.5, 100, MINUTE - 1, 150.0, 3, 50, 75.0]);
        let bf = backfiller(Arc::new(RawSource(vec![r])), 10);
        let candles = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 10 * MINUTE)
            .await
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 1.5);
        assert_eq!(candles[0].volume, 100.0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let source = Arc::new(MockSource::new(0, 5));
        source.fail_first.store(2, Ordering::SeqCst);
        let bf = backfiller(source.clone(), 100);
        let candles = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 5 * MINUTE)
            .await
            .unwrap();
        assert_eq!(candles.len(), 5);
        assert_eq!(source.requests.lock().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface() {
        let source = Arc::new(MockSource::new(0, 5));
        source.fail_first.store(10, Ordering::SeqCst);
        let bf = backfiller(source, 100);
        let err = bf
            .fetch_range("BTCUSDT", KlineInterval::Min1, 0, 5 * MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::RetriesExhausted { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn repeated_backfill_is_idempotent() {
        let source = Arc::new(MockSource::new(0, 1_200));
        let bf = backfiller(source, 500);
        let store = MemoryStore::new();
        let key = CandleKey::new("BTCUSDT", KlineInterval::Min1);

        let first = bf.fetch_range("BTCUSDT", KlineInterval::Min1, 0, 1_200 * MINUTE).await.unwrap();
        let second = bf.fetch_range("BTCUSDT", KlineInterval::Min1, 0, 1_200 * MINUTE).await.unwrap();
        assert_eq!(first, second);

        assert_eq!(bf.backfill_into(&store, &key, 0, 1_200 * MINUTE).await.unwrap(), 1_200);
        assert_eq!(bf.backfill_into(&store, &key, 0, 1_200 * MINUTE).await.unwrap(), 1_200);

        let stored = store.load_candles(&key, 0, i64::MAX).await.unwrap();
        assert_eq!(stored.len(), 1_200);
        assert_eq!(stored, first);
    }
}
