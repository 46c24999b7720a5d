// =============================================================================
// Storage adapters - persisted candles and indicator series
// =============================================================================
//
// Identity keys (upsert, last write wins):
//   candles     (symbol, interval, open_time)
//   indicators  (symbol, indicator, period, timestamp)
// =============================================================================

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::indicators::{IndicatorEntry, IndicatorSeries};
use crate::market_data::{Candle, CandleKey};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Upsert `candles` under `key`.
    async fn save_candles(&self, key: &CandleKey, candles: &[Candle]) -> Result<(), StorageError>;

    /// Candles with `open_time >= from` and `close_time <= to`, ascending.
    async fn load_candles(
        &self,
        key: &CandleKey,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, StorageError>;

    /// Upsert every entry of `series` for `symbol`.
    async fn save_indicator_results(
        &self,
        symbol: &str,
        series: &IndicatorSeries,
    ) -> Result<(), StorageError>;

    /// Entries with `from <= timestamp <= to`, ascending.
    async fn query_indicator(
        &self,
        symbol: &str,
        indicator: &str,
        period: usize,
        from: i64,
        to: i64,
    ) -> Result<Vec<IndicatorEntry>, StorageError>;
}
