// =============================================================================
// SQLite store - rusqlite on the blocking pool
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::indicators::{IndicatorEntry, IndicatorSeries};
use crate::market_data::{Candle, CandleKey};
use crate::storage::StorageAdapter;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candles (
    symbol                  TEXT    NOT NULL,
    interval                TEXT    NOT NULL,
    open_time               INTEGER NOT NULL,
    close_time              INTEGER NOT NULL,
    open                    REAL    NOT NULL,
    high                    REAL    NOT NULL,
    low                     REAL    NOT NULL,
    close                   REAL    NOT NULL,
    volume                  REAL    NOT NULL,
    quote_volume            REAL    NOT NULL,
    trades_count            INTEGER NOT NULL,
    taker_buy_volume        REAL    NOT NULL,
    taker_buy_quote_volume  REAL    NOT NULL,
    is_closed               INTEGER NOT NULL,
    PRIMARY KEY (symbol, interval, open_time)
);
CREATE TABLE IF NOT EXISTS indicators (
    symbol     TEXT    NOT NULL,
    indicator  TEXT    NOT NULL,
    period     INTEGER NOT NULL,
    timestamp  INTEGER NOT NULL,
    value      REAL    NOT NULL,
    PRIMARY KEY (symbol, indicator, period, timestamp)
);
";

/// Candle and indicator store backed by one SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        info!(path = %path.as_ref().display(), "SQLite store opened");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
        .map_err(StorageError::from)
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    async fn save_candles(&self, key: &CandleKey, candles: &[Candle]) -> Result<(), StorageError> {
        let symbol = key.symbol.clone();
        let interval = key.interval.as_str();
        let candles = candles.to_vec();
        let count = candles.len();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO candles
                     (symbol, interval, open_time, close_time, open, high, low, close,
                      volume, quote_volume, trades_count, taker_buy_volume,
                      taker_buy_quote_volume, is_closed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )?;
                for c in &candles {
                    stmt.execute(params![
                        symbol,
                        interval,
                        c.open_time,
                        c.close_time,
                        c.open,
                        c.high,
                        c.low,
                        c.close,
                        c.volume,
                        c.quote_volume,
                        c.trades_count as i64,
                        c.taker_buy_volume,
                        c.taker_buy_quote_volume,
                        c.is_closed,
                    ])?;
                }
            }
            tx.commit()
        })
        .await?;

        debug!(key = %key, count, "candles saved");
        Ok(())
    }

    async fn load_candles(
        &self,
        key: &CandleKey,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, StorageError> {
        let symbol = key.symbol.clone();
        let interval = key.interval.as_str();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT open_time, close_time, open, high, low, close, volume, quote_volume,
                        trades_count, taker_buy_volume, taker_buy_quote_volume, is_closed
                 FROM candles
                 WHERE symbol = ?1 AND interval = ?2 AND open_time >= ?3 AND close_time <= ?4
                 ORDER BY open_time ASC",
            )?;
            let rows = stmt
                .query_map(params![symbol, interval, from, to], |row| {
                    Ok(Candle {
                        open_time: row.get(0)?,
                        close_time: row.get(1)?,
                        open: row.get(2)?,
                        high: row.get(3)?,
                        low: row.get(4)?,
                        close: row.get(5)?,
                        volume: row.get(6)?,
                        quote_volume: row.get(7)?,
                        trades_count: row.get::<_, i64>(8)?.max(0) as u64,
                        taker_buy_volume: row.get(9)?,
                        taker_buy_quote_volume: row.get(10)?,
                        is_closed: row.get(11)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn save_indicator_results(
        &self,
        symbol: &str,
        series: &IndicatorSeries,
    ) -> Result<(), StorageError> {
        let symbol = symbol.to_uppercase();
        let name = series.name.clone();
        let period = series.period as i64;
        let entries = series.entries.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO indicators (symbol, indicator, period, timestamp, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for e in &entries {
                    stmt.execute(params![symbol, name, period, e.timestamp, e.value])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn query_indicator(
        &self,
        symbol: &str,
        indicator: &str,
        period: usize,
        from: i64,
        to: i64,
    ) -> Result<Vec<IndicatorEntry>, StorageError> {
        let symbol = symbol.to_uppercase();
        let indicator = indicator.to_string();
        let period = period as i64;

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, value FROM indicators
                 WHERE symbol = ?1 AND indicator = ?2 AND period = ?3
                   AND timestamp BETWEEN ?4 AND ?5
                 ORDER BY timestamp ASC",
            )?;
            let rows = stmt
                .query_map(params![symbol, indicator, period, from, to], |row| {
                    Ok(IndicatorEntry {
                        timestamp: row.get(0)?,
                        value: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}
