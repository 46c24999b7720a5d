// =============================================================================
// kline-ingest - market-data ingestion and indicator computation
// =============================================================================
//
// Historical klines are backfilled over REST, handed off to live WebSocket
// streams without gaps or duplicates, and fed to a pure indicator engine.
// The host binary in `main.rs` wires these pieces together; everything here
// is usable on its own.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
pub mod backfill;
pub mod binance;
pub mod config;
pub mod error;
pub mod indicators;
pub mod ingest;
pub mod market_data;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod stream;

pub use backfill::{HistoricalBackfiller, KlineSource, PageRequest};
pub use config::IngestConfig;
pub use error::{IndicatorError, IngestError, StorageError};
pub use indicators::{IndicatorEngine, IndicatorRequest, IndicatorSeries};
pub use ingest::{
    refresh_indicators, CandleUpdate, IngestionCoordinator, IngestionHandle, UpdateSource,
};
pub use market_data::{Candle, CandleKey, DepthSnapshot, KlineInterval, Trade};
pub use retry::RetryPolicy;
pub use scheduler::{IntervalScheduler, Schedule, Scheduler, TaskHandle};
pub use storage::{MemoryStore, SqliteStore, StorageAdapter};
pub use stream::{Channel, MarketEvent, StreamId, SubscriptionManager, SubscriptionState};
