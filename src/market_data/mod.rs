pub mod candle;
pub mod depth;
pub mod interval;
pub mod trade;

// Re-exports for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::{Candle, CandleKey};
pub use depth::{DepthLevel, DepthSequencer, DepthSnapshot};
pub use interval::{interval_to_ms, KlineInterval};
pub use trade::Trade;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
