// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators computed over
// ingested candles. The free functions never mutate their input and return an
// empty series on insufficient data; `IndicatorEngine` is the checked entry
// point that reports errors and attaches timestamps.

pub mod bollinger;
pub mod ema;
pub mod engine;
pub mod macd;
pub mod registry;
pub mod rsi;
pub mod sma;

pub use bollinger::{calculate_bollinger, BollingerBand};
pub use ema::calculate_ema;
pub use engine::{IndicatorEngine, IndicatorEntry, IndicatorRequest, IndicatorSeries};
pub use macd::{calculate_macd, MacdResult};
pub use registry::{CustomIndicator, IndicatorOptions, IndicatorRegistry};
pub use rsi::calculate_rsi;
pub use sma::calculate_sma;
