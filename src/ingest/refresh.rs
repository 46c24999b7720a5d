// =============================================================================
// Indicator refresh - recompute and persist series after a closed candle
// =============================================================================

use tracing::{debug, warn};

use crate::error::{IndicatorError, StorageError};
use crate::indicators::{IndicatorEngine, IndicatorRequest};
use crate::market_data::{Candle, CandleKey};
use crate::storage::StorageAdapter;

/// Recompute `requests` over the last `window` closed candles of `key` up to
/// `latest` and store every series under its interval-scoped name.
///
/// Returns the number of series written. Indicators that lack data or fail
/// are logged and skipped; only storage errors are returned.
pub async fn refresh_indicators(
    store: &dyn StorageAdapter,
    engine: &IndicatorEngine,
    requests: &[IndicatorRequest],
    key: &CandleKey,
    latest: &Candle,
    window: usize,
) -> Result<usize, StorageError> {
    let span = key.interval.duration_ms().saturating_mul(window as i64);
    let from = latest.open_time.saturating_sub(span);

    let candles: Vec<Candle> = store
        .load_candles(key, from, latest.close_time)
        .await?
        .into_iter()
        .filter(|c| c.is_closed)
        .collect();

    let mut written = 0;
    for request in requests {
        match engine.evaluate(request, &candles) {
            Ok(series) => {
                for s in series {
                    let s = s.scoped_to(key.interval);
                    store.save_indicator_results(&key.symbol, &s).await?;
                    written += 1;
                }
            }
            Err(IndicatorError::InsufficientData { required, actual }) => {
                debug!(key = %key, ?request, required, actual, "not enough candles yet");
            }
            Err(e) => warn!(key = %key, ?request, error = %e, "indicator evaluation failed"),
        }
    }

    debug!(key = %key, candles = candles.len(), written, "indicators refreshed");
    Ok(written)
}
