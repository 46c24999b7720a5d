// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ), where σ is the population standard deviation
// of the window (divide by `period`, not `period - 1`).
// =============================================================================

use super::sma::calculate_sma;

/// Multiplier used when the caller does not pick one.
pub const DEFAULT_STD_DEV_MULTIPLIER: f64 = 2.0;

/// One point of the band series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBand {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Compute the band series; index `i` covers the window `[i, i + period)`.
///
/// Returns an empty `Vec` when `period == 0` or `data.len() < period`.
pub fn calculate_bollinger(data: &[f64], period: usize, num_std: f64) -> Vec<BollingerBand> {
    let middles = calculate_sma(data, period);
    let period_f = period as f64;

    middles
        .iter()
        .zip(data.windows(period.max(1)))
        .map(|(&middle, window)| {
            let variance =
                window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period_f;
            let std_dev = variance.sqrt();
            BollingerBand {
                upper: middle + num_std * std_dev,
                middle,
                lower: middle - num_std * std_dev,
            }
        })
        .collect()
}
