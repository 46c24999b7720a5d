// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` values.
// =============================================================================

/// Compute the EMA series for `data` and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Output index `i` corresponds to input index `period - 1 + i`, so the length
/// is `data.len() - period + 1`.
pub fn calculate_ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let seed: f64 = data[..period].iter().sum::<f64>() / period as f64;

    let mut result = Vec::with_capacity(data.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &value in &data[period..] {
        prev = value * multiplier + prev * (1.0 - multiplier);
        result.push(prev);
    }

    result
}
