// =============================================================================
// Relative Strength Index (RSI) - Wilder's Smoothing
// =============================================================================
//
// Step 1 - Compute price changes (deltas) from consecutive values.
// Step 2 - Seed average gain / average loss with the mean of the first
//          `period` gains / losses.
// Step 3 - Apply Wilder's smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 - RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
// =============================================================================

/// Compute the full RSI series for `data` and `period`.
///
/// The returned vector has one value per input index starting at `period`
/// (the first `period` deltas seed the averages), so its length is
/// `data.len() - period`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `data.len() < period + 1` => empty vec (need at least `period` deltas)
/// - Average loss of zero yields exactly 100.0 rather than a division by zero.
pub fn calculate_rsi(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = data.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut result = Vec::with_capacity(data.len() - period);
    result.push(rsi_from_averages(avg_gain, avg_loss));

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        result.push(rsi_from_averages(avg_gain, avg_loss));
    }

    result
}

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
