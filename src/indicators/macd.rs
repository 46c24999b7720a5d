// =============================================================================
// Moving Average Convergence / Divergence (MACD)
// =============================================================================
//
// Both EMAs are right-aligned with the input but have different lengths:
//   fast: len - fast + 1,  slow: len - slow + 1
// The fast series therefore starts `slow - fast` values earlier, and the
// MACD line only exists where both are defined:
//
//   macd[i]      = fast_ema[i + (slow - fast)] - slow_ema[i]   i in [0, len(slow_ema))
//   signal       = EMA(macd, signal_period)
//   histogram[i] = macd[i + signal_period - 1] - signal[i]     i in [0, len(signal))
//
// Subtracting element-wise without those offsets pairs values from different
// bars and is silently wrong whenever the periods differ.
// =============================================================================

use super::ema::calculate_ema;

/// MACD line, signal line and histogram.
///
/// `macd` is aligned with the slow EMA; `signal` and `histogram` are aligned
/// with each other and with the last `signal.len()` values of `macd`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacdResult {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// Compute MACD.
///
/// Returns an empty result when any period is zero, when
/// `slow_period <= fast_period`, or when `data` is too short for the slow EMA.
/// If the MACD line is shorter than `signal_period`, `signal` and `histogram`
/// are empty while `macd` is still returned.
pub fn calculate_macd(
    data: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> MacdResult {
    if fast_period == 0 || signal_period == 0 || slow_period <= fast_period {
        return MacdResult::default();
    }

    let fast_ema = calculate_ema(data, fast_period);
    let slow_ema = calculate_ema(data, slow_period);
    if slow_ema.is_empty() {
        return MacdResult::default();
    }

    let offset = slow_period - fast_period;
    let macd: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, slow)| fast_ema[i + offset] - slow)
        .collect();

    let signal = calculate_ema(&macd, signal_period);
    let histogram: Vec<f64> = signal
        .iter()
        .enumerate()
        .map(|(i, sig)| macd[i + signal_period - 1] - sig)
        .collect();

    MacdResult {
        macd,
        signal,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten() -> Vec<f64> {
        vec![1.0, 3.0, 2.0, 5.0, 4.0, 6.0, 8.0, 7.0, 9.0, 12.0]
    }

    #[test]
    fn macd_lengths() {
        let data = ten();
        let r = calculate_macd(&data, 3, 6, 2);
        let slow = calculate_ema(&data, 6);
        assert_eq!(r.macd.len(), slow.len());
        assert_eq!(r.macd.len(), 5);
        assert_eq!(r.signal.len(), 4);
        assert_eq!(r.histogram.len(), r.signal.len());
    }

    #[test]
    fn macd_line_uses_offset_alignment() {
        let data = ten();
        let fast = calculate_ema(&data, 3);
        let slow = calculate_ema(&data, 6);
        let r = calculate_macd(&data, 3, 6, 2);
        for i in 0..slow.len() {
            assert_eq!(r.macd[i], fast[i + 3] - slow[i]);
        }
        // A naive zip pairs fast[0] with slow[0], which belong to different bars.
        assert_ne!(r.macd[0], fast[0] - slow[0]);
    }

    #[test]
    fn histogram_uses_signal_offset() {
        let data = ten();
        let r = calculate_macd(&data, 3, 6, 2);
        assert_eq!(r.histogram[0], r.macd[1] - r.signal[0]);
        for i in 0..r.signal.len() {
            assert_eq!(r.histogram[i], r.macd[i + 1] - r.signal[i]);
        }
    }

    #[test]
    fn invalid_periods_yield_empty() {
        let data = ten();
        assert_eq!(calculate_macd(&data, 6, 3, 2), MacdResult::default());
        assert_eq!(calculate_macd(&data, 3, 3, 2), MacdResult::default());
        assert_eq!(calculate_macd(&data, 0, 6, 2), MacdResult::default());
        assert_eq!(calculate_macd(&data, 3, 6, 0), MacdResult::default());
    }

    #[test]
    fn short_data_yields_empty() {
        assert_eq!(calculate_macd(&[1.0, 2.0, 3.0], 3, 6, 2), MacdResult::default());
    }

    #[test]
    fn macd_line_without_enough_for_signal() {
        // 6 values: macd has one point, signal of period 2 cannot start.
        let r = calculate_macd(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 6, 2);
        assert_eq!(r.macd.len(), 1);
        assert!(r.signal.is_empty());
        assert!(r.histogram.is_empty());
    }
}
