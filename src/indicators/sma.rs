// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// SMA_i = (x_i + x_{i+1} + ... + x_{i+period-1}) / period
//
// Output index `i` covers the input window `[i, i + period)`, so the series is
// right-aligned with the input and has `len - period + 1` values.
// =============================================================================

/// Compute the SMA series for `data` over `period`.
///
/// Returns an empty `Vec` when `period == 0` or `data.len() < period`.
pub fn calculate_sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return Vec::new();
    }

    let period_f = period as f64;
    data.windows(period)
        .map(|w| w.iter().sum::<f64>() / period_f)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_known_values() {
        let data: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        assert_eq!(
            calculate_sma(&data, 3),
            vec![2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn sma_period_one_is_identity() {
        let data = vec![3.0, 1.0, 4.0, 1.0, 5.0];
        assert_eq!(calculate_sma(&data, 1), data);
    }

    #[test]
    fn sma_period_equals_length() {
        assert_eq!(calculate_sma(&[2.0, 4.0, 6.0], 3), vec![4.0]);
    }

    #[test]
    fn sma_insufficient_or_zero_period() {
        assert!(calculate_sma(&[1.0, 2.0], 3).is_empty());
        assert!(calculate_sma(&[1.0, 2.0], 0).is_empty());
        assert!(calculate_sma(&[], 1).is_empty());
    }
}
