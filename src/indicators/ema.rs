// =============================================================================
// Simple and exponential moving averages
// =============================================================================

/// SMA of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// EMA series seeded with the SMA of the first `period` values; one output
/// per input from index `period - 1`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut current = values[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(current);
    for &value in &values[period..] {
        current = alpha * value + (1.0 - alpha) * current;
        out.push(current);
    }
    out
}

/// Most recent EMA value.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_of_constant_series() {
        assert_eq!(sma(&[5.0; 10], 5), Some(5.0));
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0], 2), None);
        assert_eq!(sma(&[1.0], 0), None);
    }

    #[test]
    fn ema_tracks_constant_series_exactly() {
        let values = [7.0; 20];
        assert!((ema(&values, 10).unwrap() - 7.0).abs() < 1e-12);
    }

    #[test]
    fn ema_lags_a_rising_series() {
        let values: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let value = ema(&values, 10).unwrap();
        assert!(value < 29.0);
        assert!(value > 20.0);
    }

    #[test]
    fn ema_series_length() {
        let values: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(ema_series(&values, 5).len(), 16);
        assert!(ema_series(&values, 21).is_empty());
    }
}
