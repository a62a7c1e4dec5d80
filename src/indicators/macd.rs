// =============================================================================
// MACD — moving average convergence/divergence
// =============================================================================
//
// macd      = EMA(fast) - EMA(slow)
// signal    = EMA(macd, signal_period)
// histogram = macd - signal
// =============================================================================

use super::ema::ema_series;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Most recent MACD triple for (fast, slow, signal) periods, conventionally
/// (12, 26, 9).
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    if fast == 0 || slow <= fast || signal_period == 0 || closes.len() < slow + signal_period {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);

    // Align the two series at the most recent value.
    let len = slow_series.len().min(fast_series.len());
    if len == 0 {
        return None;
    }
    let fast_tail = &fast_series[fast_series.len() - len..];
    let slow_tail = &slow_series[slow_series.len() - len..];

    let macd_line: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema_series(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd_value = *macd_line.last()?;

    Some(Macd {
        macd: macd_value,
        signal,
        histogram: macd_value - signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_enough_history() {
        let closes: Vec<f64> = (0..30).map(|i| i as f64).collect();
        assert!(macd(&closes, 12, 26, 9).is_none());
        assert!(macd(&closes, 26, 12, 9).is_none());
    }

    #[test]
    fn flat_series_is_zero_everywhere() {
        let closes = [50.0; 60];
        let m = macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-9);
        assert!(m.signal.abs() < 1e-9);
        assert!(m.histogram.abs() < 1e-9);
    }

    #[test]
    fn rising_series_has_positive_macd() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64).collect();
        let m = macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd > 0.0);
    }

    #[test]
    fn falling_series_has_negative_macd() {
        let closes: Vec<f64> = (0..80).map(|i| 200.0 - i as f64).collect();
        let m = macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd < 0.0);
    }
}
