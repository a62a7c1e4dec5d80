// =============================================================================
// Average True Range — Wilder's smoothing
// =============================================================================
//
// true_range = max(high - low, |high - prev_close|, |low - prev_close|)
// Seed with the SMA of the first `period` true ranges, then smooth with
// Wilder's formula.
// =============================================================================

use super::Candle;

/// Most recent ATR value.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let c = &w[1];
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect();

    let period_f = period as f64;
    let mut value = true_ranges[..period].iter().sum::<f64>() / period_f;
    for &tr in &true_ranges[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }

    Some(value)
}

#[cfg(test)]
mod tests {
    use super::super::{flat_candles, ramp_candles};
    use super::*;

    #[test]
    fn flat_market_has_zero_atr() {
        let candles = flat_candles(30, 100.0);
        assert!((atr(&candles, 14).unwrap()).abs() < 1e-12);
    }

    #[test]
    fn constant_range_atr_matches_range() {
        let candles = ramp_candles(40, 100.0, 1.0);
        let value = atr(&candles, 14).unwrap();
        // Each bar spans 2 price units plus the 1-unit gap between closes.
        assert!(value > 1.0 && value < 3.5);
    }

    #[test]
    fn requires_period_plus_one_candles() {
        let candles = flat_candles(14, 100.0);
        assert!(atr(&candles, 14).is_none());
        assert!(atr(&candles, 0).is_none());
    }
}
