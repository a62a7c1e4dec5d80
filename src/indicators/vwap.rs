// =============================================================================
// Volume-weighted average price
// =============================================================================
//
// VWAP = Σ(typical_price · volume) / Σ(volume) over the supplied window,
// with typical_price = (high + low + close) / 3.
// =============================================================================

use super::Candle;

pub fn vwap(candles: &[Candle]) -> Option<f64> {
    let mut pv_sum = 0.0;
    let mut volume_sum = 0.0;

    for candle in candles {
        let typical = (candle.high + candle.low + candle.close) / 3.0;
        pv_sum += typical * candle.volume;
        volume_sum += candle.volume;
    }

    if volume_sum <= 0.0 {
        return None;
    }
    Some(pv_sum / volume_sum)
}

#[cfg(test)]
mod tests {
    use super::super::{flat_candles, Candle};
    use super::*;

    #[test]
    fn flat_series_returns_the_price() {
        let candles = flat_candles(20, 100.0);
        assert!((vwap(&candles).unwrap() - 100.0).abs() < 1e-12);
    }

    #[test]
    fn heavier_volume_pulls_the_average() {
        let candles = vec![
            Candle::new(0, 100.0, 100.0, 100.0, 100.0, 1.0),
            Candle::new(60_000, 200.0, 200.0, 200.0, 200.0, 9.0),
        ];
        let value = vwap(&candles).unwrap();
        assert!((value - 190.0).abs() < 1e-9);
    }

    #[test]
    fn zero_volume_yields_none() {
        let candles = vec![Candle::new(0, 1.0, 1.0, 1.0, 1.0, 0.0)];
        assert!(vwap(&candles).is_none());
        assert!(vwap(&[]).is_none());
    }
}
