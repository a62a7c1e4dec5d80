// =============================================================================
// Support / resistance levels and Fibonacci retracements
// =============================================================================
//
// Swing lows/highs are local extrema over a ±2 bar neighbourhood. Support is
// searched strictly below a reference price, resistance strictly above.
// =============================================================================

use super::Candle;

const SWING_WING: usize = 2;

/// Nearest swing-low support strictly below `below_price`.
pub fn nearest_support(candles: &[Candle], below_price: f64) -> Option<f64> {
    swing_lows(candles)
        .into_iter()
        .filter(|&low| low < below_price)
        .fold(None, |best: Option<f64>, low| match best {
            Some(b) if b >= low => Some(b),
            _ => Some(low),
        })
}

/// Nearest swing-high resistance strictly above `above_price`.
pub fn nearest_resistance(candles: &[Candle], above_price: f64) -> Option<f64> {
    swing_highs(candles)
        .into_iter()
        .filter(|&high| high > above_price)
        .fold(None, |best: Option<f64>, high| match best {
            Some(b) if b <= high => Some(b),
            _ => Some(high),
        })
}

/// Classic retracement levels between a swing `high` and `low`:
/// 23.6%, 38.2%, 50%, 61.8%, 78.6%, measured down from the high.
pub fn fibonacci_levels(high: f64, low: f64) -> [f64; 5] {
    let range = high - low;
    [
        high - range * 0.236,
        high - range * 0.382,
        high - range * 0.5,
        high - range * 0.618,
        high - range * 0.786,
    ]
}

fn swing_lows(candles: &[Candle]) -> Vec<f64> {
    let mut lows = Vec::new();
    if candles.len() < 2 * SWING_WING + 1 {
        return lows;
    }
    for i in SWING_WING..candles.len() - SWING_WING {
        let candidate = candles[i].low;
        let is_swing = (i - SWING_WING..=i + SWING_WING)
            .filter(|&j| j != i)
            .all(|j| candles[j].low >= candidate);
        if is_swing {
            lows.push(candidate);
        }
    }
    lows
}

fn swing_highs(candles: &[Candle]) -> Vec<f64> {
    let mut highs = Vec::new();
    if candles.len() < 2 * SWING_WING + 1 {
        return highs;
    }
    for i in SWING_WING..candles.len() - SWING_WING {
        let candidate = candles[i].high;
        let is_swing = (i - SWING_WING..=i + SWING_WING)
            .filter(|&j| j != i)
            .all(|j| candles[j].high <= candidate);
        if is_swing {
            highs.push(candidate);
        }
    }
    highs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(low: f64, high: f64) -> Candle {
        Candle::new(0, (low + high) / 2.0, high, low, (low + high) / 2.0, 1.0)
    }

    fn valley(levels: &[f64]) -> Vec<Candle> {
        levels.iter().map(|&l| candle(l, l + 10.0)).collect()
    }

    #[test]
    fn finds_the_nearest_support_below() {
        // Two valleys: one at 90, one at 95.
        let candles = valley(&[100.0, 98.0, 90.0, 98.0, 100.0, 99.0, 95.0, 99.0, 100.0]);
        let support = nearest_support(&candles, 97.0).unwrap();
        assert_eq!(support, 95.0);

        // With a lower reference only the deep valley qualifies.
        let support = nearest_support(&candles, 94.0).unwrap();
        assert_eq!(support, 90.0);
    }

    #[test]
    fn finds_the_nearest_resistance_above() {
        let candles = valley(&[100.0, 102.0, 110.0, 102.0, 100.0, 101.0, 105.0, 101.0, 100.0]);
        // Highs are low + 10: peaks at 120 and 115.
        let resistance = nearest_resistance(&candles, 113.0).unwrap();
        assert_eq!(resistance, 115.0);
    }

    #[test]
    fn no_level_when_nothing_qualifies() {
        let candles = valley(&[100.0, 100.0, 100.0, 100.0, 100.0]);
        assert!(nearest_support(&candles, 50.0).is_none());
        assert!(nearest_support(&[], 100.0).is_none());
    }

    #[test]
    fn fibonacci_levels_are_ordered() {
        let levels = fibonacci_levels(200.0, 100.0);
        assert!((levels[0] - 176.4).abs() < 1e-9);
        assert!((levels[2] - 150.0).abs() < 1e-9);
        assert!((levels[4] - 121.4).abs() < 1e-9);
        for pair in levels.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }
}
