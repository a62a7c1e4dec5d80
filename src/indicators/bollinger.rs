// =============================================================================
// Bollinger bands — SMA ± k standard deviations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Bands over the last `period` closes with multiplier `k` (conventionally
/// 20 and 2.0). Population standard deviation.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bollinger> {
    if period < 2 || closes.len() < period {
        return None;
    }

    let tail = &closes[closes.len() - period..];
    let middle = tail.iter().sum::<f64>() / period as f64;
    let variance = tail
        .iter()
        .map(|c| (c - middle) * (c - middle))
        .sum::<f64>()
        / period as f64;
    let std = variance.sqrt();

    Some(Bollinger {
        upper: middle + k * std,
        middle,
        lower: middle - k * std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_series_collapses_bands() {
        let b = bollinger(&[100.0; 30], 20, 2.0).unwrap();
        assert_eq!(b.upper, 100.0);
        assert_eq!(b.middle, 100.0);
        assert_eq!(b.lower, 100.0);
    }

    #[test]
    fn bands_are_symmetric_around_the_mean() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i % 5) as f64).collect();
        let b = bollinger(&closes, 20, 2.0).unwrap();
        assert!(((b.upper - b.middle) - (b.middle - b.lower)).abs() < 1e-9);
        assert!(b.upper > b.middle && b.middle > b.lower);
    }

    #[test]
    fn requires_enough_history() {
        assert!(bollinger(&[1.0; 10], 20, 2.0).is_none());
        assert!(bollinger(&[1.0; 30], 1, 2.0).is_none());
    }
}
