// =============================================================================
// Stochastic oscillator — %K / %D
// =============================================================================
//
// %K = 100 · (close − lowest_low(k_period)) / (highest_high − lowest_low)
// %D = SMA(%K, 3)
// =============================================================================

use super::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// Most recent %K / %D pair.
pub fn stochastic(candles: &[Candle], k_period: usize) -> Option<Stochastic> {
    const D_PERIOD: usize = 3;

    if k_period == 0 || candles.len() < k_period + D_PERIOD - 1 {
        return None;
    }

    let k_at = |end: usize| -> f64 {
        let window = &candles[end + 1 - k_period..=end];
        let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        if high - low <= 0.0 {
            50.0
        } else {
            100.0 * (candles[end].close - low) / (high - low)
        }
    };

    let last = candles.len() - 1;
    let ks: Vec<f64> = (0..D_PERIOD).map(|i| k_at(last - (D_PERIOD - 1 - i))).collect();

    Some(Stochastic {
        k: ks[D_PERIOD - 1],
        d: ks.iter().sum::<f64>() / D_PERIOD as f64,
    })
}
