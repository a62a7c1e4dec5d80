// =============================================================================
// Relative Strength Index — Wilder's smoothing
// =============================================================================
//
// Seed average gain/loss with the SMA of the first `period` deltas, then
// smooth:  avg = (avg * (period - 1) + current) / period.
// RSI = 100 - 100 / (1 + avg_gain / avg_loss); clamped to 100 when there are
// no down moves.
// =============================================================================

/// Full RSI series over `closes`; one value per close from index `period`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

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

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    out.push(rsi_value(avg_gain, avg_loss));

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        out.push(rsi_value(avg_gain, avg_loss));
    }

    out
}

/// Most recent RSI value.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_yields_empty() {
        assert!(rsi_series(&[1.0, 2.0], 14).is_empty());
        assert!(rsi(&[1.0; 10], 14).is_none());
        assert!(rsi_series(&[1.0; 30], 0).is_empty());
    }

    #[test]
    fn all_gains_clamp_to_100() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let value = rsi(&closes, 14).unwrap();
        assert!((value - 100.0).abs() < 1e-9);
    }

    #[test]
    fn all_losses_approach_zero() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let value = rsi(&closes, 14).unwrap();
        assert!(value < 1.0);
    }

    #[test]
    fn alternating_moves_stay_midrange() {
        let closes: Vec<f64> = (0..40)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let value = rsi(&closes, 14).unwrap();
        assert!(value > 30.0 && value < 70.0);
    }
}
