// =============================================================================
// Average Directional Index — trend strength
// =============================================================================
//
// +DM / -DM from consecutive highs/lows, Wilder-smoothed against the true
// range into +DI / -DI, then DX = 100·|+DI − −DI| / (+DI + −DI) smoothed into
// ADX. Readings above ~25 indicate a trending market.
// =============================================================================

use super::Candle;

/// Most recent ADX value.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let mut trs = Vec::with_capacity(candles.len() - 1);
    let mut plus_dms = Vec::with_capacity(candles.len() - 1);
    let mut minus_dms = Vec::with_capacity(candles.len() - 1);

    for w in candles.windows(2) {
        let prev = &w[0];
        let cur = &w[1];

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;
        plus_dms.push(if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 });
        minus_dms.push(if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 });

        trs.push(
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs()),
        );
    }

    let period_f = period as f64;
    let mut tr_smooth: f64 = trs[..period].iter().sum();
    let mut plus_smooth: f64 = plus_dms[..period].iter().sum();
    let mut minus_smooth: f64 = minus_dms[..period].iter().sum();

    let mut dxs = Vec::new();
    dxs.push(dx_value(plus_smooth, minus_smooth, tr_smooth));

    for i in period..trs.len() {
        tr_smooth = tr_smooth - tr_smooth / period_f + trs[i];
        plus_smooth = plus_smooth - plus_smooth / period_f + plus_dms[i];
        minus_smooth = minus_smooth - minus_smooth / period_f + minus_dms[i];
        dxs.push(dx_value(plus_smooth, minus_smooth, tr_smooth));
    }

    if dxs.len() < period {
        return None;
    }

    // ADX: Wilder-smooth the DX series.
    let mut adx_value = dxs[..period].iter().sum::<f64>() / period_f;
    for &dx in &dxs[period..] {
        adx_value = (adx_value * (period_f - 1.0) + dx) / period_f;
    }
    Some(adx_value)
}

fn dx_value(plus_smooth: f64, minus_smooth: f64, tr_smooth: f64) -> f64 {
    if tr_smooth <= 0.0 {
        return 0.0;
    }
    let plus_di = 100.0 * plus_smooth / tr_smooth;
    let minus_di = 100.0 * minus_smooth / tr_smooth;
    let sum = plus_di + minus_di;
    if sum <= 0.0 {
        return 0.0;
    }
    100.0 * (plus_di - minus_di).abs() / sum
}

#[cfg(test)]
mod tests {
    use super::super::{flat_candles, ramp_candles};
    use super::*;

    #[test]
    fn strong_trend_scores_high() {
        let candles = ramp_candles(60, 100.0, 1.0);
        let value = adx(&candles, 14).unwrap();
        assert!(value > 25.0, "trending market should score above 25, got {value}");
    }

    #[test]
    fn flat_market_scores_zero() {
        let candles = flat_candles(60, 100.0);
        let value = adx(&candles, 14).unwrap();
        assert!(value < 1e-9);
    }

    #[test]
    fn requires_two_periods_of_history() {
        let candles = ramp_candles(20, 100.0, 1.0);
        assert!(adx(&candles, 14).is_none());
    }
}
