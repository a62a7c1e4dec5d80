// =============================================================================
// Technical indicators — pure functions over candle history
// =============================================================================
//
// Candles are time-ascending. Every function returns `None` (or an empty
// series) when there is not enough history; callers treat missing data as
// "no signal", never as zero.
// =============================================================================

mod adx;
mod atr;
mod bollinger;
mod ema;
mod levels;
mod macd;
mod rsi;
mod stochastic;
mod vwap;

pub use adx::adx;
pub use atr::atr;
pub use bollinger::{bollinger, Bollinger};
pub use ema::{ema, ema_series, sma};
pub use levels::{fibonacci_levels, nearest_resistance, nearest_support};
pub use macd::{macd, Macd};
pub use rsi::{rsi, rsi_series};
pub use stochastic::{stochastic, Stochastic};
pub use vwap::vwap;

use serde::{Deserialize, Serialize};

/// One OHLCV bar. `timestamp_ms` is the bar's open time, milliseconds since
/// the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp_ms: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp_ms,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Closes extracted from a candle slice, oldest first.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

#[cfg(test)]
pub(crate) fn flat_candles(count: usize, price: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| Candle::new(i as i64 * 60_000, price, price, price, price, 10.0))
        .collect()
}

#[cfg(test)]
pub(crate) fn ramp_candles(count: usize, start: f64, step: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let close = start + step * i as f64;
            Candle::new(
                i as i64 * 60_000,
                close - step,
                close + step.abs(),
                close - step.abs(),
                close,
                10.0 + i as f64,
            )
        })
        .collect()
}
