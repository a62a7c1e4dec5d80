// =============================================================================
// Mean reversion — fade a stretch below the lower Bollinger band
// =============================================================================
//
// Entry: close under the lower band with RSI oversold, in a market that is
// not in free fall (shallow 24h change). Target is the band midline; the
// stop sits 2.5% below entry.
// =============================================================================

use crate::indicators::{self, Candle};
use crate::scanner::CoinMetrics;
use crate::strategy::{Signal, SignalType, Strategy, StrategyCore, StrategyStatistics};

const BAND_PERIOD: usize = 20;
const BAND_K: f64 = 2.0;
const RSI_OVERSOLD: f64 = 30.0;
/// A 24h drop beyond this is treated as a falling knife, not a stretch.
const MAX_DAILY_DROP_PCT: f64 = -8.0;
const MAX_HOLDING_SECS: i64 = 6 * 3_600;

pub struct MeanReversionStrategy {
    core: StrategyCore,
}

impl MeanReversionStrategy {
    pub fn new() -> Self {
        Self {
            core: StrategyCore::new("MeanReversion"),
        }
    }
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn generate_signal(
        &self,
        market: &str,
        metrics: &CoinMetrics,
        candles: &[Candle],
        current_price: f64,
        _available_capital: f64,
    ) -> Signal {
        let mut signal = Signal::none(market, self.core.name());
        if current_price <= 0.0 || candles.len() < BAND_PERIOD + 5 {
            return signal;
        }

        let closes = indicators::closes(candles);
        let Some(bands) = indicators::bollinger(&closes, BAND_PERIOD, BAND_K) else {
            return signal;
        };
        let Some(rsi) = indicators::rsi(&closes, 14) else {
            return signal;
        };

        let stretched = current_price < bands.lower && rsi <= RSI_OVERSOLD;
        let not_a_knife = metrics.price_change_rate > MAX_DAILY_DROP_PCT;
        if !(stretched && not_a_knife) {
            return signal;
        }
        if bands.middle <= current_price {
            return signal;
        }

        let band_stretch = ((bands.lower - current_price) / bands.lower * 100.0).clamp(0.0, 1.0);
        let rsi_component = ((RSI_OVERSOLD - rsi) / RSI_OVERSOLD).clamp(0.0, 1.0);
        let strength = (0.55 + 0.25 * band_stretch + 0.20 * rsi_component).clamp(0.0, 1.0);

        let midline = bands.middle;
        signal.signal_type = SignalType::Buy;
        signal.strength = strength;
        signal.entry_price = current_price;
        signal.stop_loss = current_price * 0.975;
        signal.take_profit_1 = current_price + (midline - current_price) * 0.5;
        signal.take_profit_2 = midline;
        signal.position_size = 0.03;
        signal.reason = format!(
            "band stretch: price={current_price:.0} < lower={:.0}, rsi={rsi:.1}",
            bands.lower
        );
        signal
    }

    fn should_exit(
        &self,
        _market: &str,
        _entry_price: f64,
        _current_price: f64,
        holding_seconds: i64,
    ) -> bool {
        // Reversion either happens quickly or it was the wrong read.
        holding_seconds >= MAX_HOLDING_SECS
    }

    fn update_state(&self, _market: &str, _price: f64) {}

    fn update_statistics(&self, _market: &str, is_win: bool, pnl: f64) {
        self.core.record_trade(is_win, pnl);
    }

    fn on_signal_accepted(&self, _signal: &Signal, allocated_capital: f64) -> bool {
        allocated_capital > 0.0
    }

    fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.core.set_enabled(enabled)
    }

    fn statistics(&self) -> StrategyStatistics {
        self.core.statistics()
    }
}
