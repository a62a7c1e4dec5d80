// =============================================================================
// Breakout — range break on expanding volume
// =============================================================================
//
// Entry: close pushes above the prior 20-bar high while volume runs at least
// twice its average. Stop sits just under the broken level; targets at +3%
// and +6%.
// =============================================================================

use crate::indicators::Candle;
use crate::scanner::CoinMetrics;
use crate::strategy::{Signal, SignalType, Strategy, StrategyCore, StrategyStatistics};

const RANGE_BARS: usize = 20;
const MIN_SURGE: f64 = 2.0;
const MAX_HOLDING_SECS: i64 = 8 * 3_600;

pub struct BreakoutStrategy {
    core: StrategyCore,
}

impl BreakoutStrategy {
    pub fn new() -> Self {
        Self {
            core: StrategyCore::new("Breakout"),
        }
    }
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for BreakoutStrategy {
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
        if current_price <= 0.0 || candles.len() < RANGE_BARS + 2 {
            return signal;
        }

        // Highest high of the range, excluding the bar that may be breaking it.
        let range = &candles[candles.len() - 1 - RANGE_BARS..candles.len() - 1];
        let range_high = range.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);

        let breaking_out = current_price > range_high;
        let volume_confirms = metrics.volume_surge_ratio >= MIN_SURGE;
        if !(breaking_out && volume_confirms) {
            return signal;
        }

        let extension = ((current_price - range_high) / range_high * 200.0).clamp(0.0, 1.0);
        let surge_component = ((metrics.volume_surge_ratio - MIN_SURGE) / 3.0).clamp(0.0, 1.0);
        let strength = (0.60 + 0.20 * extension + 0.20 * surge_component).clamp(0.0, 1.0);

        signal.signal_type = SignalType::StrongBuy;
        signal.strength = strength;
        signal.entry_price = current_price;
        signal.stop_loss = range_high * 0.99;
        signal.take_profit_1 = current_price * 1.03;
        signal.take_profit_2 = current_price * 1.06;
        signal.position_size = 0.05;
        signal.reason = format!(
            "range break: level={range_high:.0}, surge={:.2}x",
            metrics.volume_surge_ratio
        );
        signal
    }

    fn should_exit(
        &self,
        _market: &str,
        entry_price: f64,
        current_price: f64,
        holding_seconds: i64,
    ) -> bool {
        // A failed breakout that falls back under entry is not worth holding.
        if entry_price > 0.0 && current_price < entry_price * 0.995 && holding_seconds >= 3_600 {
            return true;
        }
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
