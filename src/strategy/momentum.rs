// =============================================================================
// Momentum — ride an established trend
// =============================================================================
//
// Entry: fast EMA above slow EMA, positive MACD histogram, RSI in the
// healthy-trend band (50-72). Bracket −2% / +2% / +4%; positions older than
// four hours are released to the next scan.
// =============================================================================

use crate::indicators::{self, Candle};
use crate::scanner::CoinMetrics;
use crate::strategy::{Signal, SignalType, Strategy, StrategyCore, StrategyStatistics};

const EMA_FAST: usize = 10;
const EMA_SLOW: usize = 30;
const MAX_HOLDING_SECS: i64 = 4 * 3_600;

pub struct MomentumStrategy {
    core: StrategyCore,
}

impl MomentumStrategy {
    pub fn new() -> Self {
        Self {
            core: StrategyCore::new("Momentum"),
        }
    }
}

impl Default for MomentumStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for MomentumStrategy {
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
        if current_price <= 0.0 || candles.len() < EMA_SLOW + 10 {
            return signal;
        }

        let closes = indicators::closes(candles);
        let (Some(fast), Some(slow)) = (
            indicators::ema(&closes, EMA_FAST),
            indicators::ema(&closes, EMA_SLOW),
        ) else {
            return signal;
        };
        let Some(rsi) = indicators::rsi(&closes, 14) else {
            return signal;
        };
        let macd = indicators::macd(&closes, 12, 26, 9);

        let trend_up = fast > slow;
        let histogram_positive = macd.map(|m| m.histogram > 0.0).unwrap_or(false);
        let rsi_healthy = (50.0..=72.0).contains(&rsi);

        if !(trend_up && histogram_positive && rsi_healthy) {
            return signal;
        }

        let spread_component = ((fast - slow) / slow * 100.0).clamp(0.0, 1.0);
        let rsi_component = ((rsi - 50.0) / 22.0).clamp(0.0, 1.0);
        let surge_component = ((metrics.volume_surge_ratio - 1.0) / 2.0).clamp(0.0, 1.0);
        let strength =
            (0.50 + 0.20 * spread_component + 0.20 * rsi_component + 0.10 * surge_component)
                .clamp(0.0, 1.0);

        signal.signal_type = if strength >= 0.8 {
            SignalType::StrongBuy
        } else {
            SignalType::Buy
        };
        signal.strength = strength;
        signal.entry_price = current_price;
        signal.stop_loss = current_price * 0.98;
        signal.take_profit_1 = current_price * 1.02;
        signal.take_profit_2 = current_price * 1.04;
        signal.position_size = 0.05;
        signal.reason = format!(
            "trend continuation: ema{EMA_FAST}>{EMA_SLOW}, rsi={rsi:.1}, hist>0"
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

#[cfg(test)]
mod tests {
    use super::*;

    fn trending_candles() -> Vec<Candle> {
        // An accelerating uptrend with real pullbacks: fast EMA pulls ahead,
        // the histogram turns positive, and RSI stays inside the healthy
        // band instead of pinning.
        let mut candles = Vec::new();
        let mut price = 1_000.0;
        for i in 0..80 {
            let step = if i % 3 == 2 {
                -(2.0 + i as f64 * 0.05)
            } else {
                1.5 + i as f64 * 0.05
            };
            price += step;
            candles.push(Candle::new(i * 60_000, price - 1.0, price + 2.0, price - 2.0, price, 10.0));
        }
        candles
    }

    #[test]
    fn emits_buy_in_a_clean_uptrend() {
        let strategy = MomentumStrategy::new();
        let candles = trending_candles();
        let price = candles.last().unwrap().close;
        let metrics = CoinMetrics {
            volume_surge_ratio: 1.5,
            ..Default::default()
        };

        let signal = strategy.generate_signal("KRW-ETH", &metrics, &candles, price, 1e6);
        assert!(signal.signal_type.is_buy(), "reason: {}", signal.reason);
        assert!(signal.strength >= 0.5);
        assert!(signal.reward_risk_ratio().unwrap() >= 1.9);
    }

    #[test]
    fn silent_in_a_downtrend() {
        let strategy = MomentumStrategy::new();
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let close = 2_000.0 - 5.0 * i as f64;
                Candle::new(i * 60_000, close + 2.0, close + 5.0, close - 5.0, close, 10.0)
            })
            .collect();
        let price = candles.last().unwrap().close;

        let signal =
            strategy.generate_signal("KRW-ETH", &CoinMetrics::default(), &candles, price, 1e6);
        assert_eq!(signal.signal_type, SignalType::None);
    }

    #[test]
    fn exits_only_on_age() {
        let strategy = MomentumStrategy::new();
        assert!(!strategy.should_exit("KRW-ETH", 100.0, 110.0, 3_600));
        assert!(strategy.should_exit("KRW-ETH", 100.0, 110.0, 5 * 3_600));
    }
}
