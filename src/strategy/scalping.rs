// =============================================================================
// Scalping — oversold bounce on surging volume
// =============================================================================
//
// Entry: RSI oversold, last-candle volume surging, and bid-side depth
// dominance. Tight bracket (−1.0% / +0.8% / +1.5%), early breakeven trigger.
// Time stop: a position that sits near flat for 30 minutes is released.
// =============================================================================

use crate::indicators::{self, Candle};
use crate::scanner::CoinMetrics;
use crate::strategy::{OrderExecution, Signal, SignalType, Strategy, StrategyCore, StrategyStatistics};

const RSI_OVERSOLD: f64 = 34.0;
const MIN_SURGE: f64 = 1.5;
/// Seconds before a near-flat position is abandoned.
const TIME_STOP_SECS: i64 = 1_800;

pub struct ScalpingStrategy {
    core: StrategyCore,
}

impl ScalpingStrategy {
    pub fn new() -> Self {
        Self {
            core: StrategyCore::new("Scalping"),
        }
    }
}

impl Default for ScalpingStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for ScalpingStrategy {
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
        if current_price <= 0.0 || candles.len() < 20 {
            return signal;
        }

        let closes = indicators::closes(candles);
        let Some(rsi) = indicators::rsi(&closes, 14) else {
            return signal;
        };

        if rsi > RSI_OVERSOLD
            || metrics.volume_surge_ratio < MIN_SURGE
            || metrics.order_book_imbalance <= 0.0
        {
            return signal;
        }

        // Deeper oversold, stronger surge, heavier bid wall -> stronger signal.
        let rsi_component = ((RSI_OVERSOLD - rsi) / RSI_OVERSOLD).clamp(0.0, 1.0);
        let surge_component = ((metrics.volume_surge_ratio - MIN_SURGE) / 3.0).clamp(0.0, 1.0);
        let depth_component = metrics.order_book_imbalance.clamp(0.0, 1.0);
        let strength =
            (0.45 * rsi_component + 0.35 * surge_component + 0.20 * depth_component + 0.45)
                .clamp(0.0, 1.0);

        signal.signal_type = if strength >= 0.85 {
            SignalType::StrongBuy
        } else {
            SignalType::Buy
        };
        signal.strength = strength;
        signal.entry_price = current_price;
        signal.stop_loss = current_price * 0.990;
        signal.take_profit_1 = current_price * 1.008;
        signal.take_profit_2 = current_price * 1.015;
        signal.position_size = 0.05;
        signal.buy_order_type = OrderExecution::LimitWithFallback;
        signal.sell_order_type = OrderExecution::Market;
        signal.reason = format!(
            "oversold bounce: rsi={rsi:.1}, surge={:.2}x, imbalance={:.2}",
            metrics.volume_surge_ratio, metrics.order_book_imbalance
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
        if entry_price <= 0.0 {
            return false;
        }
        let pnl_pct = (current_price - entry_price) / entry_price;
        holding_seconds >= TIME_STOP_SECS && pnl_pct.abs() < 0.002
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

    fn oversold_candles() -> Vec<Candle> {
        // Steady sell-off drives RSI deep below the threshold.
        (0..40)
            .map(|i| {
                let close = 1_000.0 - 8.0 * i as f64;
                Candle::new(i * 60_000, close + 4.0, close + 8.0, close - 2.0, close, 10.0)
            })
            .collect()
    }

    fn surging_metrics() -> CoinMetrics {
        CoinMetrics {
            market: "KRW-BTC".to_string(),
            volume_surge_ratio: 2.5,
            order_book_imbalance: 0.4,
            ..Default::default()
        }
    }

    #[test]
    fn emits_buy_on_oversold_surge() {
        let strategy = ScalpingStrategy::new();
        let candles = oversold_candles();
        let price = candles.last().unwrap().close;

        let signal = strategy.generate_signal("KRW-BTC", &surging_metrics(), &candles, price, 1e6);
        assert!(signal.signal_type.is_buy());
        assert!(signal.strength >= 0.6);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit_1 < signal.take_profit_2);
    }

    #[test]
    fn silent_without_surge_or_bid_depth() {
        let strategy = ScalpingStrategy::new();
        let candles = oversold_candles();
        let price = candles.last().unwrap().close;

        let mut no_surge = surging_metrics();
        no_surge.volume_surge_ratio = 1.0;
        assert_eq!(
            strategy.generate_signal("KRW-BTC", &no_surge, &candles, price, 1e6).signal_type,
            SignalType::None
        );

        let mut ask_heavy = surging_metrics();
        ask_heavy.order_book_imbalance = -0.2;
        assert_eq!(
            strategy.generate_signal("KRW-BTC", &ask_heavy, &candles, price, 1e6).signal_type,
            SignalType::None
        );
    }

    #[test]
    fn time_stop_only_when_flat_and_old() {
        let strategy = ScalpingStrategy::new();
        assert!(strategy.should_exit("KRW-BTC", 100.0, 100.05, 2_000));
        assert!(!strategy.should_exit("KRW-BTC", 100.0, 100.05, 600));
        assert!(!strategy.should_exit("KRW-BTC", 100.0, 101.0, 2_000));
    }
}
