// =============================================================================
// Grid trading — buy fixed steps below a rolling anchor
// =============================================================================
//
// Each market keeps an anchor price. A drop of one grid step (2%) below the
// anchor in a liquid, non-trending market triggers a buy with targets one and
// two steps back up. `update_state` ratchets the anchor so the grid follows
// the market instead of chasing a stale level.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::indicators::{self, Candle};
use crate::scanner::CoinMetrics;
use crate::strategy::{Signal, SignalType, Strategy, StrategyCore, StrategyStatistics};

/// Grid step as a fraction of the anchor.
const GRID_STEP: f64 = 0.02;
const MIN_LIQUIDITY: f64 = 40.0;
/// ADX above this means trending; grids want chop.
const MAX_ADX: f64 = 25.0;
const MAX_HOLDING_SECS: i64 = 12 * 3_600;

pub struct GridTradingStrategy {
    core: StrategyCore,
    anchors: Mutex<HashMap<String, f64>>,
}

impl GridTradingStrategy {
    pub fn new() -> Self {
        Self {
            core: StrategyCore::new("GridTrading"),
            anchors: Mutex::new(HashMap::new()),
        }
    }

    fn anchor_for(&self, market: &str, current_price: f64) -> f64 {
        let mut anchors = self.anchors.lock();
        *anchors.entry(market.to_string()).or_insert(current_price)
    }
}

impl Default for GridTradingStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for GridTradingStrategy {
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
        if current_price <= 0.0 || candles.len() < 30 {
            return signal;
        }

        if metrics.liquidity_score < MIN_LIQUIDITY {
            return signal;
        }
        if let Some(adx) = indicators::adx(candles, 14) {
            if adx > MAX_ADX {
                return signal;
            }
        }

        let anchor = self.anchor_for(market, current_price);
        let drop = (anchor - current_price) / anchor;
        if drop < GRID_STEP {
            return signal;
        }

        // Deeper drops inside the grid read as stronger entries, to a point.
        let depth_component = ((drop - GRID_STEP) / GRID_STEP).clamp(0.0, 1.0);
        let strength = (0.60 + 0.25 * depth_component).clamp(0.0, 1.0);

        signal.signal_type = SignalType::Buy;
        signal.strength = strength;
        signal.entry_price = current_price;
        signal.stop_loss = current_price * (1.0 - 2.0 * GRID_STEP);
        signal.take_profit_1 = current_price * (1.0 + GRID_STEP);
        signal.take_profit_2 = current_price * (1.0 + 2.0 * GRID_STEP);
        signal.position_size = 0.03;
        signal.reason = format!("grid step: anchor={anchor:.0}, drop={:.2}%", drop * 100.0);
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

    /// Ratchet the anchor: it follows new highs immediately and decays slowly
    /// toward lower prices so the grid re-arms after a fill.
    fn update_state(&self, market: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        let mut anchors = self.anchors.lock();
        let anchor = anchors.entry(market.to_string()).or_insert(price);
        if price > *anchor {
            *anchor = price;
        } else {
            *anchor = *anchor * 0.999 + price * 0.001;
        }
    }

    fn update_statistics(&self, _market: &str, is_win: bool, pnl: f64) {
        self.core.record_trade(is_win, pnl);
    }

    fn on_signal_accepted(&self, signal: &Signal, allocated_capital: f64) -> bool {
        if allocated_capital <= 0.0 {
            return false;
        }
        // A fill moves the grid down one step so the same level cannot
        // re-trigger immediately.
        self.anchors
            .lock()
            .insert(signal.market.clone(), signal.entry_price);
        true
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
