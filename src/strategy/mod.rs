// =============================================================================
// Strategy plane — Signal model, Strategy capability, StrategyManager
// =============================================================================
//
// Strategies are collaborators behind a trait object: the core only sees the
// operations declared here. The manager collects one signal per registered
// strategy, filters by strength, and selects the best by a composite score;
// the synthesis variant (majority vote + medians) exists for the backtester.
// =============================================================================

pub mod breakout;
pub mod grid;
pub mod mean_reversion;
pub mod momentum;
pub mod scalping;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::indicators::Candle;
use crate::scanner::CoinMetrics;

/// Strength threshold below which signals are discarded.
pub const MIN_SIGNAL_STRENGTH: f64 = 0.6;

// ---------------------------------------------------------------------------
// Signal model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    None,
    Buy,
    StrongBuy,
    Sell,
    StrongSell,
    Hold,
}

impl SignalType {
    pub fn is_buy(&self) -> bool {
        matches!(self, Self::Buy | Self::StrongBuy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Self::Sell | Self::StrongSell)
    }
}

/// How an accepted signal's orders should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderExecution {
    /// Resting limit with chase and market fallback.
    LimitWithFallback,
    /// Plain resting limit.
    Limit,
    /// Immediate market order.
    Market,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    /// Confidence in [0, 1].
    pub strength: f64,
    pub market: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    /// Fraction of capital to allocate, in [0, 1].
    pub position_size: f64,
    pub strategy_name: String,
    pub buy_order_type: OrderExecution,
    pub sell_order_type: OrderExecution,
    pub max_retries: u32,
    pub retry_wait_ms: u64,
    pub reason: String,
}

impl Signal {
    /// A no-signal placeholder.
    pub fn none(market: &str, strategy_name: &str) -> Self {
        Self {
            signal_type: SignalType::None,
            strength: 0.0,
            market: market.to_string(),
            entry_price: 0.0,
            stop_loss: 0.0,
            take_profit_1: 0.0,
            take_profit_2: 0.0,
            position_size: 0.0,
            strategy_name: strategy_name.to_string(),
            buy_order_type: OrderExecution::LimitWithFallback,
            sell_order_type: OrderExecution::Market,
            max_retries: 5,
            retry_wait_ms: 5_000,
            reason: String::new(),
        }
    }

    /// Take-profit used for reward/risk scoring: TP2 when present, else TP1.
    pub fn scoring_take_profit(&self) -> f64 {
        if self.take_profit_2 > 0.0 {
            self.take_profit_2
        } else {
            self.take_profit_1
        }
    }

    /// Reward/risk of the bracket, if computable.
    pub fn reward_risk_ratio(&self) -> Option<f64> {
        let tp = self.scoring_take_profit();
        if self.entry_price <= 0.0 || self.stop_loss <= 0.0 || tp <= 0.0 {
            return None;
        }
        let risk = (self.entry_price - self.stop_loss).abs();
        if risk <= 0.0 {
            return None;
        }
        Some((tp - self.entry_price).abs() / risk)
    }
}

// ---------------------------------------------------------------------------
// Strategy capability
// ---------------------------------------------------------------------------

/// Per-strategy performance counters, fed back by the engine after each exit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StrategyStatistics {
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_pnl: f64,
}

impl StrategyStatistics {
    pub fn win_rate(&self) -> f64 {
        let total = self.winning_trades + self.losing_trades;
        if total == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / total as f64
    }
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate one market and emit a signal (possibly `SignalType::None`).
    fn generate_signal(
        &self,
        market: &str,
        metrics: &CoinMetrics,
        candles: &[Candle],
        current_price: f64,
        available_capital: f64,
    ) -> Signal;

    /// Strategy-specific exit beyond the risk manager's SL/TP checks.
    fn should_exit(
        &self,
        market: &str,
        entry_price: f64,
        current_price: f64,
        holding_seconds: i64,
    ) -> bool;

    /// Per-tick state refresh (price memory, grids, trailing anchors).
    fn update_state(&self, market: &str, price: f64);

    /// Feedback after a closed trade.
    fn update_statistics(&self, market: &str, is_win: bool, pnl: f64);

    /// Last veto before capital is committed. Returning `false` drops the
    /// signal after all engine checks passed.
    fn on_signal_accepted(&self, signal: &Signal, allocated_capital: f64) -> bool;

    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn statistics(&self) -> StrategyStatistics;
}

/// Shared plumbing embedded by every concrete strategy: name, enabled flag,
/// and statistics counters.
pub struct StrategyCore {
    name: &'static str,
    enabled: AtomicBool,
    stats: Mutex<StrategyStatistics>,
}

impl StrategyCore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(true),
            stats: Mutex::new(StrategyStatistics::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record_trade(&self, is_win: bool, pnl: f64) {
        let mut stats = self.stats.lock();
        if is_win {
            stats.winning_trades += 1;
        } else {
            stats.losing_trades += 1;
        }
        stats.total_pnl += pnl;
    }

    pub fn statistics(&self) -> StrategyStatistics {
        *self.stats.lock()
    }
}

// ---------------------------------------------------------------------------
// StrategyManager
// ---------------------------------------------------------------------------

pub struct StrategyManager {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl StrategyManager {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build a manager with the default strategy set, keeping only the
    /// enabled names.
    pub fn with_enabled(enabled_names: &[String]) -> Self {
        let mut manager = Self::new();
        let all: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(scalping::ScalpingStrategy::new()),
            Arc::new(momentum::MomentumStrategy::new()),
            Arc::new(breakout::BreakoutStrategy::new()),
            Arc::new(mean_reversion::MeanReversionStrategy::new()),
            Arc::new(grid::GridTradingStrategy::new()),
        ];
        for strategy in all {
            if enabled_names.is_empty()
                || enabled_names.iter().any(|n| n == strategy.name())
            {
                manager.register(strategy);
            }
        }
        manager
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        info!(strategy = strategy.name(), "strategy registered");
        self.strategies.push(strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies.iter().find(|s| s.name() == name).cloned()
    }

    pub fn active_strategies(&self) -> Vec<String> {
        self.strategies
            .iter()
            .filter(|s| s.is_enabled())
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn enable_strategy(&self, name: &str, enabled: bool) {
        if let Some(strategy) = self.get(name) {
            strategy.set_enabled(enabled);
            info!(strategy = name, enabled, "strategy toggled");
        }
    }

    /// One signal per enabled strategy; `None`-type signals are dropped.
    pub fn collect_signals(
        &self,
        market: &str,
        metrics: &CoinMetrics,
        candles: &[Candle],
        current_price: f64,
        available_capital: f64,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();

        for strategy in &self.strategies {
            if !strategy.is_enabled() {
                continue;
            }
            let signal =
                strategy.generate_signal(market, metrics, candles, current_price, available_capital);
            if signal.signal_type != SignalType::None {
                debug!(
                    market,
                    strategy = strategy.name(),
                    strength = signal.strength,
                    "signal collected"
                );
                signals.push(signal);
            }
        }

        signals
    }

    /// Keep only signals at or above `min_strength`.
    pub fn filter_signals(&self, signals: Vec<Signal>, min_strength: f64) -> Vec<Signal> {
        signals
            .into_iter()
            .filter(|s| s.strength >= min_strength)
            .collect()
    }

    /// Composite score: raw strength × type weight × bounded reward/risk
    /// bonus.
    pub fn signal_score(&self, signal: &Signal) -> f64 {
        let mut score = signal.strength;

        score *= match signal.signal_type {
            SignalType::StrongBuy | SignalType::StrongSell => 1.5,
            SignalType::Buy | SignalType::Sell => 1.0,
            _ => 0.5,
        };

        if let Some(rr) = signal.reward_risk_ratio() {
            score *= f64::min(2.0, rr / 2.0);
        }

        score
    }

    /// Highest-scoring signal, if any.
    pub fn select_best(&self, signals: &[Signal]) -> Option<Signal> {
        signals
            .iter()
            .max_by(|a, b| {
                self.signal_score(a)
                    .partial_cmp(&self.signal_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Majority-vote synthesis with median entry/stop/TP levels. Used only
    /// by the backtester.
    pub fn synthesize(&self, signals: &[Signal]) -> Signal {
        if signals.is_empty() {
            return Signal::none("", "Synthesized");
        }

        let mut buy_count = 0usize;
        let mut sell_count = 0usize;
        let mut total_strength = 0.0;
        for signal in signals {
            if signal.signal_type.is_buy() {
                buy_count += 1;
            } else if signal.signal_type.is_sell() {
                sell_count += 1;
            }
            total_strength += signal.strength;
        }

        let mut synthesized = Signal::none(&signals[0].market, "Synthesized");
        synthesized.signal_type = if buy_count > sell_count {
            if buy_count > sell_count * 2 {
                SignalType::StrongBuy
            } else {
                SignalType::Buy
            }
        } else if sell_count > buy_count {
            if sell_count > buy_count * 2 {
                SignalType::StrongSell
            } else {
                SignalType::Sell
            }
        } else {
            SignalType::Hold
        };
        synthesized.strength = total_strength / signals.len() as f64;

        synthesized.entry_price = median_of(signals.iter().map(|s| s.entry_price));
        synthesized.stop_loss = median_of(signals.iter().map(|s| s.stop_loss));
        synthesized.take_profit_1 = median_of(signals.iter().map(|s| s.take_profit_1));
        synthesized.take_profit_2 = median_of(signals.iter().map(|s| s.take_profit_2));
        synthesized.position_size = 0.05;
        synthesized.reason = format!("Synthesized from {} strategies", signals.len());

        synthesized
    }

    pub fn all_statistics(&self) -> Vec<(String, StrategyStatistics)> {
        self.strategies
            .iter()
            .map(|s| (s.name().to_string(), s.statistics()))
            .collect()
    }

    /// Realized win rate pooled across every strategy; feeds the dynamic
    /// filter.
    pub fn overall_win_rate(&self) -> f64 {
        let mut wins = 0u32;
        let mut total = 0u32;
        for strategy in &self.strategies {
            let stats = strategy.statistics();
            wins += stats.winning_trades;
            total += stats.winning_trades + stats.losing_trades;
        }
        if total == 0 {
            return 0.0;
        }
        wins as f64 / total as f64
    }

    /// Route a closed trade's outcome back to its owning strategy.
    pub fn record_trade_result(&self, strategy_name: &str, market: &str, pnl: f64) {
        match self.get(strategy_name) {
            Some(strategy) => strategy.update_statistics(market, pnl >= 0.0, pnl),
            None => warn!(strategy = strategy_name, "trade result for unknown strategy"),
        }
    }
}

impl Default for StrategyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Median of the positive values in the iterator (zeroes are treated as
/// "level not provided").
fn median_of(values: impl Iterator<Item = f64>) -> f64 {
    let mut collected: Vec<f64> = values.filter(|v| *v > 0.0).collect();
    if collected.is_empty() {
        return 0.0;
    }
    collected.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    collected[collected.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy_signal(strategy: &str, strength: f64, entry: f64, sl: f64, tp2: f64) -> Signal {
        let mut signal = Signal::none("KRW-BTC", strategy);
        signal.signal_type = SignalType::Buy;
        signal.strength = strength;
        signal.entry_price = entry;
        signal.stop_loss = sl;
        signal.take_profit_2 = tp2;
        signal
    }

    #[test]
    fn filter_drops_weak_signals() {
        let manager = StrategyManager::new();
        let signals = vec![
            buy_signal("A", 0.65, 100.0, 97.0, 106.0),
            buy_signal("B", 0.55, 100.0, 97.0, 106.0),
            buy_signal("C", 0.60, 100.0, 97.0, 106.0),
        ];
        let kept = manager.filter_signals(signals, MIN_SIGNAL_STRENGTH);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|s| s.strength >= 0.6));
    }

    #[test]
    fn strong_signals_outscore_normal_at_equal_strength() {
        let manager = StrategyManager::new();
        let normal = buy_signal("A", 0.8, 100.0, 97.0, 106.0);
        let mut strong = normal.clone();
        strong.signal_type = SignalType::StrongBuy;
        assert!(manager.signal_score(&strong) > manager.signal_score(&normal));
    }

    #[test]
    fn reward_risk_bonus_is_bounded_at_2x() {
        let manager = StrategyManager::new();
        // risk 1, reward 40 -> rr = 40, factor capped at 2.0
        let extreme = buy_signal("A", 0.8, 100.0, 99.0, 140.0);
        assert!((manager.signal_score(&extreme) - 0.8 * 2.0).abs() < 1e-9);
    }

    #[test]
    fn signal_without_bracket_skips_rr_factor() {
        let manager = StrategyManager::new();
        let mut bare = buy_signal("A", 0.8, 100.0, 0.0, 0.0);
        bare.take_profit_1 = 0.0;
        assert!((manager.signal_score(&bare) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn select_best_prefers_higher_score() {
        let manager = StrategyManager::new();
        let weak = buy_signal("A", 0.65, 100.0, 99.0, 101.0); // rr = 1 -> ×0.5
        let strong = buy_signal("B", 0.70, 100.0, 98.0, 106.0); // rr = 3 -> ×1.5
        let best = manager.select_best(&[weak, strong]).unwrap();
        assert_eq!(best.strategy_name, "B");
    }

    #[test]
    fn synthesize_majority_buy_with_median_levels() {
        let manager = StrategyManager::new();
        let signals = vec![
            buy_signal("A", 0.7, 100.0, 95.0, 110.0),
            buy_signal("B", 0.8, 101.0, 96.0, 112.0),
            buy_signal("C", 0.9, 102.0, 97.0, 114.0),
        ];
        let merged = manager.synthesize(&signals);
        // 3 buys vs 0 sells: 3 > 0 × 2 -> strong buy.
        assert_eq!(merged.signal_type, SignalType::StrongBuy);
        assert!((merged.strength - 0.8).abs() < 1e-9);
        assert_eq!(merged.entry_price, 101.0);
        assert_eq!(merged.stop_loss, 96.0);
        assert_eq!(merged.take_profit_2, 112.0);
    }

    #[test]
    fn synthesize_tie_is_hold() {
        let manager = StrategyManager::new();
        let mut sell = buy_signal("A", 0.7, 100.0, 105.0, 90.0);
        sell.signal_type = SignalType::Sell;
        let merged = manager.synthesize(&[buy_signal("B", 0.7, 100.0, 95.0, 110.0), sell]);
        assert_eq!(merged.signal_type, SignalType::Hold);
    }

    #[test]
    fn synthesize_empty_is_none() {
        let manager = StrategyManager::new();
        assert_eq!(manager.synthesize(&[]).signal_type, SignalType::None);
    }

    #[test]
    fn with_enabled_respects_the_allowlist() {
        let manager = StrategyManager::with_enabled(&["Scalping".to_string()]);
        assert_eq!(manager.active_strategies(), vec!["Scalping".to_string()]);

        let manager = StrategyManager::with_enabled(&[]);
        assert_eq!(manager.active_strategies().len(), 5);
    }

    #[test]
    fn overall_win_rate_pools_strategies() {
        let manager = StrategyManager::with_enabled(&[]);
        manager.record_trade_result("Scalping", "KRW-BTC", 100.0);
        manager.record_trade_result("Momentum", "KRW-ETH", -50.0);
        assert!((manager.overall_win_rate() - 0.5).abs() < 1e-9);
    }
}
