// =============================================================================
// Backtest harness — candle replay through synthesis and the risk manager
// =============================================================================
//
// Replays per-market candle history bar by bar. Each bar: mark open
// positions, run the exit rules, then feed the strategy pool and act on the
// synthesized (majority-vote) signal. Fills are simulated at the bar close
// with the same fee model as live trading; the reentry cooldown is disabled.
//
// The harness consumes already-fetched candles; historical-data ingestion is
// out of scope.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use tracing::info;

use crate::engine_config::EngineConfig;
use crate::indicators::{self, Candle};
use crate::risk::{RiskManager, RiskMetrics, SignalMetadata, TradeHistory};
use crate::scanner::{self, CoinMetrics};
use crate::strategy::{StrategyManager, MIN_SIGNAL_STRENGTH};
use crate::types::TradingMode;

/// Bars consumed before the first trading decision.
const WARMUP_BARS: usize = 40;

#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub metrics: RiskMetrics,
    pub trades: Vec<TradeHistory>,
}

pub struct BacktestEngine {
    config: EngineConfig,
    risk: RiskManager,
    strategies: StrategyManager,
}

impl BacktestEngine {
    pub fn new(mut config: EngineConfig) -> Self {
        config.mode = TradingMode::Backtest;
        config.reentry_cooldown_seconds = 0;

        let risk = RiskManager::new(&config);
        let strategies = StrategyManager::with_enabled(&config.enabled_strategies);

        Self {
            config,
            risk,
            strategies,
        }
    }

    /// Replay `candles_by_market` (each series time-ascending) and report.
    pub fn run(&self, candles_by_market: &HashMap<String, Vec<Candle>>) -> Result<BacktestReport> {
        let bar_count = candles_by_market
            .values()
            .map(|c| c.len())
            .min()
            .unwrap_or(0);

        if bar_count <= WARMUP_BARS {
            info!(bar_count, "not enough history to backtest");
            return Ok(BacktestReport {
                metrics: self.risk.metrics(),
                trades: Vec::new(),
            });
        }

        info!(
            markets = candles_by_market.len(),
            bars = bar_count,
            "backtest starting"
        );

        for bar in WARMUP_BARS..bar_count {
            for (market, candles) in candles_by_market {
                let window = &candles[..=bar];
                let price = window[window.len() - 1].close;
                if price <= 0.0 {
                    continue;
                }

                self.step_market(market, window, price);
            }
        }

        // Liquidate whatever is still open at the final bar.
        for position in self.risk.all_positions() {
            if let Some(candles) = candles_by_market.get(&position.market) {
                let last_close = candles[bar_count - 1].close;
                if let Some(record) = self.risk.exit_position(&position.market, last_close, "end_of_data") {
                    self.strategies.record_trade_result(
                        &record.strategy_name,
                        &position.market,
                        record.profit_loss,
                    );
                }
            }
        }

        let metrics = self.risk.metrics();
        info!(
            trades = metrics.total_trades,
            win_rate = metrics.win_rate * 100.0,
            profit_factor = metrics.profit_factor,
            max_drawdown = metrics.max_drawdown * 100.0,
            total_pnl = metrics.total_pnl,
            "backtest complete"
        );

        Ok(BacktestReport {
            metrics,
            trades: self.risk.trade_history(),
        })
    }

    fn step_market(&self, market: &str, window: &[Candle], price: f64) {
        // 1. Mark and check exits.
        if self.risk.has_position(market) {
            self.risk.update_position(market, price);

            if self.risk.should_partial_exit(market) {
                self.risk.partial_exit(market, price);
            } else if let Some(reason) = self.risk.should_exit(market) {
                if let Some(record) = self.risk.exit_position(market, price, reason) {
                    self.strategies.record_trade_result(
                        &record.strategy_name,
                        market,
                        record.profit_loss,
                    );
                }
            }
            return;
        }

        // 2. Entries via the synthesized signal.
        let metrics = bar_metrics(market, window, price);
        let available = self.risk.metrics().available_capital;
        let collected =
            self.strategies
                .collect_signals(market, &metrics, window, price, available);
        let filtered = self.strategies.filter_signals(collected, MIN_SIGNAL_STRENGTH);
        if filtered.is_empty() {
            return;
        }

        let merged = self.strategies.synthesize(&filtered);
        if !merged.signal_type.is_buy() || merged.strength < MIN_SIGNAL_STRENGTH {
            return;
        }
        if merged.entry_price <= 0.0 || merged.stop_loss <= 0.0 || merged.take_profit_2 <= 0.0 {
            return;
        }

        let size = merged.position_size.max(0.01);
        if !self
            .risk
            .can_enter_position(market, price, size, &merged.strategy_name)
        {
            return;
        }

        let invest = available * size;
        if invest < self.config.min_order_krw {
            return;
        }
        let quantity = invest / price;

        self.risk.enter_position(
            market,
            price,
            quantity,
            merged.stop_loss,
            merged.take_profit_1,
            merged.take_profit_2,
            &merged.strategy_name,
            0.0,
            merged.take_profit_1,
            SignalMetadata {
                strength: merged.strength,
                filter: 0.5,
                ..Default::default()
            },
        );
    }
}

/// Metrics reconstructed from candles alone; book-dependent fields use
/// neutral defaults.
fn bar_metrics(market: &str, window: &[Candle], price: f64) -> CoinMetrics {
    let closes = indicators::closes(window);
    CoinMetrics {
        market: market.to_string(),
        current_price: price,
        volume_24h: f64::MAX, // the volume filter already ran upstream
        volume_surge_ratio: scanner::volume_surge(window),
        price_change_rate: if closes.len() >= 2 {
            (price / closes[0] - 1.0) * 100.0
        } else {
            0.0
        },
        price_momentum: indicators::rsi(&closes, 14).unwrap_or(50.0),
        order_book_imbalance: 0.1,
        volatility: indicators::atr(window, 14)
            .map(|a| a / price.max(1e-9))
            .unwrap_or(0.0),
        liquidity_score: 50.0,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sell_off_then_recovery(len: usize) -> Vec<Candle> {
        // A grind down into a V-shaped recovery: gives the dip buyers an
        // entry and a profitable path out.
        let mut candles = Vec::with_capacity(len);
        let mut price: f64 = 10_000.0;
        for i in 0..len {
            let drift = if i < len / 2 { -40.0 } else { 55.0 };
            price = (price + drift).max(1_000.0);
            candles.push(Candle::new(
                i as i64 * 300_000,
                price - 10.0,
                price + 30.0,
                price - 30.0,
                price,
                10.0 + (i % 7) as f64 * 5.0,
            ));
        }
        candles
    }

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.initial_capital = 1_000_000.0;
        cfg
    }

    #[test]
    fn short_history_produces_an_empty_report() {
        let engine = BacktestEngine::new(config());
        let mut data = HashMap::new();
        data.insert("KRW-BTC".to_string(), sell_off_then_recovery(10));
        let report = engine.run(&data).unwrap();
        assert_eq!(report.metrics.total_trades, 0);
        assert!(report.trades.is_empty());
    }

    #[test]
    fn replay_keeps_the_ledger_consistent() {
        let engine = BacktestEngine::new(config());
        let mut data = HashMap::new();
        data.insert("KRW-BTC".to_string(), sell_off_then_recovery(200));
        data.insert("KRW-ETH".to_string(), sell_off_then_recovery(200));

        let report = engine.run(&data).unwrap();

        // No open positions survive the replay.
        assert_eq!(report.metrics.active_positions, 0);
        // Ledger stays finite and accounting holds together.
        assert!(report.metrics.total_capital.is_finite());
        assert!(report.metrics.available_capital <= report.metrics.total_capital + 1e-6);
        assert_eq!(
            report.metrics.total_trades as usize,
            report.trades.len()
        );
        // Every recorded trade carries a strategy and a reason.
        for trade in &report.trades {
            assert!(!trade.strategy_name.is_empty());
            assert!(!trade.exit_reason.is_empty());
        }
    }
}
