// =============================================================================
// Risk Manager — capital ledger, position store, admission gates, sizing
// =============================================================================
//
// Ledger model: `current_capital` carries cash plus invested-at-cost; the
// spendable amount at any moment is
//
//     available = current_capital − Σ invested_amount − pending_order_capital
//
// Entries deduct only the entry fee; exits credit the realized net profit.
// `reset_capital` (account sync) is the only path that can move the ledger
// down without a recorded trade.
//
// Admission gates, in order: position uniqueness, max positions, daily trade
// cap (UTC rollover), per-market reentry cooldown, drawdown, available
// capital, daily loss limits.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine_config::EngineConfig;
use crate::indicators;
use crate::types::{now_ms, MarketRegime};

/// Quantity below which a position is considered fully closed.
const QTY_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Signal context captured at entry, preserved through TradeHistory for the
/// learning snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SignalMetadata {
    pub filter: f64,
    pub strength: f64,
    pub regime: MarketRegime,
    pub liquidity_score: f64,
    pub volatility: f64,
    pub expected_value: f64,
    pub reward_risk_ratio: f64,
}

/// Open exposure in one market, owned by one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub market: String,
    /// Volume-weighted entry price (re-weighted after partial exits).
    pub entry_price: f64,
    pub current_price: f64,
    pub quantity: f64,
    pub invested_amount: f64,
    pub entry_time_ms: i64,

    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,

    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub half_closed: bool,

    /// Highest trade price seen since entry; drives trailing logic.
    pub highest_price: f64,
    pub breakeven_trigger: f64,
    pub trailing_start: f64,

    pub strategy_name: String,
    pub signal: SignalMetadata,
}

/// Immutable record of a completed round-trip or partial close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHistory {
    pub market: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub profit_loss: f64,
    pub profit_loss_pct: f64,
    pub fee_paid: f64,
    pub entry_time_ms: i64,
    pub exit_time_ms: i64,
    pub strategy_name: String,
    pub exit_reason: String,
    pub signal: SignalMetadata,
}

/// Aggregate view for logging and the shutdown performance block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub total_capital: f64,
    pub available_capital: f64,
    pub invested_capital: f64,
    pub pending_order_capital: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub sharpe_ratio: f64,
    pub profit_factor: f64,
    pub active_positions: usize,
    pub max_positions: usize,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Inner {
    initial_capital: f64,
    current_capital: f64,
    pending_order_capital: f64,
    max_capital: f64,
    max_drawdown_seen: f64,
    total_fees_paid: f64,

    positions: HashMap<String, Position>,
    trade_history: Vec<TradeHistory>,

    last_trade_time_ms: HashMap<String, i64>,
    daily_trade_count: u32,
    daily_date: String,
    daily_start_capital: f64,
}

pub struct RiskManager {
    inner: Mutex<Inner>,
    max_positions: usize,
    max_daily_trades: u32,
    max_drawdown_pct: f64,
    reentry_cooldown_ms: i64,
    max_daily_loss_krw: f64,
    max_daily_loss_pct: f64,
    fee_rate: f64,
}

impl RiskManager {
    pub fn new(config: &EngineConfig) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            initial_capital = config.initial_capital,
            max_positions = config.max_positions,
            max_daily_trades = config.max_daily_trades,
            max_drawdown = config.max_drawdown,
            "risk manager initialised"
        );

        Self {
            inner: Mutex::new(Inner {
                initial_capital: config.initial_capital,
                current_capital: config.initial_capital,
                pending_order_capital: 0.0,
                max_capital: config.initial_capital,
                max_drawdown_seen: 0.0,
                total_fees_paid: 0.0,
                positions: HashMap::new(),
                trade_history: Vec::new(),
                last_trade_time_ms: HashMap::new(),
                daily_trade_count: 0,
                daily_date: today,
                daily_start_capital: config.initial_capital,
            }),
            max_positions: config.max_positions,
            max_daily_trades: config.max_daily_trades,
            max_drawdown_pct: config.max_drawdown,
            reentry_cooldown_ms: config.reentry_cooldown_seconds * 1000,
            max_daily_loss_krw: config.max_daily_loss_krw,
            max_daily_loss_pct: config.max_daily_loss_pct,
            fee_rate: config.fee_rate,
        }
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// All gates must pass for a new entry in `market` sized at
    /// `size_ratio × current_capital`.
    pub fn can_enter_position(
        &self,
        market: &str,
        _entry_price: f64,
        size_ratio: f64,
        strategy_name: &str,
    ) -> bool {
        let mut inner = self.inner.lock();
        Self::reset_daily_if_needed(&mut inner);

        if inner.positions.contains_key(market) {
            debug!(market, "entry refused: position already open");
            return false;
        }

        if inner.positions.len() >= self.max_positions {
            debug!(market, max = self.max_positions, "entry refused: max positions");
            return false;
        }

        if inner.daily_trade_count >= self.max_daily_trades {
            debug!(market, count = inner.daily_trade_count, "entry refused: daily trade cap");
            return false;
        }

        if self.reentry_cooldown_ms > 0 {
            if let Some(&last) = inner.last_trade_time_ms.get(market) {
                let elapsed = now_ms() - last;
                if elapsed < self.reentry_cooldown_ms {
                    debug!(market, elapsed_ms = elapsed, "entry refused: reentry cooldown");
                    return false;
                }
            }
        }

        let equity = Self::equity(&inner);
        let drawdown = if inner.max_capital > 0.0 {
            (inner.max_capital - equity) / inner.max_capital
        } else {
            0.0
        };
        if drawdown >= self.max_drawdown_pct {
            warn!(
                market,
                drawdown = drawdown * 100.0,
                limit = self.max_drawdown_pct * 100.0,
                "entry refused: drawdown gate"
            );
            return false;
        }

        let invested: f64 = inner.positions.values().map(|p| p.invested_amount).sum();
        let available = inner.current_capital - invested - inner.pending_order_capital;
        let required = inner.current_capital * size_ratio;
        if required > available {
            debug!(
                market,
                required,
                available,
                "entry refused: insufficient available capital"
            );
            return false;
        }

        let realized_loss_today = (inner.daily_start_capital - inner.current_capital).max(0.0);
        if realized_loss_today >= self.max_daily_loss_krw {
            warn!(market, loss = realized_loss_today, "entry refused: daily loss limit (KRW)");
            return false;
        }
        if inner.initial_capital > 0.0
            && realized_loss_today / inner.initial_capital >= self.max_daily_loss_pct
        {
            warn!(market, loss = realized_loss_today, "entry refused: daily loss limit (pct)");
            return false;
        }

        debug!(market, strategy = strategy_name, size_ratio, "entry admitted");
        true
    }

    // -------------------------------------------------------------------------
    // Position lifecycle
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn enter_position(
        &self,
        market: &str,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit_1: f64,
        take_profit_2: f64,
        strategy_name: &str,
        breakeven_trigger: f64,
        trailing_start: f64,
        signal: SignalMetadata,
    ) {
        let invested = entry_price * quantity;
        let entry_fee = invested * self.fee_rate;
        let now = now_ms();

        let mut inner = self.inner.lock();
        Self::reset_daily_if_needed(&mut inner);

        inner.current_capital -= entry_fee;
        inner.total_fees_paid += entry_fee;
        inner.daily_trade_count += 1;
        inner.last_trade_time_ms.insert(market.to_string(), now);

        let position = Position {
            market: market.to_string(),
            entry_price,
            current_price: entry_price,
            quantity,
            invested_amount: invested,
            entry_time_ms: now,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            stop_loss,
            take_profit_1,
            take_profit_2,
            half_closed: false,
            highest_price: entry_price,
            breakeven_trigger,
            trailing_start,
            strategy_name: strategy_name.to_string(),
            signal,
        };

        info!(
            market,
            strategy = strategy_name,
            entry_price,
            quantity,
            invested,
            stop_loss,
            take_profit_1,
            take_profit_2,
            "position entered"
        );

        inner.positions.insert(market.to_string(), position);
    }

    /// Refresh the mark price. Breakeven lock-in is the only stop change
    /// allowed here.
    pub fn update_position(&self, market: &str, current_price: f64) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.positions.get_mut(market) else {
            return;
        };

        pos.current_price = current_price;
        pos.unrealized_pnl = (current_price - pos.entry_price) * pos.quantity;
        pos.unrealized_pnl_pct = if pos.entry_price > 0.0 {
            (current_price - pos.entry_price) / pos.entry_price * 100.0
        } else {
            0.0
        };

        if current_price > pos.highest_price {
            pos.highest_price = current_price;
        }

        if pos.breakeven_trigger > 0.0
            && current_price >= pos.breakeven_trigger
            && pos.stop_loss < pos.entry_price
        {
            info!(market, entry = pos.entry_price, "breakeven trigger crossed, stop moved to entry");
            pos.stop_loss = pos.entry_price;
        }
    }

    /// Full-exit reason, if any. TP1 is not an exit by itself.
    pub fn should_exit(&self, market: &str) -> Option<&'static str> {
        let inner = self.inner.lock();
        let pos = inner.positions.get(market)?;

        if pos.current_price <= pos.stop_loss {
            return Some("stop_loss");
        }
        if pos.current_price >= pos.take_profit_2 {
            return Some("take_profit_2");
        }
        None
    }

    /// Whether TP1 has been crossed on a position that has not yet partially
    /// closed.
    pub fn should_partial_exit(&self, market: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .positions
            .get(market)
            .map(|p| !p.half_closed && p.current_price >= p.take_profit_1)
            .unwrap_or(false)
    }

    /// Sell 50% at `exit_price`, raise the stop to entry, and record the
    /// slice. Returns the realized net profit of the slice.
    pub fn partial_exit(&self, market: &str, exit_price: f64) -> Option<f64> {
        let mut inner = self.inner.lock();
        let mut pos = inner.positions.get(market)?.clone();

        let sell_qty = pos.quantity * 0.5;
        let slice_invested = pos.invested_amount * 0.5;
        let exit_value = sell_qty * exit_price;
        let exit_fee = exit_value * self.fee_rate;
        let realized = (exit_value - exit_fee) - slice_invested;

        pos.quantity -= sell_qty;
        pos.invested_amount -= slice_invested;
        pos.half_closed = true;
        if pos.stop_loss < pos.entry_price {
            pos.stop_loss = pos.entry_price;
        }

        inner.current_capital += realized;
        inner.total_fees_paid += exit_fee;
        if inner.current_capital > inner.max_capital {
            inner.max_capital = inner.current_capital;
        }

        let record = TradeHistory {
            market: market.to_string(),
            entry_price: pos.entry_price,
            exit_price,
            quantity: sell_qty,
            profit_loss: realized,
            profit_loss_pct: if slice_invested > 0.0 {
                realized / slice_invested * 100.0
            } else {
                0.0
            },
            fee_paid: exit_fee,
            entry_time_ms: pos.entry_time_ms,
            exit_time_ms: now_ms(),
            strategy_name: pos.strategy_name.clone(),
            exit_reason: "partial_take_profit".to_string(),
            signal: pos.signal,
        };

        info!(
            market,
            exit_price,
            sold = sell_qty,
            remaining = pos.quantity,
            realized,
            "partial exit: 50% closed, stop raised to breakeven"
        );

        inner.trade_history.push(record);
        inner.positions.insert(market.to_string(), pos);
        Self::track_drawdown(&mut inner);
        Some(realized)
    }

    /// Close the whole position at `exit_price` and record the trade.
    pub fn exit_position(&self, market: &str, exit_price: f64, reason: &str) -> Option<TradeHistory> {
        let mut inner = self.inner.lock();
        let pos = inner.positions.remove(market)?;

        let exit_value = pos.quantity * exit_price;
        let exit_fee = exit_value * self.fee_rate;
        let net_profit = (exit_value - exit_fee) - pos.invested_amount;

        inner.current_capital += net_profit;
        inner.total_fees_paid += exit_fee;
        if inner.current_capital > inner.max_capital {
            inner.max_capital = inner.current_capital;
        }

        let record = TradeHistory {
            market: market.to_string(),
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            profit_loss: net_profit,
            profit_loss_pct: if pos.invested_amount > 0.0 {
                net_profit / pos.invested_amount * 100.0
            } else {
                0.0
            },
            fee_paid: exit_fee,
            entry_time_ms: pos.entry_time_ms,
            exit_time_ms: now_ms(),
            strategy_name: pos.strategy_name.clone(),
            exit_reason: reason.to_string(),
            signal: pos.signal,
        };

        info!(
            market,
            reason,
            exit_price,
            quantity = pos.quantity,
            net_profit,
            capital = inner.current_capital,
            "position closed"
        );

        inner.trade_history.push(record.clone());
        inner
            .last_trade_time_ms
            .insert(market.to_string(), now_ms());
        Self::track_drawdown(&mut inner);
        Some(record)
    }

    /// Apply a partial sell fill reported by the execution plane (e.g. a
    /// cancelled exit order that filled part of its volume). A fill covering
    /// the whole quantity becomes a full exit.
    pub fn apply_partial_sell_fill(
        &self,
        market: &str,
        exit_price: f64,
        sell_quantity: f64,
        reason: &str,
    ) -> bool {
        if sell_quantity <= 0.0 {
            return false;
        }

        let full_exit = {
            let inner = self.inner.lock();
            match inner.positions.get(market) {
                Some(pos) => sell_quantity >= pos.quantity - QTY_EPSILON,
                None => return false,
            }
        };

        if full_exit {
            return self.exit_position(market, exit_price, reason).is_some();
        }

        let mut inner = self.inner.lock();
        let Some(mut pos) = inner.positions.get(market).cloned() else {
            return false;
        };

        let portion = sell_quantity / pos.quantity;
        let slice_invested = pos.invested_amount * portion;
        let exit_value = sell_quantity * exit_price;
        let exit_fee = exit_value * self.fee_rate;
        let realized = (exit_value - exit_fee) - slice_invested;

        pos.quantity -= sell_quantity;
        pos.invested_amount -= slice_invested;

        inner.current_capital += realized;
        inner.total_fees_paid += exit_fee;
        if inner.current_capital > inner.max_capital {
            inner.max_capital = inner.current_capital;
        }

        let record = TradeHistory {
            market: market.to_string(),
            entry_price: pos.entry_price,
            exit_price,
            quantity: sell_quantity,
            profit_loss: realized,
            profit_loss_pct: if slice_invested > 0.0 {
                realized / slice_invested * 100.0
            } else {
                0.0
            },
            fee_paid: exit_fee,
            entry_time_ms: pos.entry_time_ms,
            exit_time_ms: now_ms(),
            strategy_name: pos.strategy_name.clone(),
            exit_reason: reason.to_string(),
            signal: pos.signal,
        };

        info!(
            market,
            sold = sell_quantity,
            remaining = pos.quantity,
            realized,
            reason,
            "partial sell fill applied"
        );

        inner.trade_history.push(record);
        inner.positions.insert(market.to_string(), pos);
        Self::track_drawdown(&mut inner);
        true
    }

    /// Adopt an externally discovered holding as a tracked position without
    /// touching capital, fees, or daily counters. Used by account recovery.
    pub fn adopt_position(&self, position: Position) {
        let mut inner = self.inner.lock();
        info!(
            market = %position.market,
            quantity = position.quantity,
            entry_price = position.entry_price,
            strategy = %position.strategy_name,
            "position adopted from exchange holdings"
        );
        inner.positions.insert(position.market.clone(), position);
    }

    /// Flag a position as half-closed and lock the stop at entry without any
    /// capital movement. Used when the partial-exit order is in flight and
    /// the fill will be applied by the drain.
    pub fn mark_half_closed(&self, market: &str) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.positions.get_mut(market) {
            pos.half_closed = true;
            if pos.stop_loss < pos.entry_price {
                pos.stop_loss = pos.entry_price;
            }
        }
    }

    /// Shrink a position to the quantity that actually filled (entry order
    /// cancelled after a partial fill). Invested amount scales down with it;
    /// a zero quantity removes the position.
    pub fn update_position_quantity(&self, market: &str, new_quantity: f64) {
        let mut inner = self.inner.lock();
        if new_quantity <= QTY_EPSILON {
            inner.positions.remove(market);
            warn!(market, "position removed: entry order ended with zero fill");
            return;
        }
        if let Some(pos) = inner.positions.get_mut(market) {
            if pos.quantity > 0.0 && new_quantity < pos.quantity {
                let scale = new_quantity / pos.quantity;
                pos.invested_amount *= scale;
                pos.quantity = new_quantity;
                info!(market, quantity = new_quantity, "position quantity reconciled to fill");
            }
        }
    }

    /// Raise (never lower) the stop.
    pub fn update_stop_loss(&self, market: &str, new_stop_loss: f64, reason: &str) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.positions.get_mut(market) else {
            return;
        };
        if new_stop_loss > pos.stop_loss {
            info!(
                market,
                old = pos.stop_loss,
                new = new_stop_loss,
                reason,
                "stop loss raised"
            );
            pos.stop_loss = new_stop_loss;
        }
    }

    // -------------------------------------------------------------------------
    // Pending capital
    // -------------------------------------------------------------------------

    pub fn reserve_pending_capital(&self, amount: f64) {
        let mut inner = self.inner.lock();
        inner.pending_order_capital += amount;
        debug!(amount, pending = inner.pending_order_capital, "pending capital reserved");
    }

    pub fn release_pending_capital(&self, amount: f64) {
        let mut inner = self.inner.lock();
        inner.pending_order_capital = (inner.pending_order_capital - amount).max(0.0);
        debug!(amount, pending = inner.pending_order_capital, "pending capital released");
    }

    /// Overwrite the ledger with the exchange-reported balance. Pending
    /// capital clears and the MDD reference resets.
    pub fn reset_capital(&self, actual_balance: f64) {
        let mut inner = self.inner.lock();
        inner.current_capital = actual_balance;
        inner.initial_capital = actual_balance;
        inner.max_capital = actual_balance;
        inner.pending_order_capital = 0.0;
        inner.daily_start_capital = actual_balance;
        info!(balance = actual_balance, "capital ledger synced to exchange balance");
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    /// Quarter-Kelly, clamped to [1%, 10%] of capital.
    pub fn kelly_position_size(win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
        if avg_loss <= 0.0 || avg_win <= 0.0 {
            return 0.01;
        }
        let b = avg_win / avg_loss;
        let p = win_rate;
        let q = 1.0 - win_rate;
        let kelly = (p * b - q) / b;
        (kelly * 0.25).clamp(0.01, 0.10)
    }

    /// Size from the post-fee reward/risk of the proposed bracket.
    pub fn fee_aware_position_size(
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        fee_rate: f64,
    ) -> f64 {
        if entry_price <= 0.0 || stop_loss >= entry_price || take_profit <= entry_price {
            return 0.0;
        }
        // Round-trip fees eat into the reward and add to the risk.
        let fees = entry_price * fee_rate * 2.0;
        let reward = (take_profit - entry_price) - fees;
        let risk = (entry_price - stop_loss) + fees;
        if risk <= 0.0 || reward <= 0.0 {
            return 0.0;
        }
        let rr = reward / risk;
        if rr >= 2.0 {
            0.05
        } else if rr >= 1.5 {
            0.03
        } else {
            0.0
        }
    }

    /// Tightest of: hard stop (−1.5%), ATR-multiple stop, and the nearest
    /// support shifted 0.2% below.
    pub fn dynamic_stop_loss(entry_price: f64, candles: &[indicators::Candle]) -> f64 {
        let hard = entry_price * 0.985;

        let atr_stop = match indicators::atr(candles, 14) {
            Some(atr) if atr > 0.0 => {
                let vol_ratio = atr / entry_price;
                // Wider multiple when calm, tighter when volatile.
                let multiplier = if vol_ratio < 0.01 {
                    2.5
                } else if vol_ratio < 0.03 {
                    2.0
                } else {
                    1.5
                };
                entry_price - multiplier * atr
            }
            _ => 0.0,
        };

        let support_stop = indicators::nearest_support(candles, entry_price)
            .map(|s| s * 0.998)
            .unwrap_or(0.0);

        hard.max(atr_stop).max(support_stop).min(entry_price * 0.999)
    }

    // -------------------------------------------------------------------------
    // Queries & metrics
    // -------------------------------------------------------------------------

    pub fn has_position(&self, market: &str) -> bool {
        self.inner.lock().positions.contains_key(market)
    }

    pub fn get_position(&self, market: &str) -> Option<Position> {
        self.inner.lock().positions.get(market).cloned()
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.inner.lock().positions.values().cloned().collect()
    }

    pub fn trade_history(&self) -> Vec<TradeHistory> {
        self.inner.lock().trade_history.clone()
    }

    pub fn metrics(&self) -> RiskMetrics {
        let mut inner = self.inner.lock();
        Self::reset_daily_if_needed(&mut inner);

        let invested: f64 = inner.positions.values().map(|p| p.invested_amount).sum();
        let unrealized: f64 = inner.positions.values().map(|p| p.unrealized_pnl).sum();
        let equity = Self::equity(&inner);

        let mut winning = 0u32;
        let mut losing = 0u32;
        let mut gross_win = 0.0;
        let mut gross_loss = 0.0;
        for trade in &inner.trade_history {
            if trade.profit_loss >= 0.0 {
                winning += 1;
                gross_win += trade.profit_loss;
            } else {
                losing += 1;
                gross_loss += -trade.profit_loss;
            }
        }
        let total_trades = winning + losing;
        let win_rate = if total_trades > 0 {
            winning as f64 / total_trades as f64
        } else {
            0.0
        };
        let profit_factor = if gross_loss > 0.0 {
            gross_win / gross_loss
        } else if gross_win > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let realized = inner.current_capital - inner.initial_capital;
        let total_pnl = realized + unrealized;
        let current_drawdown = if inner.max_capital > 0.0 {
            ((inner.max_capital - equity) / inner.max_capital).max(0.0)
        } else {
            0.0
        };

        RiskMetrics {
            total_capital: equity,
            available_capital: inner.current_capital - invested - inner.pending_order_capital,
            invested_capital: invested,
            pending_order_capital: inner.pending_order_capital,
            unrealized_pnl: unrealized,
            realized_pnl: realized,
            total_pnl,
            total_pnl_pct: if inner.initial_capital > 0.0 {
                total_pnl / inner.initial_capital * 100.0
            } else {
                0.0
            },
            total_trades,
            winning_trades: winning,
            losing_trades: losing,
            win_rate,
            max_drawdown: inner.max_drawdown_seen.max(current_drawdown),
            current_drawdown,
            sharpe_ratio: Self::sharpe(&inner.trade_history),
            profit_factor,
            active_positions: inner.positions.len(),
            max_positions: self.max_positions,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn equity(inner: &Inner) -> f64 {
        let unrealized: f64 = inner.positions.values().map(|p| p.unrealized_pnl).sum();
        inner.current_capital + unrealized
    }

    fn track_drawdown(inner: &mut Inner) {
        if inner.max_capital > 0.0 {
            let dd = ((inner.max_capital - Self::equity(inner)) / inner.max_capital).max(0.0);
            if dd > inner.max_drawdown_seen {
                inner.max_drawdown_seen = dd;
            }
        }
    }

    fn reset_daily_if_needed(inner: &mut Inner) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if inner.daily_date != today {
            info!(
                old_date = %inner.daily_date,
                new_date = %today,
                "date rolled, resetting daily counters"
            );
            inner.daily_date = today;
            inner.daily_trade_count = 0;
            inner.daily_start_capital = inner.current_capital;
        }
    }

    /// Annualised Sharpe over per-trade returns.
    fn sharpe(history: &[TradeHistory]) -> f64 {
        if history.len() < 2 {
            return 0.0;
        }
        let returns: Vec<f64> = history.iter().map(|t| t.profit_loss_pct / 100.0).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns
            .iter()
            .map(|r| (r - mean) * (r - mean))
            .sum::<f64>()
            / (returns.len() - 1) as f64;
        let std = variance.sqrt();
        if std <= 0.0 {
            return 0.0;
        }
        mean / std * (252.0_f64).sqrt()
    }
}
