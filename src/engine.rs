// =============================================================================
// Trading Engine — dual-cadence control loop
// =============================================================================
//
// Fast path (every 500 ms): one batch ticker call marks every open position,
// exit rules run (partial before full), the order manager's monitor pass
// executes, and drained fills are reconciled into the risk manager. In LIVE
// mode the account re-syncs every 5 minutes.
//
// Slow path (every `scan_interval_seconds`): market scan → signal generation
// → signal execution → metrics update.
//
// A tick that overruns its budget triggers the next tick immediately; ticks
// never stack. Any error inside a tick is logged, the loop sleeps one second
// and continues. The atomic `running` flag is the only exit condition.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::compliance::{ComplianceAdapter, ExecutionRequest};
use crate::engine_config::EngineConfig;
use crate::execution::order_manager::{best_book_price, ActiveOrder, ExitParams, OrderManager};
use crate::learning_state::{JsonStateStore, LearningStateSnapshot};
use crate::risk::{Position, RiskManager, SignalMetadata};
use crate::scanner::{CoinMetrics, MarketScanner};
use crate::strategy::{Signal, StrategyManager, MIN_SIGNAL_STRENGTH};
use crate::tick_size;
use crate::types::{json_number, now_ms, MarketRegime, OrderSide, TradingMode};
use crate::upbit::client::UpbitClient;
use crate::upbit::my_order_ws::{run_my_order_stream, MyOrderLink};

const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
const ACCOUNT_SYNC_INTERVAL: Duration = Duration::from_secs(300);
/// Settle time between order acknowledgement and the first readback.
const POST_SUBMIT_WAIT: Duration = Duration::from_millis(500);
/// Holdings below this notional are dust, not recoverable positions.
const DUST_THRESHOLD_KRW: f64 = 5_000.0;
/// Forced exits must clear the exchange minimum with a small margin.
const RECOVERY_MIN_NOTIONAL_KRW: f64 = 5_100.0;

pub const EXECUTION_ARTIFACT_PATH: &str = "logs/execution_updates_live.jsonl";
const LEARNING_STATE_PATH: &str = "state/learning_state.json";

struct LoopState {
    scanned_markets: Vec<CoinMetrics>,
    pending_signals: Vec<Signal>,
    last_scan: Option<Instant>,
    last_account_sync: Option<Instant>,
    total_scans: u64,
    total_signals: u64,
    /// BUY order ids whose position was already registered by the post-submit
    /// readback; the drain must not register them twice.
    registered_entries: HashSet<String>,
    /// Exit reason carried from sell submission to the drained fill.
    pending_exit_reasons: HashMap<String, String>,
}

pub struct TradingEngine {
    config: EngineConfig,
    client: Arc<UpbitClient>,
    scanner: MarketScanner,
    strategies: Arc<StrategyManager>,
    risk: Arc<RiskManager>,
    orders: Arc<OrderManager>,
    compliance: ComplianceAdapter,
    ws_link: Arc<MyOrderLink>,
    state_store: JsonStateStore,

    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<LoopState>,
    start_time_ms: i64,
}

impl TradingEngine {
    pub fn new(config: EngineConfig, client: Arc<UpbitClient>) -> Arc<Self> {
        info!(mode = %config.mode, initial_capital = config.initial_capital, "trading engine initialising");

        let risk = Arc::new(RiskManager::new(&config));
        let strategies = Arc::new(StrategyManager::with_enabled(&config.enabled_strategies));
        let scanner = MarketScanner::new(client.clone(), config.min_volume_krw);

        let ws_link = MyOrderLink::new();
        let orders = Arc::new(OrderManager::new(
            client.clone(),
            (config.mode == TradingMode::Live).then(|| ws_link.clone()),
            EXECUTION_ARTIFACT_PATH,
        ));

        let compliance = ComplianceAdapter::new(
            (config.mode == TradingMode::Live).then(|| client.clone()),
            risk.clone(),
            config.mode,
        );

        Arc::new(Self {
            config,
            client,
            scanner,
            strategies,
            risk,
            orders,
            compliance,
            ws_link,
            state_store: JsonStateStore::new(LEARNING_STATE_PATH),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            state: Mutex::new(LoopState {
                scanned_markets: Vec::new(),
                pending_signals: Vec::new(),
                last_scan: None,
                last_account_sync: None,
                total_scans: 0,
                total_signals: 0,
                registered_entries: HashSet::new(),
                pending_exit_reasons: HashMap::new(),
            }),
            start_time_ms: now_ms(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn risk(&self) -> Arc<RiskManager> {
        self.risk.clone()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the worker. Idempotent: a second call while running is a no-op.
    /// In LIVE mode the account state syncs once before the first tick and
    /// the private order stream is attached.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("engine start requested but already running");
            return Ok(());
        }

        match self.state_store.load() {
            Ok(Some(snapshot)) => info!(
                saved_at_ms = snapshot.saved_at_ms,
                schema = snapshot.schema_version,
                "learning state restored"
            ),
            Ok(None) => info!("no prior learning state; starting fresh"),
            Err(e) => warn!(error = %e, "learning state load failed; starting fresh"),
        }

        if self.config.mode == TradingMode::Live {
            self.sync_account_state()
                .await
                .context("initial account sync failed")?;

            let link = self.ws_link.clone();
            let orders = self.orders.clone();
            let access_key = self.client.access_key().to_string();
            let secret_key = self.client.secret_key().to_string();
            tokio::spawn(async move {
                run_my_order_stream(access_key, secret_key, link, move |message| {
                    orders.handle_ws_event(message);
                })
                .await;
            });
        }

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.run_loop().await;
        });
        *self.worker.lock() = Some(handle);

        info!(mode = %self.config.mode, "trading engine started");
        Ok(())
    }

    /// Cooperative shutdown: clear the flag, join the worker, emit the final
    /// performance block.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.log_performance();
        info!("trading engine stopped");
    }

    async fn run_loop(&self) {
        info!(
            monitor_ms = MONITOR_INTERVAL.as_millis() as u64,
            scan_interval_s = self.config.scan_interval_seconds,
            "control loop running"
        );

        while self.running.load(Ordering::Relaxed) {
            let tick_started = Instant::now();

            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed; continuing after 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            // Overrun -> fire the next tick immediately; no catch-up stacking.
            let elapsed = tick_started.elapsed();
            if elapsed < MONITOR_INTERVAL {
                tokio::time::sleep(MONITOR_INTERVAL - elapsed).await;
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        self.monitor_positions().await?;
        self.orders.monitor().await;
        self.process_filled_orders();

        if self.config.mode == TradingMode::Live {
            let due = {
                let state = self.state.lock();
                state
                    .last_account_sync
                    .map(|at| at.elapsed() >= ACCOUNT_SYNC_INTERVAL)
                    .unwrap_or(true)
            };
            if due {
                self.sync_account_state().await?;
            }
        }

        let scan_due = {
            let state = self.state.lock();
            state
                .last_scan
                .map(|at| at.elapsed() >= Duration::from_secs(self.config.scan_interval_seconds))
                .unwrap_or(true)
        };
        if scan_due {
            self.scan_markets().await?;
            self.generate_signals();
            self.execute_signals().await;
            self.update_metrics();
            self.state.lock().last_scan = Some(Instant::now());
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fast path: position monitoring
    // -------------------------------------------------------------------------

    /// One batch ticker call covers every open market. A market with no price
    /// in the response is skipped; missing data never triggers a sell.
    async fn monitor_positions(&self) -> Result<()> {
        let positions = self.risk.all_positions();
        if positions.is_empty() {
            return Ok(());
        }

        let markets: Vec<String> = positions.iter().map(|p| p.market.clone()).collect();
        let tickers = self.client.get_tickers_batched(&markets).await?;
        let prices: HashMap<String, f64> = tickers
            .iter()
            .filter_map(|t| {
                let market = t.get("market")?.as_str()?.to_string();
                let price = json_number(t, "trade_price");
                (price > 0.0).then_some((market, price))
            })
            .collect();

        for position in positions {
            let Some(&price) = prices.get(&position.market) else {
                warn!(market = %position.market, "no price in batch ticker; skipping position");
                continue;
            };

            self.risk.update_position(&position.market, price);
            if let Some(strategy) = self.strategies.get(&position.strategy_name) {
                strategy.update_state(&position.market, price);
            }

            // Partial exit first, then full exit.
            if self.risk.should_partial_exit(&position.market) {
                self.execute_partial_sell(&position.market, price).await;
                continue;
            }

            let holding_seconds = (now_ms() - position.entry_time_ms) / 1000;
            let exit_reason = self.risk.should_exit(&position.market).map(str::to_string).or_else(|| {
                self.strategies
                    .get(&position.strategy_name)
                    .filter(|s| {
                        s.should_exit(&position.market, position.entry_price, price, holding_seconds)
                    })
                    .map(|_| "strategy_exit".to_string())
            });

            if let Some(reason) = exit_reason {
                self.execute_sell(&position.market, price, &reason).await;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Slow path: scan, generate, execute
    // -------------------------------------------------------------------------

    async fn scan_markets(&self) -> Result<()> {
        let scanned = self.scanner.scan_markets().await?;
        let mut state = self.state.lock();
        state.total_scans += 1;
        state.scanned_markets = scanned;
        Ok(())
    }

    fn generate_signals(&self) {
        let scanned = self.state.lock().scanned_markets.clone();
        let available = self.risk.metrics().available_capital;

        let mut signals = Vec::new();
        for metrics in &scanned {
            let collected = self.strategies.collect_signals(
                &metrics.market,
                metrics,
                &metrics.candles,
                metrics.current_price,
                available,
            );
            let filtered = self.strategies.filter_signals(collected, MIN_SIGNAL_STRENGTH);
            if let Some(best) = self.strategies.select_best(&filtered) {
                signals.push(best);
            }
        }

        // Strongest candidates first.
        signals.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut state = self.state.lock();
        state.total_signals += signals.len() as u64;
        state.pending_signals = signals;
    }

    async fn execute_signals(&self) {
        let signals = std::mem::take(&mut self.state.lock().pending_signals);
        let scanned = self.state.lock().scanned_markets.clone();
        let mut submitted: u32 = 0;

        for signal in signals {
            if !signal.signal_type.is_buy() {
                continue;
            }
            if submitted >= self.config.max_new_orders_per_scan {
                info!(cap = self.config.max_new_orders_per_scan, "new-order budget for this scan reached");
                break;
            }
            if self.risk.has_position(&signal.market) || self.orders.has_active_order(&signal.market)
            {
                continue;
            }

            let metrics = scanned.iter().find(|m| m.market == signal.market);
            match self.execute_buy_signal(&signal, metrics).await {
                Ok(true) => submitted += 1,
                Ok(false) => {}
                Err(e) => warn!(market = %signal.market, error = %e, "buy execution failed"),
            }
        }
    }

    /// Execute one BUY signal end to end: price from the best ask, sizing
    /// with the small-seed correction, compliance gate, submission, readback.
    async fn execute_buy_signal(
        &self,
        signal: &Signal,
        metrics: Option<&CoinMetrics>,
    ) -> Result<bool> {
        // Entry price comes from the book, not the ticker.
        let orderbook = self
            .client
            .get_orderbook(&[signal.market.clone()])
            .await
            .context("orderbook fetch for entry failed")?;
        let Some(best_ask) = best_book_price(&orderbook, OrderSide::Sell) else {
            anyhow::bail!("no best ask for {}", signal.market);
        };
        let entry_price = tick_size::round_down_to_tick(best_ask);
        anyhow::ensure!(entry_price > 0.0, "degenerate entry price");

        let available = self.risk.metrics().available_capital;
        let Some((invest_amount, position_size)) = size_order(
            available,
            signal.position_size,
            self.config.min_order_krw,
            self.config.max_order_krw,
            self.config.order_fee_reserve_pct,
        ) else {
            info!(
                market = %signal.market,
                available,
                "order sizing refused (below minimum or above maximum)"
            );
            return Ok(false);
        };

        let volume = invest_amount / entry_price;
        let request = ExecutionRequest {
            market: signal.market.clone(),
            side: OrderSide::Buy,
            price: entry_price,
            volume,
        };

        let mut sized_signal = signal.clone();
        sized_signal.position_size = position_size;
        let check = self.compliance.validate_entry(&request, &sized_signal).await;
        if !check.ok {
            info!(market = %signal.market, reason = %check.reason, "entry rejected by compliance");
            return Ok(false);
        }

        if let Some(strategy) = self.strategies.get(&signal.strategy_name) {
            if !strategy.on_signal_accepted(signal, invest_amount) {
                info!(market = %signal.market, strategy = %signal.strategy_name, "entry vetoed by strategy");
                return Ok(false);
            }
        }

        // Rebase the bracket onto the actual entry price.
        let scale = entry_price / signal.entry_price.max(1e-9);
        let exits = ExitParams {
            stop_loss: signal.stop_loss * scale,
            take_profit_1: signal.take_profit_1 * scale,
            take_profit_2: signal.take_profit_2 * scale,
            breakeven_trigger: if signal.take_profit_1 > 0.0 {
                (entry_price + signal.take_profit_1 * scale) / 2.0
            } else {
                0.0
            },
            trailing_start: signal.take_profit_1 * scale,
        };
        let meta = signal_metadata(&sized_signal, metrics, self.strategies.overall_win_rate());

        if self.config.dry_run {
            info!(
                market = %signal.market,
                entry_price,
                volume,
                invest_amount,
                "dry run: order suppressed"
            );
            return Ok(false);
        }

        if self.config.mode != TradingMode::Live {
            // Simulated immediate fill.
            self.risk.enter_position(
                &signal.market,
                entry_price,
                volume,
                exits.stop_loss,
                exits.take_profit_1,
                exits.take_profit_2,
                &signal.strategy_name,
                exits.breakeven_trigger,
                exits.trailing_start,
                meta,
            );
            return Ok(true);
        }

        self.execute_live_buy(signal, entry_price, volume, invest_amount, exits, meta)
            .await
    }

    async fn execute_live_buy(
        &self,
        signal: &Signal,
        entry_price: f64,
        volume: f64,
        invest_amount: f64,
        exits: ExitParams,
        meta: SignalMetadata,
    ) -> Result<bool> {
        self.risk.reserve_pending_capital(invest_amount);

        let order_id = match self
            .orders
            .submit(
                &signal.market,
                OrderSide::Buy,
                entry_price,
                volume,
                &signal.strategy_name,
                exits,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.risk.release_pending_capital(invest_amount);
                return Err(e);
            }
        };

        // Let the exchange settle, then read authoritative state back.
        tokio::time::sleep(POST_SUBMIT_WAIT).await;
        self.orders.sync_order(&order_id).await;

        let Some(order) = self.orders.get_order(&order_id) else {
            // Already drained (instant full fill): the drain path registers.
            self.risk.release_pending_capital(invest_amount);
            return Ok(true);
        };

        if order.filled_volume <= 0.0 {
            if order.status.is_terminal() {
                // Rejected or cancelled before any fill.
                self.risk.release_pending_capital(invest_amount);
                return Ok(false);
            }
            // Still resting with no fills: cancel and treat as failed.
            info!(market = %signal.market, order_id = %order_id, "entry unfilled after readback; cancelling");
            self.orders.cancel(&order_id).await;
            self.risk.release_pending_capital(invest_amount);
            return Ok(false);
        }

        // A fill exists: register the position at the volume-weighted price.
        self.risk.release_pending_capital(invest_amount);
        self.risk.enter_position(
            &signal.market,
            order.price,
            order.volume,
            exits.stop_loss,
            exits.take_profit_1,
            exits.take_profit_2,
            &signal.strategy_name,
            exits.breakeven_trigger,
            exits.trailing_start,
            meta,
        );
        self.state.lock().registered_entries.insert(order_id);
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    async fn execute_partial_sell(&self, market: &str, price: f64) {
        let Some(position) = self.risk.get_position(market) else {
            return;
        };

        if self.config.mode != TradingMode::Live || self.config.dry_run {
            self.risk.partial_exit(market, price);
            return;
        }

        let check = self
            .compliance
            .validate_exit(market, position.quantity * 0.5, price);
        if !check.ok {
            warn!(market, reason = %check.reason, "partial exit blocked");
            return;
        }

        match self
            .orders
            .submit_market_sell(market, position.quantity * 0.5, price, &position.strategy_name)
            .await
        {
            Ok(_) => {
                // Stop-to-entry and the half-closed flag apply now; capital
                // moves when the fill drains.
                self.risk.mark_half_closed(market);
                self.state
                    .lock()
                    .pending_exit_reasons
                    .insert(market.to_string(), "partial_take_profit".to_string());
            }
            Err(e) => warn!(market, error = %e, "partial sell submission failed"),
        }
    }

    async fn execute_sell(&self, market: &str, price: f64, reason: &str) {
        let Some(position) = self.risk.get_position(market) else {
            return;
        };

        if self.config.mode != TradingMode::Live || self.config.dry_run {
            if let Some(record) = self.risk.exit_position(market, price, reason) {
                self.strategies
                    .record_trade_result(&record.strategy_name, market, record.profit_loss);
            }
            return;
        }

        let check = self.compliance.validate_exit(market, position.quantity, price);
        if !check.ok {
            warn!(market, reason = %check.reason, "exit blocked");
            return;
        }
        if self.orders.has_active_order(market) {
            // An exit order is already working this market.
            return;
        }

        match self
            .orders
            .submit_market_sell(market, position.quantity, price, &position.strategy_name)
            .await
        {
            Ok(_) => {
                self.state
                    .lock()
                    .pending_exit_reasons
                    .insert(market.to_string(), reason.to_string());
            }
            Err(e) => warn!(market, error = %e, "sell submission failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Drain reconciliation
    // -------------------------------------------------------------------------

    /// Apply every drained fill to the risk manager. This is the only path
    /// through which execution results reach the ledger in LIVE mode.
    fn process_filled_orders(&self) {
        let drained = self.orders.drain_filled_orders();
        if drained.is_empty() {
            return;
        }

        for order in drained {
            match order.side {
                OrderSide::Buy => self.reconcile_buy_fill(&order),
                OrderSide::Sell => self.reconcile_sell_fill(&order),
            }
        }
    }

    fn reconcile_buy_fill(&self, order: &ActiveOrder) {
        let was_registered = self.state.lock().registered_entries.remove(&order.order_id);

        if was_registered {
            // Position exists with the full order volume; shrink it if the
            // order ended with a partial fill.
            if order.filled_volume < order.volume - 1e-8 {
                self.risk
                    .update_position_quantity(&order.market, order.filled_volume);
            }
            return;
        }

        if self.risk.has_position(&order.market) {
            return;
        }

        let meta = SignalMetadata {
            strength: 0.0,
            filter: 0.5,
            ..Default::default()
        };
        self.risk.enter_position(
            &order.market,
            order.price,
            order.filled_volume,
            order.exits.stop_loss,
            order.exits.take_profit_1,
            order.exits.take_profit_2,
            &order.strategy_name,
            order.exits.breakeven_trigger,
            order.exits.trailing_start,
            meta,
        );
    }

    fn reconcile_sell_fill(&self, order: &ActiveOrder) {
        let reason = self
            .state
            .lock()
            .pending_exit_reasons
            .remove(&order.market)
            .unwrap_or_else(|| "live_exit".to_string());

        let applied =
            self.risk
                .apply_partial_sell_fill(&order.market, order.price, order.filled_volume, &reason);
        if !applied {
            warn!(market = %order.market, order_id = %order.order_id, "sell fill had no matching position");
            return;
        }

        if !self.risk.has_position(&order.market) {
            if let Some(record) = self.risk.trade_history().last() {
                self.strategies.record_trade_result(
                    &record.strategy_name,
                    &order.market,
                    record.profit_loss,
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Account sync & recovery
    // -------------------------------------------------------------------------

    /// Pull balances, rebase the ledger on the KRW entry, and adopt untracked
    /// holdings above the dust threshold as RECOVERED positions.
    pub async fn sync_account_state(&self) -> Result<()> {
        let accounts = self.client.get_accounts().await.context("accounts fetch failed")?;
        let Some(entries) = accounts.as_array() else {
            anyhow::bail!("accounts response is not an array");
        };

        for entry in entries {
            let currency = entry.get("currency").and_then(|c| c.as_str()).unwrap_or("");
            let balance = json_number(entry, "balance");
            let locked = json_number(entry, "locked");
            let total = balance + locked;

            if currency == "KRW" {
                self.risk.reset_capital(total);
                continue;
            }
            if currency.is_empty() || total <= 0.0 {
                continue;
            }

            let market = format!("KRW-{currency}");
            if self.risk.has_position(&market) {
                continue;
            }

            let avg_price = json_number(entry, "avg_buy_price");
            if avg_price <= 0.0 || total * avg_price < DUST_THRESHOLD_KRW {
                continue;
            }

            let position = recovered_position(&market, avg_price, total);
            info!(
                market = %market,
                quantity = total,
                avg_price,
                stop_loss = position.stop_loss,
                "recovering untracked exchange holding"
            );
            self.risk.adopt_position(position);
        }

        self.state.lock().last_account_sync = Some(Instant::now());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Metrics, learning state, manual hooks
    // -------------------------------------------------------------------------

    fn update_metrics(&self) {
        let metrics = self.risk.metrics();
        info!(
            equity = metrics.total_capital,
            available = metrics.available_capital,
            invested = metrics.invested_capital,
            unrealized = metrics.unrealized_pnl,
            realized = metrics.realized_pnl,
            trades = metrics.total_trades,
            win_rate = metrics.win_rate * 100.0,
            drawdown = metrics.current_drawdown * 100.0,
            positions = metrics.active_positions,
            "metrics update"
        );

        let win_rate = self.strategies.overall_win_rate();
        let snapshot = LearningStateSnapshot {
            schema_version: 1,
            saved_at_ms: now_ms(),
            policy_params: serde_json::json!({
                "dynamic_filter": dynamic_filter(win_rate),
                "overall_win_rate": win_rate,
            }),
            bucket_stats: serde_json::json!(self
                .strategies
                .all_statistics()
                .iter()
                .map(|(name, stats)| serde_json::json!({
                    "strategy": name,
                    "wins": stats.winning_trades,
                    "losses": stats.losing_trades,
                    "total_pnl": stats.total_pnl,
                }))
                .collect::<Vec<_>>()),
            rollback_point: serde_json::json!({ "dynamic_filter": 0.5 }),
        };
        if let Err(e) = self.state_store.save(&snapshot) {
            warn!(error = %e, "learning state save failed");
        }
    }

    fn log_performance(&self) {
        let metrics = self.risk.metrics();
        let limiter = self.client.limiter().stats();
        let uptime_secs = (now_ms() - self.start_time_ms) / 1000;
        let state = self.state.lock();

        info!("==================== performance ====================");
        info!(
            uptime_secs,
            scans = state.total_scans,
            signals = state.total_signals,
            "session activity"
        );
        info!(
            trades = metrics.total_trades,
            win_rate = metrics.win_rate * 100.0,
            profit_factor = metrics.profit_factor,
            sharpe = metrics.sharpe_ratio,
            max_drawdown = metrics.max_drawdown * 100.0,
            total_pnl = metrics.total_pnl,
            "session results"
        );
        info!(
            requests = limiter.total_requests,
            rejected = limiter.rejected_requests,
            forced_waits = limiter.forced_waits,
            "rate limiter"
        );
        info!("=====================================================");
    }

    /// Test hook: run one scan/generate/execute pass immediately.
    pub async fn manual_scan(&self) -> Result<()> {
        self.scan_markets().await?;
        self.generate_signals();
        self.execute_signals().await;
        self.update_metrics();
        self.state.lock().last_scan = Some(Instant::now());
        Ok(())
    }

    /// Test hook: close one position through the normal exit path.
    pub async fn manual_close_position(&self, market: &str) {
        let Some(position) = self.risk.get_position(market) else {
            warn!(market, "manual close requested for unknown position");
            return;
        };
        let price = if position.current_price > 0.0 {
            position.current_price
        } else {
            position.entry_price
        };
        self.execute_sell(market, price, "manual").await;
    }

    /// Test hook: close everything.
    pub async fn manual_close_all(&self) {
        for position in self.risk.all_positions() {
            self.manual_close_position(&position.market).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Order sizing with the small-seed correction. Returns
/// `(invest_amount, effective_position_size)` or `None` when no valid size
/// exists.
pub fn size_order(
    available_cash: f64,
    position_size: f64,
    min_order_krw: f64,
    max_order_krw: f64,
    fee_reserve_pct: f64,
) -> Option<(f64, f64)> {
    if available_cash <= 0.0 || position_size <= 0.0 {
        return None;
    }

    let mut invest = available_cash * position_size;

    if invest < min_order_krw {
        // Smallest ratio that clears the exchange minimum plus the fee
        // reserve.
        let required = min_order_krw * (1.0 + fee_reserve_pct);
        if required > available_cash || required > max_order_krw {
            return None;
        }
        invest = required;
    }

    if invest > max_order_krw {
        invest = max_order_krw;
    }

    let effective = invest / available_cash;
    Some((invest, effective.min(1.0)))
}

/// Scalar filter fed back from the realized win rate, bounded to
/// [0.45, 0.55].
pub fn dynamic_filter(win_rate: f64) -> f64 {
    (0.5 + (win_rate - 0.5) * 0.2).clamp(0.45, 0.55)
}

/// Coarse regime classification from scan metrics.
pub fn classify_regime(metrics: &CoinMetrics) -> MarketRegime {
    if metrics.volatility > 0.03 {
        MarketRegime::HighVolatility
    } else if metrics.price_change_rate > 2.0 {
        MarketRegime::TrendingUp
    } else if metrics.price_change_rate < -2.0 {
        MarketRegime::TrendingDown
    } else if metrics.volatility > 0.0 {
        MarketRegime::Ranging
    } else {
        MarketRegime::Unknown
    }
}

fn signal_metadata(
    signal: &Signal,
    metrics: Option<&CoinMetrics>,
    overall_win_rate: f64,
) -> SignalMetadata {
    let rr = signal.reward_risk_ratio().unwrap_or(0.0);
    SignalMetadata {
        filter: dynamic_filter(overall_win_rate),
        strength: signal.strength,
        regime: metrics.map(classify_regime).unwrap_or_default(),
        liquidity_score: metrics.map(|m| m.liquidity_score).unwrap_or(0.0),
        volatility: metrics.map(|m| m.volatility).unwrap_or(0.0),
        expected_value: signal.strength * rr,
        reward_risk_ratio: rr,
    }
}

/// A RECOVERED position for an untracked holding: conservative bracket and a
/// stop floor that keeps any forced exit above the exchange minimum
/// notional.
pub fn recovered_position(market: &str, avg_price: f64, quantity: f64) -> Position {
    let floor = RECOVERY_MIN_NOTIONAL_KRW / quantity;
    let stop_loss = f64::max(avg_price * 0.97, floor);

    Position {
        market: market.to_string(),
        entry_price: avg_price,
        current_price: avg_price,
        quantity,
        invested_amount: avg_price * quantity,
        entry_time_ms: now_ms(),
        unrealized_pnl: 0.0,
        unrealized_pnl_pct: 0.0,
        stop_loss,
        take_profit_1: avg_price * 1.05,
        take_profit_2: avg_price * 1.10,
        half_closed: false,
        highest_price: avg_price,
        breakeven_trigger: avg_price * 1.02,
        trailing_start: avg_price * 1.05,
        strategy_name: "RECOVERED".to_string(),
        signal: SignalMetadata::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_respects_the_plain_path() {
        // 1_000_000 × 5% = 50_000, inside [5_000, 500_000].
        let (invest, size) = size_order(1_000_000.0, 0.05, 5_000.0, 500_000.0, 0.001).unwrap();
        assert!((invest - 50_000.0).abs() < 1e-9);
        assert!((size - 0.05).abs() < 1e-9);
    }

    #[test]
    fn small_seed_correction_bumps_to_minimum_plus_reserve() {
        // 40_000 × 10% = 4_000 < 5_000 minimum -> bump to 5_000 × 1.001.
        let (invest, size) = size_order(40_000.0, 0.10, 5_000.0, 500_000.0, 0.001).unwrap();
        assert!((invest - 5_005.0).abs() < 1e-9);
        assert!((size - 5_005.0 / 40_000.0).abs() < 1e-9);

        // Boundary: one KRW short of the minimum still corrects.
        let (invest, _) = size_order(99_980.0, 0.049_99, 5_000.0, 500_000.0, 0.001).unwrap();
        assert!(invest >= 5_000.0);
    }

    #[test]
    fn sizing_refuses_impossible_corrections() {
        // Correction exceeds available cash.
        assert!(size_order(4_000.0, 0.5, 5_000.0, 500_000.0, 0.001).is_none());
        // Correction exceeds the per-order maximum.
        assert!(size_order(1_000_000.0, 0.001, 5_000.0, 4_000.0, 0.001).is_none());
        // Degenerate inputs.
        assert!(size_order(0.0, 0.05, 5_000.0, 500_000.0, 0.001).is_none());
        assert!(size_order(1_000_000.0, 0.0, 5_000.0, 500_000.0, 0.001).is_none());
    }

    #[test]
    fn oversized_orders_clamp_to_the_maximum() {
        let (invest, _) = size_order(10_000_000.0, 0.20, 5_000.0, 500_000.0, 0.001).unwrap();
        assert!((invest - 500_000.0).abs() < 1e-9);
    }

    #[test]
    fn dynamic_filter_bounds() {
        assert_eq!(dynamic_filter(0.5), 0.5);
        assert_eq!(dynamic_filter(1.0), 0.55);
        assert_eq!(dynamic_filter(0.0), 0.45);
        assert!((dynamic_filter(0.6) - 0.52).abs() < 1e-9);
    }

    #[test]
    fn recovered_position_safe_floor() {
        // 0.5 units at avg 1_000: 3% stop would be 970, but the minimum-
        // notional floor is 5_100 / 0.5 = 10_200 and dominates.
        let position = recovered_position("KRW-XYZ", 1_000.0, 0.5);
        assert!((position.stop_loss - 10_200.0).abs() < 1e-9);
        assert_eq!(position.strategy_name, "RECOVERED");

        // A large holding keeps the ordinary 3% stop.
        let position = recovered_position("KRW-ABC", 1_000.0, 1_000.0);
        assert!((position.stop_loss - 970.0).abs() < 1e-9);
    }

    #[test]
    fn regime_classification() {
        let mut metrics = CoinMetrics::default();
        metrics.volatility = 0.05;
        assert_eq!(classify_regime(&metrics), MarketRegime::HighVolatility);

        metrics.volatility = 0.01;
        metrics.price_change_rate = 5.0;
        assert_eq!(classify_regime(&metrics), MarketRegime::TrendingUp);

        metrics.price_change_rate = -5.0;
        assert_eq!(classify_regime(&metrics), MarketRegime::TrendingDown);

        metrics.price_change_rate = 0.5;
        assert_eq!(classify_regime(&metrics), MarketRegime::Ranging);
    }
}
