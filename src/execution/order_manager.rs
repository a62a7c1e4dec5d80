// =============================================================================
// Order Manager — lifecycle owner for every live order
// =============================================================================
//
// Owns the active-order map from submission through terminal reconciliation.
// Two event sources feed the same state machine:
//   - the private myOrder WebSocket (fast path),
//   - GET /v1/order REST reads (authoritative).
// REST sync is suppressed while the WS link is fresh, except on a 15s
// per-order cadence; a WS silence of 45s forces REST back on.
//
// Resting limit orders are chased: every 5s the limit price is compared with
// the best same-side book price and the order is cancel-replaced to follow
// it. After 5 chases the order falls back to a market order (notional-
// denominated for buys, volume-denominated for sells).
//
// Locking: the map lock is never held across a network call. `monitor`
// snapshots the active set, performs I/O, and re-applies results under short
// lock sections.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::execution::state_machine::{self, FILL_EPSILON};
use crate::execution::update_schema::{self, safe_dump, ExecutionUpdate};
use crate::types::{json_number, now_ms, OrderSide, OrderStatus};
use crate::upbit::client::{format_decimal, CancelOutcome, UpbitClient};
use crate::upbit::my_order_ws::MyOrderLink;

const REST_SYNC_INTERVAL_MS: i64 = 15_000;
const WS_STALE_THRESHOLD_MS: i64 = 45_000;
const CHASE_INTERVAL_MS: i64 = 5_000;
const MAX_CHASE_ATTEMPTS: u32 = 5;

/// Exit parameters carried on an order so the position can be registered with
/// its stops once the fill drains.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitParams {
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub breakeven_trigger: f64,
    pub trailing_start: f64,
}

/// One live order and its chase/sync state.
#[derive(Debug, Clone)]
pub struct ActiveOrder {
    pub order_id: String,
    pub market: String,
    pub side: OrderSide,
    /// Limit price at submission; replaced by the average fill price once the
    /// exchange reports one.
    pub price: f64,
    pub volume: f64,
    pub filled_volume: f64,
    pub created_at_ms: i64,
    pub retry_count: u32,

    pub strategy_name: String,
    pub exits: ExitParams,

    pub is_chasing: bool,
    pub last_chase_price: f64,
    pub last_update_ms: i64,

    pub status: OrderStatus,
    pub last_state_sync_ms: i64,
}

pub struct OrderManager {
    client: Arc<UpbitClient>,
    orders: Mutex<HashMap<String, ActiveOrder>>,
    ws_link: Option<Arc<MyOrderLink>>,
    artifact_path: PathBuf,
    artifact_lock: Mutex<()>,
}

impl OrderManager {
    pub fn new(
        client: Arc<UpbitClient>,
        ws_link: Option<Arc<MyOrderLink>>,
        artifact_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            orders: Mutex::new(HashMap::new()),
            ws_link,
            artifact_path: artifact_path.into(),
            artifact_lock: Mutex::new(()),
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Place a limit order and start tracking it. Returns the exchange order
    /// id.
    pub async fn submit(
        &self,
        market: &str,
        side: OrderSide,
        price: f64,
        volume: f64,
        strategy_name: &str,
        exits: ExitParams,
    ) -> Result<String> {
        anyhow::ensure!(price > 0.0 && volume > 0.0, "order price/volume must be positive");

        info!(market, %side, price, volume, "submitting limit order");

        let response = self
            .client
            .place_order(
                market,
                side.as_wire(),
                Some(&format_decimal(volume)),
                Some(&format_decimal(price)),
                "limit",
            )
            .await
            .context("order placement failed")?;

        let order_id = response
            .get("uuid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .with_context(|| format!("order response missing uuid: {}", safe_dump(&response)))?;

        let now = now_ms();
        let order = ActiveOrder {
            order_id: order_id.clone(),
            market: market.to_string(),
            side,
            price,
            volume,
            filled_volume: 0.0,
            created_at_ms: now,
            retry_count: 0,
            strategy_name: strategy_name.to_string(),
            exits,
            is_chasing: true,
            last_chase_price: price,
            last_update_ms: now,
            status: OrderStatus::Submitted,
            last_state_sync_ms: now,
        };

        self.log_lifecycle(update_schema::source::LIVE_SUBMIT, "submitted", &order);
        self.insert_order(order);

        info!(order_id = %order_id, "order placed successfully");
        Ok(order_id)
    }

    /// Place a volume-denominated market sell and track it like any other
    /// order. Used by the engine's exit path; fills surface through the
    /// drain.
    pub async fn submit_market_sell(
        &self,
        market: &str,
        volume: f64,
        reference_price: f64,
        strategy_name: &str,
    ) -> Result<String> {
        anyhow::ensure!(volume > 0.0, "sell volume must be positive");

        info!(market, volume, "submitting market sell");

        let response = self
            .client
            .place_order(
                market,
                OrderSide::Sell.as_wire(),
                Some(&format_decimal(volume)),
                None,
                "market",
            )
            .await
            .context("market sell placement failed")?;

        let order_id = response
            .get("uuid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .with_context(|| format!("sell response missing uuid: {}", safe_dump(&response)))?;

        let now = now_ms();
        let order = ActiveOrder {
            order_id: order_id.clone(),
            market: market.to_string(),
            side: OrderSide::Sell,
            price: reference_price,
            volume,
            filled_volume: 0.0,
            created_at_ms: now,
            retry_count: 0,
            strategy_name: strategy_name.to_string(),
            exits: ExitParams::default(),
            is_chasing: false,
            last_chase_price: 0.0,
            last_update_ms: now,
            status: OrderStatus::Submitted,
            last_state_sync_ms: now,
        };

        self.log_lifecycle(update_schema::source::LIVE_SUBMIT, "submitted", &order);
        self.insert_order(order);
        Ok(order_id)
    }

    fn insert_order(&self, order: ActiveOrder) {
        self.orders.lock().insert(order.order_id.clone(), order);
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn has_active_order(&self, market: &str) -> bool {
        self.orders.lock().values().any(|o| o.market == market)
    }

    pub fn active_order_count(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn active_buy_order_count(&self) -> usize {
        self.orders
            .lock()
            .values()
            .filter(|o| o.side == OrderSide::Buy)
            .count()
    }

    pub fn get_order(&self, order_id: &str) -> Option<ActiveOrder> {
        self.orders.lock().get(order_id).cloned()
    }

    // -------------------------------------------------------------------------
    // Event reconciliation
    // -------------------------------------------------------------------------

    /// Entry point for myOrder WebSocket frames.
    pub fn handle_ws_event(&self, message: &Value) {
        if let Some(kind) = message.get("type").and_then(|t| t.as_str()) {
            if kind != "myOrder" {
                return;
            }
        }
        self.apply_exchange_order_state(message, true);
    }

    /// Apply one exchange order payload (REST read or WS event) through the
    /// state machine. Terminal orders only ever absorb additional fill
    /// information; their status is latched.
    pub fn apply_exchange_order_state(&self, payload: &Value, from_ws: bool) {
        let Some(order_id) = payload.get("uuid").and_then(|v| v.as_str()) else {
            return;
        };

        let state = payload
            .get("state")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let executed = json_number(payload, "executed_volume");
        let remaining = json_number(payload, "remaining_volume");
        let avg_price = json_number(payload, "avg_price");

        let logged = {
            let mut orders = self.orders.lock();
            let Some(order) = orders.get_mut(order_id) else {
                return;
            };

            if order.status.is_terminal() {
                // Post-terminal reconciliation: fills may still arrive, but
                // the status never changes again.
                if executed > order.filled_volume {
                    order.filled_volume = executed;
                }
                if avg_price > 0.0 {
                    order.price = avg_price;
                }
                order.last_state_sync_ms = now_ms();
                return;
            }

            let mapped = state_machine::transition(
                &state,
                order.filled_volume,
                order.volume,
                executed,
                remaining,
            );
            order.filled_volume = mapped.filled_volume;
            order.status = mapped.status;
            if mapped.terminal {
                order.is_chasing = false;
            }
            if avg_price > 0.0 {
                order.price = avg_price;
            }
            order.last_state_sync_ms = now_ms();

            if from_ws && mapped.terminal {
                info!(order_id, state = %state, "order reached terminal state via myOrder WS");
            }

            order.clone()
        };

        let source = if from_ws {
            update_schema::source::LIVE_WS
        } else {
            update_schema::source::LIVE_REST
        };
        self.log_lifecycle(source, &state, &logged);
    }

    /// Read the authoritative REST state for one order and apply it.
    pub async fn sync_order(&self, order_id: &str) {
        match self.client.get_order(order_id).await {
            Ok(state) => self.apply_exchange_order_state(&state, false),
            Err(e) => warn!(order_id, error = %e, "failed to sync order state"),
        }
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel an order. Returns `true` only when the exchange accepted the
    /// cancel; an already-terminal order answers `false` after its state has
    /// been re-synced.
    pub async fn cancel(&self, order_id: &str) -> bool {
        info!(order_id, "cancelling order");

        match self.client.cancel_order(order_id).await {
            Ok(CancelOutcome::Cancelled(_)) => {
                let drained_now = {
                    let mut orders = self.orders.lock();
                    if let Some(order) = orders.get_mut(order_id) {
                        if !order.status.is_terminal() {
                            order.status = OrderStatus::Cancelled;
                            order.is_chasing = false;
                        }
                        let snapshot = order.clone();
                        // Zero-fill cancels leave the active set immediately;
                        // partial fills stay for the drain to credit.
                        let remove = snapshot.filled_volume <= FILL_EPSILON;
                        if remove {
                            orders.remove(order_id);
                        }
                        Some(snapshot)
                    } else {
                        None
                    }
                };
                if let Some(order) = drained_now {
                    self.log_lifecycle(update_schema::source::LIVE_CANCEL, "cancelled", &order);
                }
                true
            }
            Ok(CancelOutcome::AlreadyTerminal(state)) => {
                self.apply_exchange_order_state(&state, false);
                false
            }
            Ok(CancelOutcome::Rejected(reason)) => {
                error!(order_id, reason = %reason, "cancel rejected");
                false
            }
            Err(e) => {
                error!(order_id, error = %e, "cancel request failed");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Drain
    // -------------------------------------------------------------------------

    /// Remove and return every order whose fill must be handed to the risk
    /// manager: fully filled orders, and terminal cancels/rejects carrying a
    /// partial fill. Terminal orders with zero fill are silently dropped.
    /// This drain is the only way fills become visible downstream.
    pub fn drain_filled_orders(&self) -> Vec<ActiveOrder> {
        let mut drained = Vec::new();

        {
            let mut orders = self.orders.lock();
            orders.retain(|_, order| {
                let fully_filled =
                    order.volume > 0.0 && order.filled_volume >= order.volume - FILL_EPSILON;
                let terminal_cancel_or_reject = matches!(
                    order.status,
                    OrderStatus::Cancelled | OrderStatus::Rejected
                );

                if fully_filled {
                    let mut done = order.clone();
                    done.status = OrderStatus::Filled;
                    drained.push(done);
                    false
                } else if terminal_cancel_or_reject {
                    if order.filled_volume > FILL_EPSILON {
                        drained.push(order.clone());
                    }
                    false
                } else {
                    true
                }
            });
        }

        for order in &drained {
            self.log_lifecycle(update_schema::source::LIVE_DRAIN, "drained", order);
        }
        drained
    }

    // -------------------------------------------------------------------------
    // Monitoring: REST sync, limit chase, market fallback
    // -------------------------------------------------------------------------

    /// One monitoring pass over every active order. Network I/O runs without
    /// the map lock held.
    pub async fn monitor(&self) {
        let snapshot: Vec<ActiveOrder> = self.orders.lock().values().cloned().collect();
        let now = now_ms();

        for order in snapshot {
            if self.should_use_rest_sync(&order, now) {
                self.sync_order(&order.order_id).await;
            }

            // Re-read: the sync (or a WS event) may have changed everything.
            let Some(current) = self.get_order(&order.order_id) else {
                continue;
            };
            if current.status.is_terminal() {
                continue;
            }
            if current.volume > 0.0 && current.filled_volume >= current.volume - FILL_EPSILON {
                let mut orders = self.orders.lock();
                if let Some(o) = orders.get_mut(&order.order_id) {
                    o.status = OrderStatus::Filled;
                    o.is_chasing = false;
                }
                continue;
            }

            if let Err(e) = self.check_limit_chase(&current).await {
                warn!(order_id = %current.order_id, error = %e, "limit chase error");
            }

            // Chase budget exhausted: switch to a market fallback.
            let Some(current) = self.get_order(&order.order_id) else {
                continue;
            };
            if current.retry_count >= MAX_CHASE_ATTEMPTS && current.is_chasing {
                {
                    let mut orders = self.orders.lock();
                    if let Some(o) = orders.get_mut(&current.order_id) {
                        o.is_chasing = false;
                    }
                }
                warn!(
                    market = %current.market,
                    order_id = %current.order_id,
                    attempts = MAX_CHASE_ATTEMPTS,
                    "limit chase exhausted, switching to market fallback"
                );

                if self.cancel(&current.order_id).await {
                    if let Err(e) = self.submit_market_fallback(&current).await {
                        error!(market = %current.market, error = %e, "market fallback failed");
                    }
                }
            }
        }
    }

    fn should_use_rest_sync(&self, order: &ActiveOrder, now: i64) -> bool {
        let ws_fresh = self
            .ws_link
            .as_ref()
            .map(|link| link.is_connected() && now - link.last_message_ms() < WS_STALE_THRESHOLD_MS)
            .unwrap_or(false);

        if !ws_fresh {
            return true;
        }
        if order.status.is_terminal() {
            return false;
        }
        now - order.last_state_sync_ms >= REST_SYNC_INTERVAL_MS
    }

    /// Follow the best same-side book price with cancel-and-replace, on a 5s
    /// cadence per order.
    async fn check_limit_chase(&self, order: &ActiveOrder) -> Result<()> {
        let now = now_ms();
        {
            let mut orders = self.orders.lock();
            let Some(o) = orders.get_mut(&order.order_id) else {
                return Ok(());
            };
            if now - o.last_update_ms < CHASE_INTERVAL_MS {
                return Ok(());
            }
            o.last_update_ms = now;
            if !o.is_chasing || o.retry_count >= MAX_CHASE_ATTEMPTS {
                return Ok(());
            }
        }

        let orderbook = self
            .client
            .get_orderbook(&[order.market.clone()])
            .await
            .context("orderbook fetch failed")?;

        let Some(best_price) = best_book_price(&orderbook, order.side) else {
            return Ok(());
        };

        if (order.price - best_price).abs() <= 1e-6 {
            return Ok(());
        }

        info!(
            order_id = %order.order_id,
            current = order.price,
            best = best_price,
            "limit chase: replacing order at the new best price"
        );

        self.replace_order(order, best_price).await
    }

    /// Cancel-and-resubmit at `new_price`, carrying strategy and exit
    /// parameters forward and bumping the chase retry count.
    async fn replace_order(&self, order: &ActiveOrder, new_price: f64) -> Result<()> {
        let next_retry_count = order.retry_count + 1;

        if !self.cancel(&order.order_id).await {
            anyhow::bail!("chase cancel failed for {}", order.order_id);
        }

        let new_id = self
            .submit(
                &order.market,
                order.side,
                new_price,
                order.volume,
                &order.strategy_name,
                order.exits,
            )
            .await?;

        let mut orders = self.orders.lock();
        if let Some(o) = orders.get_mut(&new_id) {
            o.retry_count = next_retry_count;
            o.last_chase_price = new_price;
        }
        Ok(())
    }

    /// Market fallback after chase exhaustion: notional buy ("price" order of
    /// `price × volume` KRW) or volume sell ("market" order).
    async fn submit_market_fallback(&self, order: &ActiveOrder) -> Result<()> {
        let response = match order.side {
            OrderSide::Buy => {
                let spend_krw = order.volume * order.price;
                anyhow::ensure!(spend_krw > 0.0, "invalid fallback spend amount");
                self.client
                    .place_order(
                        &order.market,
                        order.side.as_wire(),
                        None,
                        Some(&format_decimal(spend_krw)),
                        "price",
                    )
                    .await?
            }
            OrderSide::Sell => {
                self.client
                    .place_order(
                        &order.market,
                        order.side.as_wire(),
                        Some(&format_decimal(order.volume)),
                        None,
                        "market",
                    )
                    .await?
            }
        };

        let order_id = response
            .get("uuid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .with_context(|| format!("fallback response missing uuid: {}", safe_dump(&response)))?;

        let now = now_ms();
        let mut fallback = order.clone();
        fallback.order_id = order_id.clone();
        fallback.retry_count = 0;
        fallback.price = 0.0;
        fallback.is_chasing = false;
        fallback.last_update_ms = now;
        fallback.status = OrderStatus::Submitted;
        fallback.last_state_sync_ms = now;
        fallback.filled_volume = 0.0;

        self.log_lifecycle(update_schema::source::LIVE_FALLBACK, "submitted", &fallback);
        self.insert_order(fallback);

        info!(market = %order.market, order_id = %order_id, "market fallback submitted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lifecycle artifact
    // -------------------------------------------------------------------------

    fn log_lifecycle(&self, source: &str, event: &str, order: &ActiveOrder) {
        let terminal = order.status.is_terminal();

        info!(
            source,
            event,
            order_id = %order.order_id,
            market = %order.market,
            side = %order.side,
            status = %order.status,
            filled = order.filled_volume,
            volume = order.volume,
            terminal,
            "execution lifecycle"
        );

        let update = ExecutionUpdate {
            ts_ms: now_ms(),
            source: source.to_string(),
            event: event.to_string(),
            order_id: order.order_id.clone(),
            market: order.market.clone(),
            side: order.side,
            status: order.status,
            filled_volume: order.filled_volume,
            order_volume: order.volume,
            avg_price: order.price,
            strategy_name: order.strategy_name.clone(),
            terminal,
        };

        let _guard = self.artifact_lock.lock();
        if let Some(parent) = self.artifact_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = format!("{}\n", update.to_jsonl());
        if let Err(e) = append_to_file(&self.artifact_path, &line) {
            warn!(path = %self.artifact_path.display(), error = %e, "execution artifact append failed");
        }
    }
}

fn append_to_file(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}

/// Best same-side resting price from an orderbook payload (array-of-markets
/// or a single object, matching both REST response shapes).
pub fn best_book_price(orderbook: &Value, side: OrderSide) -> Option<f64> {
    let entry = if let Some(items) = orderbook.as_array() {
        items.first()?
    } else {
        orderbook
    };
    let units = entry.get("orderbook_units")?.as_array()?;
    let first = units.first()?;
    let key = match side {
        OrderSide::Buy => "bid_price",
        OrderSide::Sell => "ask_price",
    };
    let price = json_number(first, key);
    (price > 0.0).then_some(price)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> OrderManager {
        let client = Arc::new(UpbitClient::new("ak", "sk"));
        let dir = std::env::temp_dir().join("uptide-order-tests");
        let _ = std::fs::create_dir_all(&dir);
        OrderManager::new(client, None, dir.join("artifact.jsonl"))
    }

    fn test_order(id: &str, market: &str, side: OrderSide, volume: f64) -> ActiveOrder {
        ActiveOrder {
            order_id: id.to_string(),
            market: market.to_string(),
            side,
            price: 100_000.0,
            volume,
            filled_volume: 0.0,
            created_at_ms: 0,
            retry_count: 0,
            strategy_name: "Scalping".to_string(),
            exits: ExitParams::default(),
            is_chasing: true,
            last_chase_price: 100_000.0,
            last_update_ms: 0,
            status: OrderStatus::Submitted,
            last_state_sync_ms: 0,
        }
    }

    #[test]
    fn ws_done_event_fills_and_terminates() {
        let manager = test_manager();
        manager.insert_order(test_order("o1", "KRW-BTC", OrderSide::Buy, 0.01));

        manager.handle_ws_event(&serde_json::json!({
            "type": "myOrder",
            "uuid": "o1",
            "state": "done",
            "executed_volume": "0.01",
            "remaining_volume": "0",
        }));

        let order = manager.get_order("o1").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled_volume - 0.01).abs() < 1e-12);
        assert!(!order.is_chasing);
    }

    #[test]
    fn non_my_order_ws_types_are_ignored() {
        let manager = test_manager();
        manager.insert_order(test_order("o1", "KRW-BTC", OrderSide::Buy, 0.01));

        manager.handle_ws_event(&serde_json::json!({
            "type": "ticker",
            "uuid": "o1",
            "state": "done",
        }));

        assert_eq!(manager.get_order("o1").unwrap().status, OrderStatus::Submitted);
    }

    #[test]
    fn terminal_status_latches_against_later_events() {
        let manager = test_manager();
        manager.insert_order(test_order("o1", "KRW-BTC", OrderSide::Buy, 0.01));

        manager.handle_ws_event(&serde_json::json!({
            "uuid": "o1", "state": "done", "executed_volume": "0.01",
        }));
        // A stale cancel arriving after the fill must not revert the status.
        manager.handle_ws_event(&serde_json::json!({
            "uuid": "o1", "state": "cancel", "executed_volume": "0.01",
        }));

        assert_eq!(manager.get_order("o1").unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn drain_returns_full_fills_and_partial_cancels_only() {
        let manager = test_manager();

        let mut filled = test_order("full", "KRW-BTC", OrderSide::Buy, 0.01);
        filled.filled_volume = 0.01;
        filled.status = OrderStatus::Filled;
        manager.insert_order(filled);

        let mut partial_cancel = test_order("partial", "KRW-ETH", OrderSide::Sell, 0.02);
        partial_cancel.filled_volume = 0.008;
        partial_cancel.status = OrderStatus::Cancelled;
        manager.insert_order(partial_cancel);

        let mut empty_cancel = test_order("empty", "KRW-XRP", OrderSide::Buy, 5.0);
        empty_cancel.status = OrderStatus::Cancelled;
        manager.insert_order(empty_cancel);

        let live = test_order("live", "KRW-SOL", OrderSide::Buy, 1.0);
        manager.insert_order(live);

        let mut drained = manager.drain_filled_orders();
        drained.sort_by(|a, b| a.order_id.cmp(&b.order_id));

        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].order_id, "full");
        assert_eq!(drained[0].status, OrderStatus::Filled);
        assert_eq!(drained[1].order_id, "partial");
        assert_eq!(drained[1].status, OrderStatus::Cancelled);
        assert!((drained[1].filled_volume - 0.008).abs() < 1e-12);

        // The zero-fill cancel disappeared; the live order is still tracked.
        assert_eq!(manager.active_order_count(), 1);
        assert!(manager.has_active_order("KRW-SOL"));
    }

    #[test]
    fn partial_then_cancel_sequence_matches_ledger_expectations() {
        let manager = test_manager();
        manager.insert_order(test_order("o1", "KRW-BTC", OrderSide::Sell, 0.02));

        manager.handle_ws_event(&serde_json::json!({
            "uuid": "o1", "state": "trade", "executed_volume": "0.008",
        }));
        assert_eq!(
            manager.get_order("o1").unwrap().status,
            OrderStatus::PartiallyFilled
        );

        manager.handle_ws_event(&serde_json::json!({
            "uuid": "o1", "state": "cancel",
            "executed_volume": "0.008", "remaining_volume": "0.012",
        }));

        let drained = manager.drain_filled_orders();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].status, OrderStatus::Cancelled);
        assert!((drained[0].filled_volume - 0.008).abs() < 1e-12);
        assert_eq!(manager.active_order_count(), 0);
    }

    #[test]
    fn rest_sync_policy() {
        let manager = test_manager();
        let mut order = test_order("o1", "KRW-BTC", OrderSide::Buy, 0.01);
        order.last_state_sync_ms = now_ms();

        // No WS link at all: always sync over REST.
        assert!(manager.should_use_rest_sync(&order, now_ms()));

        let link = MyOrderLink::new();
        let manager = OrderManager::new(
            Arc::new(UpbitClient::new("ak", "sk")),
            Some(link.clone()),
            std::env::temp_dir().join("uptide-order-tests/artifact2.jsonl"),
        );

        // Link exists but has never connected: REST.
        assert!(manager.should_use_rest_sync(&order, now_ms()));
    }

    #[test]
    fn avg_price_replaces_limit_price() {
        let manager = test_manager();
        manager.insert_order(test_order("o1", "KRW-BTC", OrderSide::Buy, 0.01));

        manager.apply_exchange_order_state(
            &serde_json::json!({
                "uuid": "o1", "state": "trade",
                "executed_volume": "0.005", "avg_price": "99950.0",
            }),
            false,
        );

        let order = manager.get_order("o1").unwrap();
        assert!((order.price - 99_950.0).abs() < 1e-9);
    }

    #[test]
    fn best_book_price_reads_both_shapes() {
        let array_shape = serde_json::json!([{
            "market": "KRW-BTC",
            "orderbook_units": [
                { "bid_price": 99_990.0, "ask_price": 100_010.0 }
            ]
        }]);
        assert_eq!(best_book_price(&array_shape, OrderSide::Buy), Some(99_990.0));
        assert_eq!(best_book_price(&array_shape, OrderSide::Sell), Some(100_010.0));

        let object_shape = serde_json::json!({
            "orderbook_units": [
                { "bid_price": "50.0", "ask_price": "51.0" }
            ]
        });
        assert_eq!(best_book_price(&object_shape, OrderSide::Buy), Some(50.0));

        let empty = serde_json::json!({ "orderbook_units": [] });
        assert_eq!(best_book_price(&empty, OrderSide::Buy), None);
    }
}
