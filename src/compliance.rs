// =============================================================================
// Compliance Adapter — exchange-rule gate between risk admission and execution
// =============================================================================
//
// Entry validation order:
//   1. request / position-size sanity
//   2. no-trade degrade window
//   3. risk manager admission
//   4. (LIVE only) per-market "chance" constraints: market active, side and
//      limit type supported, minimum notional
//   5. (LIVE only) tick-size alignment
// On any compliance failure the adapter degrades itself; a clean pass decays
// the violation counter.
//
// Degrade backoff: base × 2^min(violations−1, 5), capped at 5 minutes.
// `no_trade_until` only ever extends — a weaker trigger never shortens an
// active window — and clears lazily on the first check after expiry.
//
// Caches: chance payloads for 30 s with a 3-minute stale-grace fallback on
// network failure; instrument tick sizes for 10 minutes with the local KRW
// ladder as the fallback source.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::risk::RiskManager;
use crate::strategy::Signal;
use crate::tick_size;
use crate::types::{json_number, OrderSide, TradingMode};
use crate::upbit::client::{HttpResponse, UpbitClient};
use crate::upbit::rate_limiter::parse_remaining_req;

const CHANCE_CACHE_TTL: Duration = Duration::from_secs(30);
const CHANCE_STALE_GRACE: Duration = Duration::from_secs(180);
const INSTRUMENT_CACHE_TTL: Duration = Duration::from_secs(600);
const MAX_NO_TRADE_DURATION: Duration = Duration::from_secs(300);
/// `Remaining-Req: sec <= 1` counts as rate-limit pressure.
const REMAINING_LOW_WATERMARK: u32 = 1;

/// Result of a pre-trade check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreTradeCheck {
    pub ok: bool,
    pub reason: String,
}

impl PreTradeCheck {
    fn pass() -> Self {
        Self {
            ok: true,
            reason: "ok".to_string(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }
}

/// The order the engine wants to place.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub market: String,
    pub side: OrderSide,
    pub price: f64,
    pub volume: f64,
}

struct ChanceCacheEntry {
    payload: Value,
    fetched_at: Instant,
}

struct InstrumentCacheEntry {
    tick_size: f64,
    fetched_at: Instant,
}

struct GuardState {
    chance_cache: HashMap<String, ChanceCacheEntry>,
    instrument_cache: HashMap<String, InstrumentCacheEntry>,
    remaining_req: HashMap<String, u32>,
    no_trade_until: Option<Instant>,
    no_trade_reason: String,
    consecutive_violations: u32,
}

pub struct ComplianceAdapter {
    client: Option<Arc<UpbitClient>>,
    risk: Arc<RiskManager>,
    mode: TradingMode,
    state: Mutex<GuardState>,
}

impl ComplianceAdapter {
    pub fn new(client: Option<Arc<UpbitClient>>, risk: Arc<RiskManager>, mode: TradingMode) -> Self {
        Self {
            client,
            risk,
            mode,
            state: Mutex::new(GuardState {
                chance_cache: HashMap::new(),
                instrument_cache: HashMap::new(),
                remaining_req: HashMap::new(),
                no_trade_until: None,
                no_trade_reason: String::new(),
                consecutive_violations: 0,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Entry / exit validation
    // -------------------------------------------------------------------------

    pub async fn validate_entry(&self, request: &ExecutionRequest, signal: &Signal) -> PreTradeCheck {
        if request.market.is_empty() || request.price <= 0.0 || request.volume <= 0.0 {
            return PreTradeCheck::fail("invalid_request");
        }
        if signal.position_size <= 0.0 {
            return PreTradeCheck::fail("invalid_position_size");
        }

        if let Some(reason) = self.no_trade_reason() {
            return PreTradeCheck::fail(format!("no_trade_degrade:{reason}"));
        }

        if !self.risk.can_enter_position(
            &request.market,
            request.price,
            signal.position_size,
            &signal.strategy_name,
        ) {
            return PreTradeCheck::fail("risk_rejected");
        }

        if self.mode != TradingMode::Live {
            return PreTradeCheck::pass();
        }
        let Some(client) = &self.client else {
            return PreTradeCheck::fail("http_client_unavailable");
        };

        let chance = match self.chance_cached_or_fetch(client, &request.market).await {
            Ok(payload) => payload,
            Err(reason) => return PreTradeCheck::fail(reason),
        };

        if let Err(reason) = validate_chance_constraints(request, &chance) {
            self.trigger_no_trade_degrade("chance_violation", Duration::from_secs(15));
            return PreTradeCheck::fail(reason);
        }

        match self.instrument_tick_size(client, &request.market, request.price).await {
            Ok(tick) => {
                if !tick_size::is_aligned(request.price, tick) {
                    self.trigger_no_trade_degrade("tick_size_violation", Duration::from_secs(15));
                    return PreTradeCheck::fail("invalid_tick_size");
                }
            }
            Err(reason) => return PreTradeCheck::fail(reason),
        }

        // Clean pass: decay the violation counter.
        let mut state = self.state.lock();
        if state.consecutive_violations > 0 {
            state.consecutive_violations -= 1;
        }

        PreTradeCheck::pass()
    }

    /// Exit-side checks are sanity only; exits are never blocked by degrade.
    pub fn validate_exit(&self, market: &str, quantity: f64, exit_price: f64) -> PreTradeCheck {
        if market.is_empty() || exit_price <= 0.0 {
            return PreTradeCheck::fail("invalid_exit_request");
        }
        if quantity <= 0.0 {
            return PreTradeCheck::fail("empty_position");
        }
        PreTradeCheck::pass()
    }

    // -------------------------------------------------------------------------
    // Degrade state
    // -------------------------------------------------------------------------

    /// Active degrade reason, if inside a no-trade window. Expired windows
    /// clear lazily here.
    pub fn no_trade_reason(&self) -> Option<String> {
        let mut state = self.state.lock();
        match state.no_trade_until {
            Some(until) if Instant::now() < until => Some(if state.no_trade_reason.is_empty() {
                "compliance_guard".to_string()
            } else {
                state.no_trade_reason.clone()
            }),
            Some(_) => {
                state.no_trade_until = None;
                state.no_trade_reason.clear();
                None
            }
            None => None,
        }
    }

    pub fn is_no_trade_degraded(&self) -> bool {
        self.no_trade_reason().is_some()
    }

    /// Install (or extend) a no-trade window with exponential backoff.
    pub fn trigger_no_trade_degrade(&self, reason: &str, base_duration: Duration) {
        let mut state = self.state.lock();
        state.consecutive_violations += 1;

        let duration = degrade_duration(base_duration, state.consecutive_violations);
        let candidate = Instant::now() + duration;
        let extend = match state.no_trade_until {
            Some(existing) => candidate > existing,
            None => true,
        };
        if extend {
            state.no_trade_until = Some(candidate);
        }
        state.no_trade_reason = reason.to_string();

        warn!(
            reason,
            duration_secs = duration.as_secs(),
            violations = state.consecutive_violations,
            "compliance no-trade degrade activated"
        );
    }

    #[cfg(test)]
    fn violations(&self) -> u32 {
        self.state.lock().consecutive_violations
    }

    // -------------------------------------------------------------------------
    // Rate-limit observation
    // -------------------------------------------------------------------------

    /// Inspect a response's `Remaining-Req` header and status for rate-limit
    /// pressure.
    pub fn observe_response(&self, response: &HttpResponse, source_tag: &str) {
        if let Some(header) = &response.remaining_req {
            let (group, sec) = parse_remaining_req(header);
            if let (Some(group), Some(sec)) = (group, sec) {
                self.state.lock().remaining_req.insert(group.clone(), sec);

                if sec <= REMAINING_LOW_WATERMARK {
                    warn!(
                        source = source_tag,
                        group = %group,
                        sec,
                        "compliance rate-limit pressure detected"
                    );
                    self.trigger_no_trade_degrade(
                        &format!("remaining_req_low:{group}"),
                        Duration::from_secs(3),
                    );
                }
            }
        }

        match response.status {
            429 => self.trigger_no_trade_degrade("http_429", Duration::from_secs(10)),
            418 => self.trigger_no_trade_degrade("http_418", Duration::from_secs(60)),
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Caches
    // -------------------------------------------------------------------------

    async fn chance_cached_or_fetch(
        &self,
        client: &Arc<UpbitClient>,
        market: &str,
    ) -> Result<Value, String> {
        let stale: Option<(Value, Instant)> = {
            let state = self.state.lock();
            match state.chance_cache.get(market) {
                Some(entry) if entry.fetched_at.elapsed() <= CHANCE_CACHE_TTL => {
                    return Ok(entry.payload.clone());
                }
                Some(entry) => Some((entry.payload.clone(), entry.fetched_at)),
                None => None,
            }
        };

        let response = match client.get_order_chance(market).await {
            Ok(response) => response,
            Err(e) => {
                if let Some((payload, fetched_at)) = &stale {
                    if fetched_at.elapsed() <= CHANCE_STALE_GRACE {
                        info!(market, error = %e, "chance fetch failed; serving stale cache");
                        return Ok(payload.clone());
                    }
                }
                self.trigger_no_trade_degrade("chance_fetch_error", Duration::from_secs(20));
                return Err(format!("chance_fetch_error:{e}"));
            }
        };

        self.observe_response(&response, "orders/chance");

        if !response.is_success() {
            if let Some((payload, fetched_at)) = &stale {
                if fetched_at.elapsed() <= CHANCE_STALE_GRACE {
                    info!(market, status = response.status, "chance HTTP error; serving stale cache");
                    return Ok(payload.clone());
                }
            }
            self.trigger_no_trade_degrade("chance_http_error", Duration::from_secs(20));
            return Err("chance_http_error".to_string());
        }

        match response.json() {
            Ok(payload) => {
                let mut state = self.state.lock();
                state.chance_cache.insert(
                    market.to_string(),
                    ChanceCacheEntry {
                        payload: payload.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(payload)
            }
            Err(e) => {
                self.trigger_no_trade_degrade("chance_parse_error", Duration::from_secs(20));
                Err(format!("chance_parse_error:{e}"))
            }
        }
    }

    async fn instrument_tick_size(
        &self,
        client: &Arc<UpbitClient>,
        market: &str,
        reference_price: f64,
    ) -> Result<f64, String> {
        {
            let state = self.state.lock();
            if let Some(entry) = state.instrument_cache.get(market) {
                if entry.fetched_at.elapsed() <= INSTRUMENT_CACHE_TTL {
                    return Ok(entry.tick_size);
                }
            }
        }

        let fallback = || {
            let tick = tick_size::tick_size_for(reference_price);
            if tick > 0.0 {
                Ok(tick)
            } else {
                Err("instrument_tick_missing".to_string())
            }
        };

        let response = match client.get_instruments(market).await {
            Ok(response) => response,
            Err(_) => {
                let tick = fallback()?;
                self.cache_tick(market, tick);
                return Ok(tick);
            }
        };

        self.observe_response(&response, "orderbook/instruments");

        if !response.is_success() {
            let tick = fallback()?;
            self.cache_tick(market, tick);
            return Ok(tick);
        }

        let tick = response
            .json()
            .ok()
            .map(|payload| extract_tick_size(&payload, market))
            .filter(|tick| *tick > 0.0)
            .map_or_else(fallback, Ok)?;

        self.cache_tick(market, tick);
        Ok(tick)
    }

    fn cache_tick(&self, market: &str, tick: f64) {
        self.state.lock().instrument_cache.insert(
            market.to_string(),
            InstrumentCacheEntry {
                tick_size: tick,
                fetched_at: Instant::now(),
            },
        );
    }
}

/// Backoff duration for the nth consecutive violation (1-based):
/// `base × 2^min(n−1, 5)` capped at 5 minutes.
pub fn degrade_duration(base: Duration, consecutive_violations: u32) -> Duration {
    let exponent = consecutive_violations.saturating_sub(1).min(5);
    let duration = base * 2u32.pow(exponent);
    duration.min(MAX_NO_TRADE_DURATION)
}

/// Check the "chance" payload's constraints for this request.
pub fn validate_chance_constraints(request: &ExecutionRequest, chance: &Value) -> Result<(), String> {
    if !chance.is_object() {
        return Err("chance_invalid_payload".to_string());
    }
    if chance.get("error").is_some() {
        return Err("chance_error_payload".to_string());
    }
    let Some(market) = chance.get("market").filter(|m| m.is_object()) else {
        return Err("chance_missing_market".to_string());
    };

    if let Some(state) = market.get("state").and_then(|s| s.as_str()) {
        if !state.is_empty() && !state.eq_ignore_ascii_case("active") {
            return Err("market_not_active".to_string());
        }
    }

    let side_name = request.side.as_wire();
    if let Some(sides) = market.get("order_sides") {
        if !array_contains(sides, side_name) {
            return Err("side_not_supported".to_string());
        }
    }

    if let Some(types) = market.get("order_types") {
        if !array_contains(types, "limit") {
            return Err("limit_order_not_supported".to_string());
        }
    }

    let side_types_key = match request.side {
        OrderSide::Buy => "bid_types",
        OrderSide::Sell => "ask_types",
    };
    if let Some(types) = market.get(side_types_key) {
        if !array_contains(types, "limit") {
            return Err("side_limit_order_not_supported".to_string());
        }
    }

    let side_key = request.side.as_wire();
    let min_total = market
        .get(side_key)
        .filter(|v| v.is_object())
        .map(|v| json_number(v, "min_total"))
        .unwrap_or(0.0);
    if min_total > 0.0 {
        let notional = request.price * request.volume;
        if notional + 1e-9 < min_total {
            return Err("below_min_total".to_string());
        }
    }

    Ok(())
}

fn array_contains(node: &Value, expected: &str) -> bool {
    node.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .any(|s| s.eq_ignore_ascii_case(expected))
        })
        .unwrap_or(false)
}

/// Pull a tick size out of the instruments payload, trying the common key
/// spellings and both object/array shapes.
pub fn extract_tick_size(payload: &Value, market: &str) -> f64 {
    fn from_object(obj: &Value) -> f64 {
        for key in ["tick_size", "tickSize", "price_unit"] {
            let tick = json_number(obj, key);
            if tick > 0.0 {
                return tick;
            }
        }
        0.0
    }

    fn pick_market_item<'a>(items: &'a [Value], market: &str) -> Option<&'a Value> {
        items
            .iter()
            .find(|item| {
                item.get("market").and_then(|m| m.as_str()) == Some(market)
            })
            .or_else(|| items.first())
    }

    if payload.is_object() {
        let tick = from_object(payload);
        if tick > 0.0 {
            return tick;
        }
        if let Some(data) = payload.get("data").and_then(|d| d.as_array()) {
            if let Some(item) = pick_market_item(data, market) {
                return from_object(item);
            }
        }
        return 0.0;
    }

    if let Some(items) = payload.as_array() {
        if let Some(item) = pick_market_item(items, market) {
            return from_object(item);
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_config::EngineConfig;

    fn adapter(mode: TradingMode) -> ComplianceAdapter {
        let mut cfg = EngineConfig::default();
        cfg.reentry_cooldown_seconds = 0;
        let risk = Arc::new(RiskManager::new(&cfg));
        ComplianceAdapter::new(None, risk, mode)
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            market: "KRW-BTC".to_string(),
            side: OrderSide::Buy,
            price: 100_000.0,
            volume: 0.01,
        }
    }

    fn signal() -> Signal {
        let mut signal = Signal::none("KRW-BTC", "Scalping");
        signal.position_size = 0.05;
        signal
    }

    #[test]
    fn degrade_duration_doubles_then_caps() {
        let base = Duration::from_secs(15);
        assert_eq!(degrade_duration(base, 1), Duration::from_secs(15));
        assert_eq!(degrade_duration(base, 2), Duration::from_secs(30));
        assert_eq!(degrade_duration(base, 3), Duration::from_secs(60));
        assert_eq!(degrade_duration(base, 5), Duration::from_secs(240));
        // 6th violation hits the 5-minute cap...
        assert_eq!(degrade_duration(base, 6), Duration::from_secs(300));
        // ...and a 7th does not extend past it.
        assert_eq!(degrade_duration(base, 7), Duration::from_secs(300));
    }

    #[test]
    fn degrade_window_only_extends() {
        let adapter = adapter(TradingMode::Paper);
        adapter.trigger_no_trade_degrade("tick_size_violation", Duration::from_secs(60));
        assert!(adapter.is_no_trade_degraded());

        let until_before = adapter.state.lock().no_trade_until.unwrap();
        // A weaker trigger must not shrink the window.
        adapter.trigger_no_trade_degrade("remaining_req_low:ticker", Duration::from_millis(1));
        let until_after = adapter.state.lock().no_trade_until.unwrap();
        assert!(until_after >= until_before);
        // The reason reflects the most recent trigger.
        assert_eq!(
            adapter.no_trade_reason().unwrap(),
            "remaining_req_low:ticker"
        );
    }

    #[tokio::test]
    async fn degraded_adapter_rejects_with_prefixed_reason() {
        let adapter = adapter(TradingMode::Paper);
        adapter.trigger_no_trade_degrade("tick_size_violation", Duration::from_secs(60));

        let check = adapter.validate_entry(&request(), &signal()).await;
        assert!(!check.ok);
        assert!(check.reason.starts_with("no_trade_degrade:"));
        assert!(check.reason.ends_with("tick_size_violation"));
    }

    #[tokio::test]
    async fn paper_mode_is_pass_through_after_risk() {
        let adapter = adapter(TradingMode::Paper);
        let check = adapter.validate_entry(&request(), &signal()).await;
        assert!(check.ok, "unexpected reject: {}", check.reason);
    }

    #[tokio::test]
    async fn sanity_rejections() {
        let adapter = adapter(TradingMode::Paper);

        let mut bad = request();
        bad.price = 0.0;
        assert_eq!(
            adapter.validate_entry(&bad, &signal()).await.reason,
            "invalid_request"
        );

        let mut zero_size = signal();
        zero_size.position_size = 0.0;
        assert_eq!(
            adapter.validate_entry(&request(), &zero_size).await.reason,
            "invalid_position_size"
        );
    }

    #[test]
    fn exit_validation_sanity() {
        let adapter = adapter(TradingMode::Paper);
        assert!(adapter.validate_exit("KRW-BTC", 0.01, 100_000.0).ok);
        assert_eq!(
            adapter.validate_exit("KRW-BTC", 0.0, 100_000.0).reason,
            "empty_position"
        );
        assert_eq!(
            adapter.validate_exit("", 0.01, 100_000.0).reason,
            "invalid_exit_request"
        );
    }

    #[test]
    fn chance_constraints_accept_a_normal_market() {
        // request() is 0.01 × 100_000 = 1_000 KRW notional.
        let chance = serde_json::json!({
            "market": {
                "state": "active",
                "order_sides": ["ask", "bid"],
                "order_types": ["limit"],
                "bid_types": ["limit", "price"],
                "bid": { "min_total": "500" },
            }
        });
        assert!(validate_chance_constraints(&request(), &chance).is_ok());
    }

    #[test]
    fn chance_constraints_reject_each_violation() {
        let base = serde_json::json!({
            "market": {
                "state": "active",
                "order_sides": ["ask", "bid"],
                "order_types": ["limit"],
                "bid_types": ["limit"],
                "bid": { "min_total": "5000" },
            }
        });

        let mut inactive = base.clone();
        inactive["market"]["state"] = "delisted".into();
        assert_eq!(
            validate_chance_constraints(&request(), &inactive).unwrap_err(),
            "market_not_active"
        );

        let mut ask_only = base.clone();
        ask_only["market"]["order_sides"] = serde_json::json!(["ask"]);
        assert_eq!(
            validate_chance_constraints(&request(), &ask_only).unwrap_err(),
            "side_not_supported"
        );

        let mut no_limit = base.clone();
        no_limit["market"]["order_types"] = serde_json::json!(["market"]);
        assert_eq!(
            validate_chance_constraints(&request(), &no_limit).unwrap_err(),
            "limit_order_not_supported"
        );

        let mut bid_market_only = base.clone();
        bid_market_only["market"]["bid_types"] = serde_json::json!(["price"]);
        assert_eq!(
            validate_chance_constraints(&request(), &bid_market_only).unwrap_err(),
            "side_limit_order_not_supported"
        );

        // 0.01 × 100_000 = 1_000 KRW < 5_000 min_total.
        let mut small = request();
        small.volume = 0.01;
        let mut high_min = base.clone();
        high_min["market"]["bid"]["min_total"] = "5000".into();
        assert_eq!(
            validate_chance_constraints(&small, &high_min).unwrap_err(),
            "below_min_total"
        );

        assert_eq!(
            validate_chance_constraints(&request(), &serde_json::json!({"error": {}})).unwrap_err(),
            "chance_error_payload"
        );
        assert_eq!(
            validate_chance_constraints(&request(), &serde_json::json!({})).unwrap_err(),
            "chance_missing_market"
        );
    }

    #[test]
    fn tick_extraction_shapes() {
        let flat = serde_json::json!({ "tick_size": "100" });
        assert_eq!(extract_tick_size(&flat, "KRW-BTC"), 100.0);

        let arr = serde_json::json!([
            { "market": "KRW-ETH", "tick_size": 50.0 },
            { "market": "KRW-BTC", "price_unit": 100.0 },
        ]);
        assert_eq!(extract_tick_size(&arr, "KRW-BTC"), 100.0);
        // Unknown market falls back to the first entry.
        assert_eq!(extract_tick_size(&arr, "KRW-XRP"), 50.0);

        let nested = serde_json::json!({ "data": [ { "market": "KRW-BTC", "tickSize": 10.0 } ] });
        assert_eq!(extract_tick_size(&nested, "KRW-BTC"), 10.0);

        assert_eq!(extract_tick_size(&serde_json::json!(null), "KRW-BTC"), 0.0);
    }

    #[test]
    fn remaining_req_low_watermark_degrades() {
        let adapter = adapter(TradingMode::Live);
        let response = HttpResponse {
            status: 200,
            body: "{}".to_string(),
            remaining_req: Some("group=order; min=10; sec=1".to_string()),
        };
        adapter.observe_response(&response, "test");
        assert!(adapter.is_no_trade_degraded());
        assert_eq!(adapter.no_trade_reason().unwrap(), "remaining_req_low:order");
    }

    #[test]
    fn healthy_header_does_not_degrade() {
        let adapter = adapter(TradingMode::Live);
        let response = HttpResponse {
            status: 200,
            body: "{}".to_string(),
            remaining_req: Some("group=order; min=10; sec=7".to_string()),
        };
        adapter.observe_response(&response, "test");
        assert!(!adapter.is_no_trade_degraded());
    }

    #[test]
    fn http_429_and_418_degrade() {
        let adapter = adapter(TradingMode::Live);
        adapter.observe_response(
            &HttpResponse { status: 429, body: String::new(), remaining_req: None },
            "test",
        );
        assert_eq!(adapter.no_trade_reason().unwrap(), "http_429");
        assert_eq!(adapter.violations(), 1);

        adapter.observe_response(
            &HttpResponse { status: 418, body: String::new(), remaining_req: None },
            "test",
        );
        assert_eq!(adapter.no_trade_reason().unwrap(), "http_418");
        assert_eq!(adapter.violations(), 2);
    }
}
