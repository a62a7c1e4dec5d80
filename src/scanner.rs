// =============================================================================
// Market Scanner — KRW universe scan into per-coin metrics
// =============================================================================
//
// One scan pass:
//   1. List markets, keep the KRW- universe.
//   2. Batch-fetch tickers (100 per call) and drop thin markets
//      (24h traded value below `min_volume_krw`).
//   3. Batch-fetch orderbooks (10 per call) for the survivors.
//   4. Fetch 5-minute candles per survivor through a 60s rolling cache.
//   5. Score each market and keep the top 20 by composite score.
//
// All quotation calls go through the shared client, so the rate limiter and
// the 100 ms inter-batch gap keep the scan inside exchange quotas.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::indicators::{self, Candle};
use crate::types::json_number;
use crate::upbit::client::UpbitClient;

/// Survivors are ranked and truncated to this many markets.
const TOP_MARKETS: usize = 20;
/// Candidates fetched in depth (orderbook + candles) per scan.
const MAX_CANDIDATES: usize = 40;
const CANDLE_UNIT: u32 = 5;
const CANDLE_COUNT: u32 = 100;
const CANDLE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Top-of-book summary captured at scan time.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderbookSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    pub total_bid_size: f64,
    pub total_ask_size: f64,
}

/// Per-market scan output consumed by the strategy plane.
#[derive(Debug, Clone, Default)]
pub struct CoinMetrics {
    pub market: String,
    pub current_price: f64,
    /// 24h traded value in KRW.
    pub volume_24h: f64,
    /// Last candle volume relative to the trailing average.
    pub volume_surge_ratio: f64,
    pub price_change_rate: f64,
    /// RSI-based momentum in [0, 100].
    pub price_momentum: f64,
    /// Bid/ask depth imbalance in [-1, 1].
    pub order_book_imbalance: f64,
    /// ATR as a fraction of price.
    pub volatility: f64,
    pub liquidity_score: f64,
    pub composite_score: f64,
    /// Primary (5-minute) candle series.
    pub candles: Vec<Candle>,
    /// Candles keyed by timeframe label for strategies that want more than
    /// the primary series.
    pub candles_by_tf: HashMap<String, Vec<Candle>>,
    pub orderbook_units: Value,
    pub orderbook_snapshot: OrderbookSnapshot,
}

struct CandleCacheEntry {
    candles: Vec<Candle>,
    fetched_at: Instant,
}

pub struct MarketScanner {
    client: Arc<UpbitClient>,
    min_volume_krw: f64,
    candle_cache: Mutex<HashMap<String, CandleCacheEntry>>,
}

impl MarketScanner {
    pub fn new(client: Arc<UpbitClient>, min_volume_krw: f64) -> Self {
        Self {
            client,
            min_volume_krw,
            candle_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Full scan pass; returns the top markets by composite score.
    pub async fn scan_markets(&self) -> Result<Vec<CoinMetrics>> {
        let markets = self.krw_markets().await?;
        if markets.is_empty() {
            warn!("no KRW markets returned by the exchange");
            return Ok(Vec::new());
        }

        let tickers = self.client.get_tickers_batched(&markets).await?;

        // Volume filter first: depth fetches only for markets worth scoring.
        let mut candidates: Vec<CoinMetrics> = tickers
            .iter()
            .filter_map(|t| {
                let market = t.get("market")?.as_str()?.to_string();
                let metrics = CoinMetrics {
                    current_price: json_number(t, "trade_price"),
                    volume_24h: json_number(t, "acc_trade_price_24h"),
                    price_change_rate: json_number(t, "signed_change_rate") * 100.0,
                    market,
                    ..Default::default()
                };
                (metrics.volume_24h >= self.min_volume_krw && metrics.current_price > 0.0)
                    .then_some(metrics)
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.volume_24h
                .partial_cmp(&a.volume_24h)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(MAX_CANDIDATES);

        if candidates.is_empty() {
            info!(min_volume_krw = self.min_volume_krw, "scan found no liquid markets");
            return Ok(Vec::new());
        }

        let candidate_names: Vec<String> = candidates.iter().map(|c| c.market.clone()).collect();
        let orderbooks = self.client.get_orderbooks_batched(&candidate_names).await?;
        let orderbooks_by_market: HashMap<String, &Value> = orderbooks
            .iter()
            .filter_map(|ob| Some((ob.get("market")?.as_str()?.to_string(), ob)))
            .collect();

        for metrics in &mut candidates {
            if let Some(orderbook) = orderbooks_by_market.get(&metrics.market) {
                let units = orderbook
                    .get("orderbook_units")
                    .cloned()
                    .unwrap_or(Value::Null);
                metrics.order_book_imbalance = orderbook_imbalance(&units);
                metrics.liquidity_score = liquidity_score(&units, metrics.current_price);
                metrics.orderbook_snapshot = orderbook_snapshot(&units);
                metrics.orderbook_units = units;
            }

            metrics.candles = self.candles_cached(&metrics.market).await;
            metrics
                .candles_by_tf
                .insert(format!("{CANDLE_UNIT}m"), metrics.candles.clone());
            let closes = indicators::closes(&metrics.candles);

            metrics.volume_surge_ratio = volume_surge(&metrics.candles);
            metrics.price_momentum = indicators::rsi(&closes, 14).unwrap_or(50.0);
            metrics.volatility = indicators::atr(&metrics.candles, 14)
                .map(|atr| atr / metrics.current_price.max(1e-9))
                .unwrap_or(0.0);
            metrics.composite_score = composite_score(metrics);
        }

        candidates.sort_by(|a, b| {
            b.composite_score
                .partial_cmp(&a.composite_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(TOP_MARKETS);

        info!(
            scanned = candidate_names.len(),
            kept = candidates.len(),
            "market scan complete"
        );
        Ok(candidates)
    }

    async fn krw_markets(&self) -> Result<Vec<String>> {
        let all = self.client.get_markets().await?;
        let markets = all
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m.get("market")?.as_str())
                    .filter(|name| name.starts_with("KRW-"))
                    .map(|name| name.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(markets)
    }

    /// 5-minute candles through the rolling cache (time-ascending).
    pub async fn candles_cached(&self, market: &str) -> Vec<Candle> {
        {
            let cache = self.candle_cache.lock();
            if let Some(entry) = cache.get(market) {
                if entry.fetched_at.elapsed() < CANDLE_CACHE_TTL {
                    return entry.candles.clone();
                }
            }
        }

        match self
            .client
            .get_minute_candles(market, CANDLE_UNIT, CANDLE_COUNT)
            .await
        {
            Ok(payload) => {
                let candles = parse_candles(&payload);
                let mut cache = self.candle_cache.lock();
                cache.insert(
                    market.to_string(),
                    CandleCacheEntry {
                        candles: candles.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                candles
            }
            Err(e) => {
                debug!(market, error = %e, "candle fetch failed; serving stale cache if any");
                let cache = self.candle_cache.lock();
                cache
                    .get(market)
                    .map(|entry| entry.candles.clone())
                    .unwrap_or_default()
            }
        }
    }
}

/// Upbit candle payloads arrive newest-first; convert to ascending [`Candle`]s.
pub fn parse_candles(payload: &Value) -> Vec<Candle> {
    let Some(items) = payload.as_array() else {
        return Vec::new();
    };

    let mut candles: Vec<Candle> = items
        .iter()
        .map(|c| {
            Candle::new(
                c.get("timestamp").and_then(|t| t.as_i64()).unwrap_or(0),
                json_number(c, "opening_price"),
                json_number(c, "high_price"),
                json_number(c, "low_price"),
                json_number(c, "trade_price"),
                json_number(c, "candle_acc_trade_volume"),
            )
        })
        .filter(|c| c.close > 0.0)
        .collect();

    candles.reverse();
    candles
}

/// Last closed candle's volume relative to the trailing 20-candle average.
pub fn volume_surge(candles: &[Candle]) -> f64 {
    if candles.len() < 21 {
        return 1.0;
    }
    let last = candles[candles.len() - 1].volume;
    let window = &candles[candles.len() - 21..candles.len() - 1];
    let avg = window.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64;
    if avg <= 0.0 {
        return 1.0;
    }
    last / avg
}

/// Depth imbalance over the visible book: (Σbid − Σask) / (Σbid + Σask).
pub fn orderbook_imbalance(units: &Value) -> f64 {
    let Some(items) = units.as_array() else {
        return 0.0;
    };
    let mut bid_size = 0.0;
    let mut ask_size = 0.0;
    for unit in items {
        bid_size += json_number(unit, "bid_size");
        ask_size += json_number(unit, "ask_size");
    }
    let total = bid_size + ask_size;
    if total <= 0.0 {
        return 0.0;
    }
    (bid_size - ask_size) / total
}

/// Best bid/ask and total visible depth from the orderbook units.
pub fn orderbook_snapshot(units: &Value) -> OrderbookSnapshot {
    let mut snapshot = OrderbookSnapshot::default();
    let Some(items) = units.as_array() else {
        return snapshot;
    };
    if let Some(first) = items.first() {
        snapshot.best_bid = json_number(first, "bid_price");
        snapshot.best_ask = json_number(first, "ask_price");
    }
    for unit in items {
        snapshot.total_bid_size += json_number(unit, "bid_size");
        snapshot.total_ask_size += json_number(unit, "ask_size");
    }
    snapshot
}

/// Liquidity in [0, 100]: notional depth of the visible book, log-scaled so
/// one thin market does not dominate the composite.
pub fn liquidity_score(units: &Value, price: f64) -> f64 {
    let Some(items) = units.as_array() else {
        return 0.0;
    };
    let mut notional = 0.0;
    for unit in items {
        notional += (json_number(unit, "bid_size") + json_number(unit, "ask_size")) * price;
    }
    if notional <= 0.0 {
        return 0.0;
    }
    // 1e6 KRW of depth ≈ 60, 1e8 ≈ 80, capped at 100.
    (notional.log10() * 10.0).clamp(0.0, 100.0)
}

/// Weighted composite in [0, 100].
pub fn composite_score(metrics: &CoinMetrics) -> f64 {
    // Surge: 1.0 = flat; 3x volume saturates the component.
    let surge_component = ((metrics.volume_surge_ratio - 1.0) / 2.0).clamp(0.0, 1.0) * 100.0;

    // Momentum: favour the 50-75 RSI band, fade the extremes.
    let momentum_component = if metrics.price_momentum >= 50.0 && metrics.price_momentum <= 75.0 {
        100.0
    } else if metrics.price_momentum < 50.0 {
        metrics.price_momentum * 2.0
    } else {
        ((100.0 - metrics.price_momentum) * 4.0).clamp(0.0, 100.0)
    };

    // Imbalance: only the buy side contributes.
    let imbalance_component = (metrics.order_book_imbalance.max(0.0)) * 100.0;

    // Volatility sweet spot around 0.5%-3% per bar.
    let volatility_component = if metrics.volatility >= 0.005 && metrics.volatility <= 0.03 {
        100.0
    } else if metrics.volatility < 0.005 {
        metrics.volatility / 0.005 * 100.0
    } else {
        (0.06 - metrics.volatility).max(0.0) / 0.03 * 100.0
    };

    0.25 * surge_component
        + 0.20 * momentum_component
        + 0.15 * imbalance_component
        + 0.20 * volatility_component
        + 0.20 * metrics.liquidity_score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_candles_reverses_to_ascending() {
        let payload = serde_json::json!([
            { "timestamp": 3000, "opening_price": 103.0, "high_price": 104.0,
              "low_price": 102.0, "trade_price": 103.5, "candle_acc_trade_volume": 3.0 },
            { "timestamp": 2000, "opening_price": 102.0, "high_price": 103.0,
              "low_price": 101.0, "trade_price": 102.5, "candle_acc_trade_volume": 2.0 },
            { "timestamp": 1000, "opening_price": 101.0, "high_price": 102.0,
              "low_price": 100.0, "trade_price": 101.5, "candle_acc_trade_volume": 1.0 },
        ]);
        let candles = parse_candles(&payload);
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].timestamp_ms, 1000);
        assert_eq!(candles[2].timestamp_ms, 3000);
        assert!(candles[0].close < candles[2].close);
    }

    #[test]
    fn parse_candles_handles_string_prices_and_garbage() {
        let payload = serde_json::json!([
            { "timestamp": 1000, "opening_price": "100.0", "high_price": "101.0",
              "low_price": "99.0", "trade_price": "100.5", "candle_acc_trade_volume": "2.5" },
            { "timestamp": 2000 },
        ]);
        let candles = parse_candles(&payload);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 100.5);
        assert!(parse_candles(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn imbalance_sign_follows_depth() {
        let bid_heavy = serde_json::json!([
            { "bid_size": 9.0, "ask_size": 1.0 },
            { "bid_size": 6.0, "ask_size": 4.0 },
        ]);
        assert!(orderbook_imbalance(&bid_heavy) > 0.0);

        let ask_heavy = serde_json::json!([{ "bid_size": 1.0, "ask_size": 9.0 }]);
        assert!(orderbook_imbalance(&ask_heavy) < 0.0);

        assert_eq!(orderbook_imbalance(&serde_json::json!([])), 0.0);
        assert_eq!(orderbook_imbalance(&Value::Null), 0.0);
    }

    #[test]
    fn volume_surge_needs_history() {
        let flat = crate::indicators::flat_candles(10, 100.0);
        assert_eq!(volume_surge(&flat), 1.0);

        let mut candles = crate::indicators::flat_candles(30, 100.0);
        let last = candles.len() - 1;
        candles[last].volume = 50.0; // 5x the flat 10.0 average
        assert!((volume_surge(&candles) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_captures_top_of_book_and_depth() {
        let units = serde_json::json!([
            { "bid_price": 99_990.0, "ask_price": 100_010.0, "bid_size": 2.0, "ask_size": 1.0 },
            { "bid_price": 99_980.0, "ask_price": 100_020.0, "bid_size": 3.0, "ask_size": 4.0 },
        ]);
        let snapshot = orderbook_snapshot(&units);
        assert_eq!(snapshot.best_bid, 99_990.0);
        assert_eq!(snapshot.best_ask, 100_010.0);
        assert_eq!(snapshot.total_bid_size, 5.0);
        assert_eq!(snapshot.total_ask_size, 5.0);

        let empty = orderbook_snapshot(&Value::Null);
        assert_eq!(empty.best_bid, 0.0);
    }

    #[test]
    fn liquidity_score_scales_with_depth() {
        let thin = serde_json::json!([{ "bid_size": 0.001, "ask_size": 0.001 }]);
        let deep = serde_json::json!([{ "bid_size": 100.0, "ask_size": 100.0 }]);
        let thin_score = liquidity_score(&thin, 10_000.0);
        let deep_score = liquidity_score(&deep, 10_000.0);
        assert!(deep_score > thin_score);
        assert!(deep_score <= 100.0);
    }

    #[test]
    fn composite_score_prefers_surging_balanced_markets() {
        let hot = CoinMetrics {
            volume_surge_ratio: 3.0,
            price_momentum: 60.0,
            order_book_imbalance: 0.4,
            volatility: 0.01,
            liquidity_score: 80.0,
            ..Default::default()
        };
        let cold = CoinMetrics {
            volume_surge_ratio: 1.0,
            price_momentum: 20.0,
            order_book_imbalance: -0.5,
            volatility: 0.0001,
            liquidity_score: 20.0,
            ..Default::default()
        };
        assert!(composite_score(&hot) > composite_score(&cold));
        assert!(composite_score(&hot) <= 100.0);
    }
}
