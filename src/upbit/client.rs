// =============================================================================
// Upbit REST API client — JWT-signed requests behind the rate limiter
// =============================================================================
//
// SECURITY: the secret key is only ever fed to the HMAC; it is never logged
// or serialized, and the Debug impl redacts both keys.
//
// Every call acquires a token from the per-group rate limiter before hitting
// the network, reconciles the limiter from the `Remaining-Req` response
// header afterwards, and reports 429/418 so the global block engages.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ExchangeError;
use crate::upbit::jwt;
use crate::upbit::rate_limiter::RateLimiter;

/// Ticker batches this large stay inside one quotation-group token.
const TICKER_BATCH: usize = 100;
/// Orderbook responses are heavy; keep batches small.
const ORDERBOOK_BATCH: usize = 10;
/// Pause between consecutive batch requests.
const BATCH_GAP: Duration = Duration::from_millis(100);

/// Raw response surface needed by callers that inspect headers (the
/// compliance adapter reads `Remaining-Req` itself).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub remaining_req: Option<String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, ExchangeError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ExchangeError::StateInconsistency(format!("bad JSON body: {e}")))
    }
}

/// Outcome of a cancel request. A cancel racing a fill is not a failure: the
/// exchange answers `done_order` / `invalid_ord_uuid`, and the authoritative
/// order state is fetched and returned for reconciliation.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The exchange accepted the cancel; payload is the cancel response.
    Cancelled(Value),
    /// The order was already terminal; payload is a fresh REST order read.
    AlreadyTerminal(Value),
    /// The exchange refused the cancel for another reason.
    Rejected(String),
}

#[derive(Clone)]
pub struct UpbitClient {
    access_key: String,
    secret_key: String,
    base_url: String,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl UpbitClient {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        debug!("UpbitClient initialised (base_url=https://api.upbit.com)");

        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            base_url: "https://api.upbit.com".to_string(),
            http,
            limiter: Arc::new(RateLimiter::new()),
        }
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// Endpoint → limiter group routing.
    pub fn group_for(endpoint: &str) -> &'static str {
        if endpoint.starts_with("/v1/market/") {
            "market"
        } else if endpoint.starts_with("/v1/candles/") {
            "candle"
        } else if endpoint.starts_with("/v1/ticker") {
            "ticker"
        } else if endpoint.starts_with("/v1/orderbook/instruments") {
            "default"
        } else if endpoint.starts_with("/v1/orderbook") {
            "orderbook"
        } else if endpoint.starts_with("/v1/trades/") {
            "trade"
        } else if endpoint.starts_with("/v1/accounts") {
            "accounts"
        } else if endpoint == "/v1/orders" || endpoint == "/v1/order" {
            "order"
        } else {
            "default"
        }
    }

    // -------------------------------------------------------------------------
    // Raw signed verbs
    // -------------------------------------------------------------------------

    pub async fn get(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, ExchangeError> {
        // GET /v1/order carries a uuid lookup, not an order placement.
        let group = if endpoint == "/v1/order" {
            "default"
        } else {
            Self::group_for(endpoint)
        };
        self.limiter.acquire(group).await;

        let mut url = format!("{}{}", self.base_url, endpoint);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&jwt::canonical_query(params));
        }

        let token = jwt::generate(&self.access_key, &self.secret_key, params);
        let request = self.http.get(&url).bearer_auth(token);
        self.dispatch(request).await
    }

    async fn post(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, ExchangeError> {
        self.limiter.acquire("order").await;

        let url = format!("{}{}", self.base_url, endpoint);
        let token = jwt::generate(&self.access_key, &self.secret_key, params);
        let body: serde_json::Map<String, Value> = params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        let request = self.http.post(&url).bearer_auth(token).json(&body);
        self.dispatch(request).await
    }

    async fn delete(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, ExchangeError> {
        self.limiter.acquire("order").await;

        let mut url = format!("{}{}", self.base_url, endpoint);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&jwt::canonical_query(params));
        }

        let token = jwt::generate(&self.access_key, &self.secret_key, params);
        let request = self.http.delete(&url).bearer_auth(token);
        self.dispatch(request).await
    }

    async fn dispatch(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<HttpResponse, ExchangeError> {
        let response = request.send().await?;

        let status = response.status().as_u16();
        let remaining_req = response
            .headers()
            .get("Remaining-Req")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await?;

        if let Some(header) = &remaining_req {
            self.limiter.update_from_header(header);
        }
        self.limiter.handle_rate_limit_status(status);

        Ok(HttpResponse {
            status,
            body,
            remaining_req,
        })
    }

    fn expect_success(response: HttpResponse) -> Result<Value, ExchangeError> {
        if !response.is_success() {
            return Err(ExchangeError::from_status(response.status, &response.body));
        }
        response.json()
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /v1/market/all
    pub async fn get_markets(&self) -> Result<Value, ExchangeError> {
        let response = self.get("/v1/market/all", &BTreeMap::new()).await?;
        Self::expect_success(response)
    }

    /// GET /v1/ticker for one comma-joined batch of markets.
    pub async fn get_ticker(&self, markets: &[String]) -> Result<Value, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("markets".to_string(), markets.join(","));
        let response = self.get("/v1/ticker", &params).await?;
        Self::expect_success(response)
    }

    /// GET /v1/orderbook for one comma-joined batch of markets.
    pub async fn get_orderbook(&self, markets: &[String]) -> Result<Value, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("markets".to_string(), markets.join(","));
        let response = self.get("/v1/orderbook", &params).await?;
        Self::expect_success(response)
    }

    /// Batched ticker fetch: 100-market chunks with a 100 ms gap.
    pub async fn get_tickers_batched(&self, markets: &[String]) -> Result<Vec<Value>, ExchangeError> {
        let mut out = Vec::with_capacity(markets.len());
        for (i, chunk) in markets.chunks(TICKER_BATCH).enumerate() {
            if i > 0 {
                tokio::time::sleep(BATCH_GAP).await;
            }
            let batch = self.get_ticker(chunk).await?;
            if let Value::Array(items) = batch {
                out.extend(items);
            }
        }
        Ok(out)
    }

    /// Batched orderbook fetch: 10-market chunks with a 100 ms gap.
    pub async fn get_orderbooks_batched(
        &self,
        markets: &[String],
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut out = Vec::with_capacity(markets.len());
        for (i, chunk) in markets.chunks(ORDERBOOK_BATCH).enumerate() {
            if i > 0 {
                tokio::time::sleep(BATCH_GAP).await;
            }
            let batch = self.get_orderbook(chunk).await?;
            if let Value::Array(items) = batch {
                out.extend(items);
            }
        }
        Ok(out)
    }

    /// GET /v1/candles/minutes/{unit}
    pub async fn get_minute_candles(
        &self,
        market: &str,
        unit: u32,
        count: u32,
    ) -> Result<Value, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("market".to_string(), market.to_string());
        params.insert("count".to_string(), count.to_string());
        let endpoint = format!("/v1/candles/minutes/{unit}");
        let response = self.get(&endpoint, &params).await?;
        Self::expect_success(response)
    }

    /// GET /v1/candles/days
    pub async fn get_day_candles(&self, market: &str, count: u32) -> Result<Value, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("market".to_string(), market.to_string());
        params.insert("count".to_string(), count.to_string());
        let response = self.get("/v1/candles/days", &params).await?;
        Self::expect_success(response)
    }

    // -------------------------------------------------------------------------
    // Account & orders
    // -------------------------------------------------------------------------

    /// GET /v1/accounts
    pub async fn get_accounts(&self) -> Result<Value, ExchangeError> {
        let response = self.get("/v1/accounts", &BTreeMap::new()).await?;
        Self::expect_success(response)
    }

    /// GET /v1/orders/chance — raw response so callers can read headers.
    pub async fn get_order_chance(&self, market: &str) -> Result<HttpResponse, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("market".to_string(), market.to_string());
        self.get("/v1/orders/chance", &params).await
    }

    /// GET /v1/orderbook/instruments — raw response for the same reason.
    pub async fn get_instruments(&self, market: &str) -> Result<HttpResponse, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("markets".to_string(), market.to_string());
        self.get("/v1/orderbook/instruments", &params).await
    }

    /// GET /v1/order?uuid= — authoritative single-order state.
    pub async fn get_order(&self, uuid: &str) -> Result<Value, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("uuid".to_string(), uuid.to_string());
        let response = self.get("/v1/order", &params).await?;
        Self::expect_success(response)
    }

    /// POST /v1/orders.
    ///
    /// `ord_type` semantics follow the exchange: `limit` requires both volume
    /// and price; `price` (notional market buy) requires price only; `market`
    /// (volume market sell) requires volume only.
    pub async fn place_order(
        &self,
        market: &str,
        side: &str,
        volume: Option<&str>,
        price: Option<&str>,
        ord_type: &str,
    ) -> Result<Value, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("market".to_string(), market.to_string());
        params.insert("side".to_string(), side.to_string());
        params.insert("ord_type".to_string(), ord_type.to_string());
        if let Some(volume) = volume {
            params.insert("volume".to_string(), volume.to_string());
        }
        if let Some(price) = price {
            params.insert("price".to_string(), price.to_string());
        }

        debug!(market, side, ord_type, "placing order");
        let response = self.post("/v1/orders", &params).await?;
        Self::expect_success(response)
    }

    /// DELETE /v1/order?uuid=.
    ///
    /// A cancel that loses the race to a fill (or targets an unknown uuid) is
    /// resolved by reading the order back and returning `AlreadyTerminal`.
    pub async fn cancel_order(&self, uuid: &str) -> Result<CancelOutcome, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("uuid".to_string(), uuid.to_string());

        let response = self.delete("/v1/order", &params).await?;

        if response.is_success() {
            let payload = response.json()?;
            if payload.get("uuid").is_some() {
                return Ok(CancelOutcome::Cancelled(payload));
            }
            return Ok(CancelOutcome::Rejected(format!(
                "cancel response missing uuid: {payload}"
            )));
        }

        let payload = response.json().unwrap_or(Value::Null);
        let error_name = payload
            .get("error")
            .and_then(|e| e.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("");

        if cancel_error_means_terminal(error_name) {
            warn!(uuid, error = error_name, "cancel skipped (already done/missing); syncing");
            let state = self.get_order(uuid).await?;
            return Ok(CancelOutcome::AlreadyTerminal(state));
        }

        Ok(CancelOutcome::Rejected(format!(
            "HTTP {}: {}",
            response.status, error_name
        )))
    }
}

/// `done_order` / `invalid_ord_uuid` mean the order is already terminal on
/// the exchange side; the cancel is then a no-op plus a sync.
pub fn cancel_error_means_terminal(error_name: &str) -> bool {
    matches!(error_name, "done_order" | "invalid_ord_uuid")
}

/// Format a price/volume for the wire: fixed precision, trailing zeros
/// trimmed ("0.01000000" → "0.01", "100000.0" → "100000").
pub fn format_decimal(value: f64) -> String {
    let mut s = format!("{value:.8}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

impl std::fmt::Debug for UpbitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpbitClient")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_group_routing() {
        assert_eq!(UpbitClient::group_for("/v1/market/all"), "market");
        assert_eq!(UpbitClient::group_for("/v1/candles/minutes/5"), "candle");
        assert_eq!(UpbitClient::group_for("/v1/candles/days"), "candle");
        assert_eq!(UpbitClient::group_for("/v1/ticker"), "ticker");
        assert_eq!(UpbitClient::group_for("/v1/orderbook"), "orderbook");
        assert_eq!(UpbitClient::group_for("/v1/orderbook/instruments"), "default");
        assert_eq!(UpbitClient::group_for("/v1/trades/ticks"), "trade");
        assert_eq!(UpbitClient::group_for("/v1/accounts"), "accounts");
        assert_eq!(UpbitClient::group_for("/v1/orders"), "order");
        assert_eq!(UpbitClient::group_for("/v1/orders/chance"), "default");
    }

    #[test]
    fn decimal_formatting_trims_zeros() {
        assert_eq!(format_decimal(0.01), "0.01");
        assert_eq!(format_decimal(100_000.0), "100000");
        assert_eq!(format_decimal(0.00000001), "0.00000001");
        assert_eq!(format_decimal(999.5), "999.5");
    }

    #[test]
    fn terminal_cancel_error_names() {
        assert!(cancel_error_means_terminal("done_order"));
        assert!(cancel_error_means_terminal("invalid_ord_uuid"));
        assert!(!cancel_error_means_terminal("insufficient_funds"));
        assert!(!cancel_error_means_terminal(""));
    }

    #[test]
    fn debug_redacts_keys() {
        let client = UpbitClient::new("AK", "SK");
        let dump = format!("{client:?}");
        assert!(!dump.contains("AK"));
        assert!(!dump.contains("SK"));
        assert!(dump.contains("<redacted>"));
    }
}
