// =============================================================================
// Brokerage REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every signed
// request carries the API key as a header plus a `recvWindow` of 5 000 ms to
// tolerate minor clock drift between the engine and the gateway.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use super::{Brokerage, Holding, OrderSide, OrderStatus, RestingOrder};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Production brokerage gateway over the broker's REST API.
#[derive(Clone)]
pub struct RestBroker {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestBroker {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `RestBroker`.
    ///
    /// # Arguments
    /// * `base_url` — gateway base URL, no trailing slash.
    /// * `api_key`  — sent as a header, never in query params.
    /// * `secret`   — used exclusively for HMAC signing.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// GET a signed endpoint and parse the JSON body, bailing on non-2xx.
    async fn signed_get(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("broker GET {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }

    /// POST a signed endpoint and parse the JSON body, bailing on non-2xx.
    async fn signed_post(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("broker POST {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }
}

#[async_trait]
impl Brokerage for RestBroker {
    /// GET /v1/market/status (signed).
    #[instrument(skip(self), name = "broker::is_market_open")]
    async fn is_market_open(&self) -> Result<bool> {
        let body = self.signed_get("/v1/market/status", "").await?;
        let open = body["open"]
            .as_bool()
            .context("market status response missing 'open'")?;
        debug!(open, "market status retrieved");
        Ok(open)
    }

    /// GET /v1/quote/price (signed).
    #[instrument(skip(self), name = "broker::current_price")]
    async fn current_price(&self, ticker: &str) -> Result<f64> {
        let body = self
            .signed_get("/v1/quote/price", &format!("ticker={ticker}"))
            .await?;
        let price = body["price"]
            .as_f64()
            .context("price response missing 'price'")?;
        debug!(ticker, price, "current price retrieved");
        Ok(price)
    }

    /// GET /v1/quote/name (signed).
    #[instrument(skip(self), name = "broker::stock_name")]
    async fn stock_name(&self, ticker: &str) -> Result<String> {
        let body = self
            .signed_get("/v1/quote/name", &format!("ticker={ticker}"))
            .await?;
        let name = body["name"]
            .as_str()
            .context("name response missing 'name'")?;
        Ok(name.to_string())
    }

    /// GET /v1/account/holdings (signed).
    #[instrument(skip(self), name = "broker::holdings")]
    async fn holdings(&self) -> Result<Vec<Holding>> {
        let body = self.signed_get("/v1/account/holdings", "").await?;
        let holdings: Vec<Holding> = serde_json::from_value(body["holdings"].clone())
            .context("failed to parse holdings response")?;
        debug!(count = holdings.len(), "holdings retrieved");
        Ok(holdings)
    }

    /// GET /v1/orders (signed) — resting orders, oldest first.
    #[instrument(skip(self), name = "broker::open_orders")]
    async fn open_orders(
        &self,
        ticker: &str,
        side: OrderSide,
        status: OrderStatus,
    ) -> Result<Vec<RestingOrder>> {
        let params = format!("ticker={ticker}&side={side}&status={status}");
        let body = self.signed_get("/v1/orders", &params).await?;
        let orders: Vec<RestingOrder> = serde_json::from_value(body["orders"].clone())
            .context("failed to parse order list response")?;
        debug!(ticker, count = orders.len(), "order list retrieved");
        Ok(orders)
    }

    /// POST /v1/orders/cancel (signed) — cancel one resting order.
    #[instrument(skip(self, order), name = "broker::cancel_order")]
    async fn cancel_order(&self, ticker: &str, order: &RestingOrder) -> Result<()> {
        let params = format!(
            "ticker={ticker}&order_no={}&origin_no={}&qty={}&price={}&mode=CANCEL",
            order.order_no, order.origin_no, order.remaining_qty, order.avg_price
        );
        self.signed_post("/v1/orders/cancel", &params).await?;
        debug!(ticker, order_no = %order.order_no, "resting order cancelled");
        Ok(())
    }

    /// POST /v1/orders/cancel_all (signed).
    #[instrument(skip(self), name = "broker::cancel_all_orders")]
    async fn cancel_all_orders(&self, ticker: &str) -> Result<()> {
        self.signed_post("/v1/orders/cancel_all", &format!("ticker={ticker}"))
            .await?;
        debug!(ticker, "all resting orders cancelled");
        Ok(())
    }

    /// POST /v1/orders/market (signed) — market buy.
    #[instrument(skip(self), name = "broker::buy_market")]
    async fn buy_market(&self, ticker: &str, qty: f64) -> Result<serde_json::Value> {
        if qty <= 0.0 {
            warn!(ticker, qty, "refusing zero-quantity market buy");
            anyhow::bail!("market buy quantity must be positive");
        }
        let params = format!("ticker={ticker}&side=BUY&qty={qty}");
        self.signed_post("/v1/orders/market", &params).await
    }

    /// POST /v1/orders/market (signed) — market sell.
    #[instrument(skip(self), name = "broker::sell_market")]
    async fn sell_market(&self, ticker: &str, qty: f64) -> Result<serde_json::Value> {
        if qty <= 0.0 {
            warn!(ticker, qty, "refusing zero-quantity market sell");
            anyhow::bail!("market sell quantity must be positive");
        }
        let params = format!("ticker={ticker}&side=SELL&qty={qty}");
        self.signed_post("/v1/orders/market", &params).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let broker = RestBroker::new("https://gw.example.com", "key", "secret");
        let a = broker.sign("ticker=005930&timestamp=1");
        let b = broker.sign("ticker=005930&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signed_query_appends_timestamp_window_signature() {
        let broker = RestBroker::new("https://gw.example.com", "key", "secret");
        let qs = broker.signed_query("ticker=005930");
        assert!(qs.starts_with("ticker=005930&timestamp="));
        assert!(qs.contains("&recvWindow=5000&"));
        assert!(qs.contains("&signature="));
    }
}
