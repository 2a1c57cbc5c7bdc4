use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::rate_limit::{classes, RateLimiter};
use crate::auth::{ApiCreds, Signer};
use crate::error::{body_preview, EngineError, EngineResult};
use crate::models::market::OrderBook;
use crate::models::order::{OrderSide, OrderStatus, OrderType, SignedOrder};
use crate::runtime::metrics::LatencyTracker;
use crate::runtime::shutdown::ShutdownSignal;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

// The balance endpoint rejects non-browser clients.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const BROWSER_ORIGIN: &str = "https://polymarket.com";
const BROWSER_REFERER: &str = "https://polymarket.com/";

/// Authenticated, rate-limited HTTP client for the CLOB API.
///
/// Shared by all sessions and the on-chain coordinator. Auth prefers L2
/// (API-key HMAC) once credentials are derived, falling back to L1.
pub struct RestClient {
    base: String,
    http: reqwest::Client,
    signer: Arc<Signer>,
    creds: RwLock<Option<ApiCreds>>,
    limiter: RateLimiter,
    metrics: Arc<LatencyTracker>,
    shutdown: ShutdownSignal,
}

#[derive(Debug, Clone)]
pub struct PostOrderOutcome {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

/// Order record from `/data/orders` / `/data/order/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrderRecord {
    pub id: String,
    #[serde(default)]
    pub status: String,
    /// Condition id of the market on the wire.
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub original_size: String,
    #[serde(default)]
    pub size_matched: String,
}

impl OpenOrderRecord {
    pub fn order_side(&self) -> OrderSide {
        OrderSide::from_str(&self.side).unwrap_or(OrderSide::Buy)
    }

    pub fn price_decimal(&self) -> Decimal {
        Decimal::from_str(&self.price).unwrap_or(Decimal::ZERO)
    }

    pub fn original_size_decimal(&self) -> Decimal {
        Decimal::from_str(&self.original_size).unwrap_or(Decimal::ZERO)
    }

    pub fn size_matched_decimal(&self) -> Decimal {
        Decimal::from_str(&self.size_matched).unwrap_or(Decimal::ZERO)
    }

    /// Map the wire status plus matched size onto the runtime status.
    pub fn runtime_status(&self) -> OrderStatus {
        let matched = self.size_matched_decimal();
        let original = self.original_size_decimal();
        match self.status.to_ascii_uppercase().as_str() {
            "MATCHED" | "FILLED" => OrderStatus::Filled,
            "CANCELED" | "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "DELAYED" => OrderStatus::Pending,
            _ => {
                if matched > Decimal::ZERO && matched < original {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Live
                }
            }
        }
    }
}

/// Trade record from `/data/trades`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    #[serde(default)]
    pub taker_order_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub match_time: String,
}

impl TradeRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.match_time
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceAllowance {
    #[serde(default)]
    pub balance: String,
    #[serde(default)]
    pub allowance: String,
}

impl BalanceAllowance {
    /// Values arrive in 1e6 base units.
    pub fn balance_decimal(&self) -> Decimal {
        raw_base_units_to_decimal(&self.balance)
    }

    pub fn allowance_decimal(&self) -> Decimal {
        raw_base_units_to_decimal(&self.allowance)
    }
}

fn raw_base_units_to_decimal(raw: &str) -> Decimal {
    Decimal::from_str(raw)
        .map(|d| d / Decimal::from(1_000_000))
        .unwrap_or(Decimal::ZERO)
}

/// Market metadata resolved from `/markets?slug=`.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub slug: String,
    pub condition_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
    pub tick_size: Decimal,
    pub neg_risk: bool,
}

#[derive(Debug, Serialize)]
struct PostOrderRequest {
    order: SignedOrder,
    owner: String,
    #[serde(rename = "orderType")]
    order_type: String,
    #[serde(rename = "deferExec")]
    defer_exec: bool,
}

#[derive(Debug, Deserialize)]
struct PostOrderResponse {
    success: Option<bool>,
    #[serde(rename = "orderID")]
    order_id: Option<String>,
    #[serde(rename = "errorMsg")]
    error_msg: Option<String>,
    /// Rejections arrive under "error"; other failures under "errorMsg".
    error: Option<String>,
}

impl RestClient {
    pub fn new(
        base: &str,
        proxy_url: Option<&str>,
        signer: Arc<Signer>,
        shutdown: ShutdownSignal,
    ) -> EngineResult<Self> {
        url::Url::parse(base)
            .map_err(|e| EngineError::Validation(format!("bad base url {base}: {e}")))?;

        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Some(std::time::Duration::from_secs(30)))
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .gzip(true);

        if let Some(url) = proxy_url {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| EngineError::Validation(format!("bad proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| EngineError::Transient(format!("http client build: {e}")))?;

        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            signer,
            creds: RwLock::new(None),
            limiter: RateLimiter::new(),
            metrics: Arc::new(LatencyTracker::new()),
            shutdown,
        })
    }

    pub fn metrics(&self) -> &Arc<LatencyTracker> {
        &self.metrics
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    pub async fn creds(&self) -> Option<ApiCreds> {
        self.creds.read().await.clone()
    }

    pub async fn set_creds(&self, creds: ApiCreds) {
        *self.creds.write().await = Some(creds);
    }

    /// Create or derive API credentials for L2 auth. Tries create first,
    /// then derives the existing key.
    pub async fn init_auth(&self) -> EngineResult<ApiCreds> {
        self.limiter.wait(classes::AUTH, &self.shutdown).await?;

        let headers = self.signer.l1_headers(0).await?;
        let create = headers
            .clone()
            .apply(self.http.post(format!("{}/auth/api-key", self.base)))
            .send()
            .await;

        if let Ok(resp) = create {
            if resp.status().is_success() {
                if let Ok(creds) = resp.json::<ApiCreds>().await {
                    if !creds.key.is_empty() {
                        info!("api key created: {}…", &creds.key[..8.min(creds.key.len())]);
                        self.set_creds(creds.clone()).await;
                        return Ok(creds);
                    }
                }
            }
        }

        self.limiter.wait(classes::AUTH, &self.shutdown).await?;
        let headers = self.signer.l1_headers(0).await?;
        let resp = headers
            .apply(self.http.get(format!("{}/auth/derive-api-key", self.base)))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(EngineError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let creds: ApiCreds = serde_json::from_str(&body).map_err(|_| EngineError::Decode {
            context: "derive-api-key".into(),
            preview: body_preview(&body),
        })?;
        info!("api key derived: {}…", &creds.key[..8.min(creds.key.len())]);
        self.set_creds(creds.clone()).await;
        Ok(creds)
    }

    /// Build a request with L2 (preferred) or L1 auth headers attached.
    async fn auth_request(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> EngineResult<reqwest::RequestBuilder> {
        let url = format!("{}{}", self.base, path);
        let builder = match method {
            "POST" => self.http.post(&url),
            "DELETE" => self.http.delete(&url),
            _ => self.http.get(&url),
        };

        let creds = self.creds.read().await.clone();
        match creds {
            Some(creds) => {
                let headers = self.signer.l2_headers(&creds, method, path, body)?;
                Ok(headers.apply(builder))
            }
            None => {
                let headers = self.signer.l1_headers(0).await?;
                Ok(headers.apply(builder))
            }
        }
    }

    async fn send_authed(
        &self,
        method: &str,
        path: &str,
        class: &str,
        body: Option<String>,
        browser_headers: bool,
    ) -> EngineResult<String> {
        self.limiter.wait(class, &self.shutdown).await?;
        let _timer = self.metrics.start_timer(class);

        let body_str = body.clone().unwrap_or_default();
        let mut request = self.auth_request(method, path, &body_str).await?;
        if let Some(body) = body {
            request = request.header("Content-Type", "application/json").body(body);
        }
        if browser_headers {
            request = request
                .header("User-Agent", BROWSER_USER_AGENT)
                .header("Origin", BROWSER_ORIGIN)
                .header("Referer", BROWSER_REFERER);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(EngineError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    fn decode<T: serde::de::DeserializeOwned>(context: &str, body: &str) -> EngineResult<T> {
        serde_json::from_str(body).map_err(|_| EngineError::Decode {
            context: context.to_string(),
            preview: body_preview(body),
        })
    }

    /// GET /time — server clock in epoch seconds.
    pub async fn server_time(&self) -> EngineResult<u64> {
        self.limiter.wait(classes::META, &self.shutdown).await?;
        let resp = self.http.get(format!("{}/time", self.base)).send().await?;
        let text = resp.text().await?;
        let value: serde_json::Value = Self::decode("time", &text)?;
        Ok(value.as_f64().unwrap_or(0.0) as u64)
    }

    /// GET /markets?slug= — resolve cycle metadata for a slug.
    pub async fn market_by_slug(&self, slug: &str) -> EngineResult<Option<MarketInfo>> {
        self.limiter.wait(classes::META, &self.shutdown).await?;

        let url = format!("{}/markets?slug={}", self.base, slug);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let text = resp.text().await?;
        let infos: Vec<RawMarketInfo> = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => match serde_json::from_str::<RawMarketWrapper>(&text) {
                Ok(w) => w.data,
                Err(_) => return Ok(None),
            },
        };

        let Some(raw) = infos.into_iter().next() else {
            return Ok(None);
        };
        Ok(raw.resolve(slug))
    }

    /// GET /book?token_id= — full depth snapshot.
    pub async fn book(&self, token_id: &str) -> EngineResult<OrderBook> {
        self.limiter.wait(classes::BOOK, &self.shutdown).await?;

        let url = format!("{}/book?token_id={}", self.base, token_id);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(EngineError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let raw: RawBook = Self::decode("book", &text)?;
        let mut book = OrderBook::new(token_id.to_string());
        for level in raw.bids {
            let price = Decimal::from_str(&level.price).unwrap_or_default();
            let size = Decimal::from_str(&level.size).unwrap_or_default();
            book.apply_level(true, price, size);
        }
        for level in raw.asks {
            let price = Decimal::from_str(&level.price).unwrap_or_default();
            let size = Decimal::from_str(&level.size).unwrap_or_default();
            book.apply_level(false, price, size);
        }
        Ok(book)
    }

    /// GET /price?token_id=&side= — single side quote.
    pub async fn price(&self, token_id: &str, side: OrderSide) -> EngineResult<Decimal> {
        self.limiter.wait(classes::BOOK, &self.shutdown).await?;

        let side_str = match side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let url = format!(
            "{}/price?token_id={}&side={}",
            self.base, token_id, side_str
        );
        let resp = self.http.get(&url).send().await?;
        let text = resp.text().await?;
        let value: serde_json::Value = Self::decode("price", &text)?;
        let price = value
            .get("price")
            .and_then(|p| p.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);
        Ok(price)
    }

    /// POST /order — submit a signed order. Placement is never retried.
    pub async fn post_order(
        &self,
        signed: SignedOrder,
        order_type: OrderType,
        defer_exec: bool,
    ) -> EngineResult<PostOrderOutcome> {
        let owner = self
            .creds
            .read()
            .await
            .as_ref()
            .map(|c| c.key.clone())
            .unwrap_or_default();

        let request = PostOrderRequest {
            order: signed,
            owner,
            order_type: order_type.as_str().to_string(),
            defer_exec,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| EngineError::Validation(format!("order serialize: {e}")))?;

        let text = self
            .send_authed("POST", "/order", classes::ORDER_POST, Some(body), false)
            .await;

        let text = match text {
            Ok(t) => t,
            // The CLOB answers some rejections with non-2xx + JSON body;
            // surface those as a structured outcome, not a transport error.
            Err(EngineError::Http { status, body }) => {
                error!("order HTTP {status}: {body}");
                body
            }
            Err(e) => return Err(e),
        };

        let parsed: PostOrderResponse =
            serde_json::from_str(&text).unwrap_or(PostOrderResponse {
                success: None,
                order_id: None,
                error_msg: Some(body_preview(&text)),
                error: None,
            });

        if parsed.success.unwrap_or(false) {
            debug!("order accepted: {}", parsed.order_id.as_deref().unwrap_or("?"));
            Ok(PostOrderOutcome {
                success: true,
                order_id: parsed.order_id,
                error: None,
            })
        } else {
            let err = parsed
                .error
                .or(parsed.error_msg)
                .unwrap_or_else(|| "order rejected".to_string());
            Ok(PostOrderOutcome {
                success: false,
                order_id: None,
                error: Some(err),
            })
        }
    }

    /// POST /orders — batch submission. Outcomes are positional.
    pub async fn post_orders(
        &self,
        orders: Vec<(SignedOrder, OrderType)>,
    ) -> EngineResult<Vec<PostOrderOutcome>> {
        if orders.is_empty() {
            return Ok(Vec::new());
        }

        let owner = self
            .creds
            .read()
            .await
            .as_ref()
            .map(|c| c.key.clone())
            .unwrap_or_default();

        let batch: Vec<PostOrderRequest> = orders
            .into_iter()
            .map(|(order, order_type)| PostOrderRequest {
                order,
                owner: owner.clone(),
                order_type: order_type.as_str().to_string(),
                defer_exec: false,
            })
            .collect();
        let body = serde_json::to_string(&batch)
            .map_err(|e| EngineError::Validation(format!("batch serialize: {e}")))?;

        let text = self
            .send_authed("POST", "/orders", classes::ORDER_POST, Some(body), false)
            .await?;
        let responses: Vec<PostOrderResponse> = Self::decode("orders", &text)?;

        Ok(responses
            .into_iter()
            .map(|resp| {
                if resp.success.unwrap_or(false) {
                    PostOrderOutcome {
                        success: true,
                        order_id: resp.order_id,
                        error: None,
                    }
                } else {
                    PostOrderOutcome {
                        success: false,
                        order_id: None,
                        error: resp.error.or(resp.error_msg),
                    }
                }
            })
            .collect())
    }

    /// DELETE /order?orderID= — cancel one order.
    pub async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        let path = format!("/order?orderID={}", order_id);
        self.send_authed("DELETE", &path, classes::ORDER_DELETE, None, false)
            .await?;
        debug!("cancelled order {order_id}");
        Ok(())
    }

    /// DELETE /cancel-all — cancel everything for the account.
    pub async fn cancel_all(&self) -> EngineResult<()> {
        self.send_authed("DELETE", "/cancel-all", classes::ORDER_DELETE, None, false)
            .await?;
        info!("cancelled all orders");
        Ok(())
    }

    /// DELETE /cancel-market-orders — cancel within one market (by
    /// condition id).
    pub async fn cancel_market_orders(&self, condition_id: &str) -> EngineResult<()> {
        let body = serde_json::json!({ "market": condition_id }).to_string();
        self.send_authed(
            "DELETE",
            "/cancel-market-orders",
            classes::ORDER_DELETE,
            Some(body),
            false,
        )
        .await?;
        info!("cancelled market orders for {condition_id}");
        Ok(())
    }

    /// GET /data/orders — open orders, optionally filtered by market
    /// (condition id).
    pub async fn open_orders(&self, condition_id: Option<&str>) -> EngineResult<Vec<OpenOrderRecord>> {
        let path = match condition_id {
            Some(market) => format!("/data/orders?market={}", market),
            None => "/data/orders".to_string(),
        };
        let text = self
            .send_authed("GET", &path, classes::DATA, None, false)
            .await?;
        Self::decode("data/orders", &text)
    }

    /// GET /data/order/{id} — one order.
    pub async fn order_by_id(&self, order_id: &str) -> EngineResult<Option<OpenOrderRecord>> {
        let path = format!("/data/order/{}", order_id);
        match self.send_authed("GET", &path, classes::DATA, None, false).await {
            Ok(text) => Ok(Self::decode("data/order", &text).ok()),
            Err(EngineError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// GET /data/trades — trade history, optionally filtered by market.
    pub async fn trades(&self, condition_id: Option<&str>) -> EngineResult<Vec<TradeRecord>> {
        let path = match condition_id {
            Some(market) => format!("/data/trades?market={}", market),
            None => "/data/trades".to_string(),
        };
        let text = self
            .send_authed("GET", &path, classes::DATA, None, false)
            .await?;
        Self::decode("data/trades", &text)
    }

    /// GET /balance-allowance — requires browser-style headers upstream.
    pub async fn balance_allowance(
        &self,
        asset_type: &str,
        signature_type: u8,
    ) -> EngineResult<BalanceAllowance> {
        let path = format!(
            "/balance-allowance?asset_type={}&signature_type={}",
            asset_type, signature_type
        );
        let text = self
            .send_authed("GET", &path, classes::BALANCE, None, true)
            .await?;
        Self::decode("balance-allowance", &text)
    }
}

// --- Raw wire shapes ---

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct RawMarketWrapper {
    #[serde(default)]
    data: Vec<RawMarketInfo>,
}

#[derive(Debug, Deserialize)]
struct RawMarketInfo {
    #[serde(default)]
    slug: Option<String>,
    #[serde(rename = "condition_id", alias = "conditionId", default)]
    condition_id: Option<String>,
    #[serde(default)]
    tokens: Option<Vec<RawToken>>,
    #[serde(rename = "minimum_tick_size", default)]
    minimum_tick_size: Option<serde_json::Value>,
    #[serde(default)]
    neg_risk: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawToken {
    token_id: Option<String>,
    outcome: Option<String>,
}

impl RawMarketInfo {
    fn resolve(self, slug: &str) -> Option<MarketInfo> {
        let condition_id = self.condition_id?;
        let tokens = self.tokens.unwrap_or_default();

        let up = tokens
            .iter()
            .find(|t| matches!(t.outcome.as_deref(), Some("Up") | Some("Yes")))
            .and_then(|t| t.token_id.clone())?;
        let down = tokens
            .iter()
            .find(|t| matches!(t.outcome.as_deref(), Some("Down") | Some("No")))
            .and_then(|t| t.token_id.clone())?;

        // Tick sizes travel as strings ("0.001") but tolerate numbers.
        let tick_size = match self.minimum_tick_size {
            Some(serde_json::Value::String(s)) => Decimal::from_str(&s).ok(),
            Some(serde_json::Value::Number(n)) => {
                n.as_f64().and_then(Decimal::from_f64_retain)
            }
            _ => None,
        }
        .unwrap_or_else(|| Decimal::new(1, 2));

        Some(MarketInfo {
            slug: self.slug.unwrap_or_else(|| slug.to_string()),
            condition_id,
            up_token_id: up,
            down_token_id: down,
            tick_size,
            neg_risk: self.neg_risk.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_order_status_mapping() {
        let mut record = OpenOrderRecord {
            id: "o1".into(),
            status: "LIVE".into(),
            market: "0xabc".into(),
            asset_id: "tok".into(),
            side: "BUY".into(),
            price: "0.55".into(),
            original_size: "10".into(),
            size_matched: "0".into(),
        };
        assert_eq!(record.runtime_status(), OrderStatus::Live);

        record.size_matched = "4".into();
        assert_eq!(record.runtime_status(), OrderStatus::PartiallyFilled);

        record.status = "MATCHED".into();
        assert_eq!(record.runtime_status(), OrderStatus::Filled);

        record.status = "CANCELED".into();
        assert_eq!(record.runtime_status(), OrderStatus::Cancelled);
    }

    #[test]
    fn market_info_resolves_up_down_tokens() {
        let raw: RawMarketInfo = serde_json::from_str(
            r#"{
                "slug": "btc-updown-15m-1700000000",
                "condition_id": "0xdead",
                "minimum_tick_size": "0.001",
                "tokens": [
                    {"token_id": "111", "outcome": "Up"},
                    {"token_id": "222", "outcome": "Down"}
                ]
            }"#,
        )
        .unwrap();

        let info = raw.resolve("btc-updown-15m-1700000000").unwrap();
        assert_eq!(info.up_token_id, "111");
        assert_eq!(info.down_token_id, "222");
        assert_eq!(info.tick_size, Decimal::new(1, 3));
    }

    #[test]
    fn market_info_missing_tokens_is_none() {
        let raw: RawMarketInfo =
            serde_json::from_str(r#"{"condition_id": "0xdead", "tokens": []}"#).unwrap();
        assert!(raw.resolve("slug").is_none());
    }

    #[test]
    fn balance_parses_base_units() {
        let bal = BalanceAllowance {
            balance: "5123456".into(),
            allowance: "1000000".into(),
        };
        assert_eq!(bal.balance_decimal().to_string(), "5.123456");
        assert_eq!(bal.allowance_decimal().to_string(), "1");
    }
}
