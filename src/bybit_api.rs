use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{Config, BYBIT_PUBLIC_URL, BYBIT_REST_URL};
use crate::error::{ConfigError, VenueError};
use crate::exchange::Venue;
use crate::types::{Candle, Fill, FillResult, PositionSide, Side, VenuePosition};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";
const KLINE_PAGE_LIMIT: usize = 1000;
const MAX_RETRIES: u32 = 3;

// ── Error classification ─────────────────────────────────────────────────────

/// Classify a Bybit retCode + HTTP status into a VenueError.
fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> VenueError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => VenueError::RateLimit { retry_after: 10 },
        (10016, _) | (_, 500..=599) => VenueError::Transient(msg.to_string()),
        // invalid key, bad signature, permission denied, account banned
        (10003 | 10004 | 10005 | 33004, _) | (_, 401 | 403) => {
            VenueError::Fatal(format!("retCode={} msg={}", ret_code, msg))
        }
        _ => VenueError::Permanent(format!("retCode={} msg={}", ret_code, msg)),
    }
}

/// Retry rate limits and transient failures with exponential backoff
/// (1s doubling, capped at 60s). Permanent and fatal errors return at once.
async fn with_retry<F, Fut, T>(operation: F, max_retries: u32) -> Result<T, VenueError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut retries = 0;
    let mut delay: u64 = 1;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(VenueError::RateLimit { retry_after }) => {
                if retries >= max_retries {
                    return Err(VenueError::RateLimit { retry_after });
                }
                log::warn!("Rate limited, sleeping {}s (attempt {}/{})", retry_after, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                retries += 1;
            }
            Err(VenueError::Transient(msg)) => {
                if retries >= max_retries {
                    return Err(VenueError::Transient(msg));
                }
                log::warn!("Transient error: {} (retry in {}s, {}/{})", msg, delay, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(60);
                retries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Response parsing ─────────────────────────────────────────────────────────

fn str_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_str().and_then(|s| s.parse().ok())
}

fn parse_kline_row(row: &serde_json::Value) -> Option<Candle> {
    let arr = row.as_array()?;
    Some(Candle {
        timestamp: arr.first()?.as_str()?.parse().ok()?,
        open: str_f64(arr.get(1)?)?,
        high: str_f64(arr.get(2)?)?,
        low: str_f64(arr.get(3)?)?,
        close: str_f64(arr.get(4)?)?,
        volume: str_f64(arr.get(5)?)?,
    })
}

/// Sort oldest-first and keep one candle per timestamp (last one wins).
fn normalize_candles(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.timestamp);
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());
    for c in candles {
        match out.last_mut() {
            Some(last) if last.timestamp == c.timestamp => *last = c,
            _ => out.push(c),
        }
    }
    out
}

fn parse_position(json: &serde_json::Value) -> VenuePosition {
    let entry = match json["result"]["list"].as_array().and_then(|a| a.first()) {
        Some(e) => e,
        None => return VenuePosition::default(),
    };
    let size = str_f64(&entry["size"]).unwrap_or(0.0);
    if size == 0.0 {
        return VenuePosition::default();
    }
    let side = match entry["side"].as_str() {
        Some("Buy") => PositionSide::Long,
        Some("Sell") => PositionSide::Short,
        _ => PositionSide::Flat,
    };
    VenuePosition {
        side,
        size,
        avg_price: str_f64(&entry["avgPrice"]).filter(|p| *p > 0.0),
    }
}

fn parse_balance(json: &serde_json::Value) -> Option<f64> {
    let account = json["result"]["list"].as_array()?.first()?;
    str_f64(&account["totalAvailableBalance"]).or_else(|| {
        account["coin"]
            .as_array()?
            .iter()
            .find(|c| c["coin"] == "USDT")
            .and_then(|c| str_f64(&c["walletBalance"]))
    })
}

/// Decimal places implied by a quantity step (0.01 → 2).
pub fn step_decimals(step: f64) -> usize {
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 8 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    public_url: String,
    symbol: String,
    qty_decimals: usize,
    api_key: String,
    api_secret: String,
}

impl BybitClient {
    /// Credentials come from BYBIT_API_KEY / BYBIT_SECRET; BYBIT_REST_URL
    /// overrides the demo endpoint.
    pub fn from_env(cfg: &Config) -> Result<Self, ConfigError> {
        let api_key = std::env::var("BYBIT_API_KEY").map_err(|_| ConfigError::Missing("BYBIT_API_KEY"))?;
        let api_secret = std::env::var("BYBIT_SECRET").map_err(|_| ConfigError::Missing("BYBIT_SECRET"))?;
        let base_url = std::env::var("BYBIT_REST_URL").unwrap_or_else(|_| BYBIT_REST_URL.to_string());
        Self::new(cfg, base_url, api_key, api_secret)
    }

    pub fn new(
        cfg: &Config,
        base_url: String,
        api_key: String,
        api_secret: String,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client build failed: {e}")))?;

        Ok(BybitClient {
            client,
            base_url,
            public_url: BYBIT_PUBLIC_URL.to_string(),
            symbol: cfg.symbol.clone(),
            qty_decimals: step_decimals(cfg.qty_step),
            api_key,
            api_secret,
        })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn sign(&self, payload: &str) -> Result<String, VenueError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| VenueError::Fatal(format!("HMAC init failed: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// (timestamp, signature) for a query string or JSON body.
    fn auth(&self, payload: &str) -> Result<(String, String), VenueError> {
        let ts = Self::timestamp_ms().to_string();
        let signature = self.sign(&format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW, payload))?;
        Ok((ts, signature))
    }

    async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value, VenueError> {
        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Transient(format!("Parse error: {}", e)))?;

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json)
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    // ── Internal raw methods (no retry) ──────────────────────────────────────

    async fn public_get(&self, path: &str, query: &str) -> Result<serde_json::Value, VenueError> {
        let url = format!("{}{}?{}", self.public_url, path, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VenueError::Transient(format!("HTTP error: {}", e)))?;
        Self::read_json(resp).await
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<serde_json::Value, VenueError> {
        let (ts, signature) = self.auth(query)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .send()
            .await
            .map_err(|e| VenueError::Transient(format!("HTTP error: {}", e)))?;
        Self::read_json(resp).await
    }

    async fn signed_post(&self, path: &str, body: String) -> Result<serde_json::Value, VenueError> {
        let (ts, signature) = self.auth(&body)?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| VenueError::Transient(format!("HTTP error: {}", e)))?;
        Self::read_json(resp).await
    }

    async fn fetch_kline_page(
        &self,
        symbol: &str,
        interval: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>, VenueError> {
        let query = format!(
            "category=linear&symbol={}&interval={}&start={}&end={}&limit={}",
            symbol, interval, from_ms, to_ms, KLINE_PAGE_LIMIT
        );
        let json = with_retry(|| self.public_get("/v5/market/kline", &query), MAX_RETRIES).await?;
        let list = json["result"]["list"]
            .as_array()
            .ok_or_else(|| VenueError::Transient("missing result.list".into()))?;
        Ok(list.iter().filter_map(parse_kline_row).collect())
    }

    async fn last_price(&self) -> Result<f64, VenueError> {
        let query = format!("category=linear&symbol={}", self.symbol);
        let json = with_retry(|| self.public_get("/v5/market/tickers", &query), MAX_RETRIES).await?;
        json["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .and_then(|t| str_f64(&t["lastPrice"]))
            .ok_or_else(|| VenueError::Transient("ticker without lastPrice".into()))
    }

    /// Average fill of a just-placed market order; falls back to the last
    /// traded price when the order is not yet visible.
    async fn fill_for(&self, order_id: &str, requested_qty: f64) -> Result<Fill, VenueError> {
        let query = format!("category=linear&symbol={}&orderId={}", self.symbol, order_id);
        let order = self
            .signed_get("/v5/order/realtime", &query)
            .await
            .ok()
            .and_then(|json| json["result"]["list"].as_array().and_then(|l| l.first()).cloned());

        let avg = order.as_ref().and_then(|o| str_f64(&o["avgPrice"])).filter(|p| *p > 0.0);
        let qty = order
            .as_ref()
            .and_then(|o| str_f64(&o["cumExecQty"]))
            .filter(|q| *q > 0.0)
            .unwrap_or(requested_qty);
        let price = match avg {
            Some(p) => p,
            None => self.last_price().await?,
        };
        Ok(Fill { price, qty })
    }

    /// Market order. Rejections by the matching engine come back as
    /// `FillResult::Rejected`; transport failures as errors.
    async fn market_order(&self, side: Side, qty: f64, reduce_only: bool) -> Result<FillResult, VenueError> {
        let bybit_side = match side {
            Side::Long => "Buy",
            Side::Short => "Sell",
        };
        let body = serde_json::json!({
            "category":    "linear",
            "symbol":      self.symbol,
            "side":        bybit_side,
            "orderType":   "Market",
            "qty":         format!("{:.*}", self.qty_decimals, qty),
            "reduceOnly":  reduce_only,
            "timeInForce": "IOC"
        })
        .to_string();

        // Orders are not retried: a lost response could otherwise double the exposure.
        let json = match self.signed_post("/v5/order/create", body).await {
            Ok(json) => json,
            Err(VenueError::Permanent(msg)) => return Ok(FillResult::Rejected { reason: msg }),
            Err(e) => return Err(e),
        };
        let order_id = json["result"]["orderId"].as_str().unwrap_or_default().to_string();
        log::info!(
            "[{}] Order placed: {} qty={:.*} reduceOnly={} orderId={}",
            self.symbol, bybit_side, self.qty_decimals, qty, reduce_only, order_id
        );
        Ok(FillResult::Filled(self.fill_for(&order_id, qty).await?))
    }
}

#[async_trait]
impl Venue for BybitClient {
    /// Pages backwards from `to_ms` until the range is covered.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>, VenueError> {
        let mut all = Vec::new();
        let mut end = to_ms;
        loop {
            let page = self.fetch_kline_page(symbol, interval, from_ms, end).await?;
            let full = page.len() >= KLINE_PAGE_LIMIT;
            let oldest = page.iter().map(|c| c.timestamp).min();
            all.extend(page);
            match oldest {
                Some(ts) if full && ts > from_ms => end = ts - 1,
                _ => break,
            }
        }
        Ok(normalize_candles(all))
    }

    async fn get_balance(&self) -> Result<f64, VenueError> {
        let query = "accountType=UNIFIED&coin=USDT";
        let json = with_retry(|| self.signed_get("/v5/account/wallet-balance", query), MAX_RETRIES).await?;
        parse_balance(&json).ok_or_else(|| VenueError::Transient("wallet-balance: no USDT balance".into()))
    }

    async fn get_position(&self) -> Result<VenuePosition, VenueError> {
        let query = format!("category=linear&symbol={}", self.symbol);
        let json = with_retry(|| self.signed_get("/v5/position/list", &query), MAX_RETRIES).await?;
        Ok(parse_position(&json))
    }

    async fn open_long(&self, qty: f64) -> Result<FillResult, VenueError> {
        self.market_order(Side::Long, qty, false).await
    }

    async fn open_short(&self, qty: f64) -> Result<FillResult, VenueError> {
        self.market_order(Side::Short, qty, false).await
    }

    async fn close_position(&self) -> Result<FillResult, VenueError> {
        let pos = self.get_position().await?;
        match pos.side.side() {
            Some(side) => self.market_order(side.opposite(), pos.size, true).await,
            None => Ok(FillResult::Rejected { reason: "venue reports no open position".into() }),
        }
    }
}
