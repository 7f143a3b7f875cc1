use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::config::{Settings, BYBIT_PUBLIC_REST_URL, NETWORK_TIMEOUT};
use crate::error::{EngineError, ExchangeError};
use crate::exchange::Exchange;
use crate::types::{
    decimals_of, round_to, Balance, Candle, Direction, ExchangePosition, InstrumentSpec,
    OrderRequest,
};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";
/// "leverage not modified"
const RET_LEVERAGE_UNCHANGED: i64 = 110043;

// ── Error classification ──────────────────────────────────────────────────────

/// Classify a Bybit retCode + HTTP status into an ExchangeError.
fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> ExchangeError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => ExchangeError::RateLimit { retry_after: RATE_LIMIT_BACKOFF_SECS },
        (10016, _) | (_, 500..=599) => ExchangeError::Transient(msg.to_string()),
        _ => ExchangeError::Permanent(format!("retCode={} msg={}", ret_code, msg)),
    }
}

/// Bybit request limits reset per second; a short back-off is enough.
const RATE_LIMIT_BACKOFF_SECS: u64 = 2;
/// Sleeps between attempts never run past this, so a retried call still
/// fits inside the caller's network timeout.
const RETRY_BUDGET: Duration = NETWORK_TIMEOUT;

/// Generic retry wrapper with exponential backoff. A retry whose wait would
/// end past [`RETRY_BUDGET`] is not attempted; the last error is returned.
async fn with_retry<F, Fut, T>(operation: F, max_retries: u32) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let deadline = Instant::now() + RETRY_BUDGET;
    let mut retries = 0;
    let mut delay: u64 = 1;
    loop {
        let err = match operation().await {
            Ok(r) => return Ok(r),
            Err(e) => e,
        };
        let wait = match &err {
            ExchangeError::RateLimit { retry_after } => Duration::from_secs(*retry_after),
            e if e.is_transient() => Duration::from_secs(delay),
            _ => return Err(err),
        };
        if retries >= max_retries || Instant::now() + wait > deadline {
            return Err(err);
        }
        log::warn!("{}, retry in {}s ({}/{})", err, wait.as_secs(), retries + 1, max_retries);
        tokio::time::sleep(wait).await;
        if !matches!(err, ExchangeError::RateLimit { .. }) {
            delay = (delay * 2).min(60);
        }
        retries += 1;
    }
}

fn num(v: &Value) -> f64 {
    v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()).unwrap_or(0.0)
}

fn fmt_decimals(value: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, round_to(value, decimals))
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    public_url: String,
    api_key: String,
    api_secret: String,
}

impl BybitClient {
    pub fn new(settings: &Settings) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(NETWORK_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(BybitClient {
            client,
            base_url: settings.rest_url.trim_end_matches('/').to_string(),
            public_url: BYBIT_PUBLIC_REST_URL.to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
        })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Permanent(format!("HMAC init failed: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// X-BAPI-* auth headers over `ts + key + recvWindow + (query | body)`.
    fn auth_headers(&self, signed_part: &str) -> Result<reqwest::header::HeaderMap, ExchangeError> {
        let ts = Self::timestamp_ms().to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW, signed_part);
        let signature = self.sign(&payload)?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in [
            ("x-bapi-api-key", self.api_key.as_str()),
            ("x-bapi-timestamp", ts.as_str()),
            ("x-bapi-sign", signature.as_str()),
            ("x-bapi-recv-window", RECV_WINDOW),
            ("content-type", "application/json"),
        ] {
            let value: reqwest::header::HeaderValue = value
                .parse()
                .map_err(|_| ExchangeError::Permanent(format!("invalid header value for {name}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Checks the `{retCode, retMsg, result}` envelope and returns `result`.
    async fn envelope(resp: reqwest::Response) -> Result<Value, ExchangeError> {
        let http_status = resp.status().as_u16();
        let json: Value = resp
            .json()
            .await
            .map_err(|e| match http_status {
                429 => ExchangeError::RateLimit { retry_after: RATE_LIMIT_BACKOFF_SECS },
                _ => ExchangeError::Transient(format!("Parse error: {}", e)),
            })?;

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json["result"].clone())
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.public_url, path, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::envelope(resp).await
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .client
            .get(&url)
            .headers(self.auth_headers(query)?)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::envelope(resp).await
    }

    async fn signed_post(&self, path: &str, body: Value) -> Result<Value, ExchangeError> {
        let body = body.to_string();
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .headers(self.auth_headers(&body)?)
            .body(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::envelope(resp).await
    }

    // ── Internal raw methods (no retry) ──────────────────────────────────────

    async fn fetch_klines_raw(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&interval={}&limit={}",
            symbol, interval, limit
        );
        let result = self.public_get("/v5/market/kline", &query).await?;
        let list = result["list"]
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("missing result.list".into()))?;
        Ok(parse_klines(list))
    }

    async fn market_entry_raw(&self, order: &OrderRequest, attach_tp: bool) -> Result<String, ExchangeError> {
        let mut body = serde_json::json!({
            "category":    "linear",
            "symbol":      order.symbol,
            "side":        order.direction.side(),
            "orderType":   "Market",
            "qty":         fmt_decimals(order.size, order.qty_decimals),
            "stopLoss":    fmt_decimals(order.stop_loss, order.price_decimals),
            "tpslMode":    "Full",
            "timeInForce": "GTC"
        });
        if attach_tp {
            body["takeProfit"] = Value::String(fmt_decimals(order.take_profit, order.price_decimals));
        }
        let result = self.signed_post("/v5/order/create", body).await?;
        Ok(result["orderId"].as_str().unwrap_or("unknown").to_string())
    }

    /// Reduce-only limit exit for part of the position.
    async fn take_profit_raw(
        &self,
        order: &OrderRequest,
        price: f64,
        qty: f64,
    ) -> Result<String, ExchangeError> {
        let exit_side = order.direction.opposite().side();
        let body = serde_json::json!({
            "category":    "linear",
            "symbol":      order.symbol,
            "side":        exit_side,
            "orderType":   "Limit",
            "qty":         fmt_decimals(qty, order.qty_decimals),
            "price":       fmt_decimals(price, order.price_decimals),
            "reduceOnly":  true,
            "timeInForce": "GTC"
        });
        let result = self.signed_post("/v5/order/create", body).await?;
        Ok(result["orderId"].as_str().unwrap_or("unknown").to_string())
    }

    async fn trading_stop_raw(
        &self,
        symbol: &str,
        price: f64,
        price_decimals: u32,
    ) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category":    "linear",
            "symbol":      symbol,
            "stopLoss":    fmt_decimals(price, price_decimals),
            "tpslMode":    "Full",
            "positionIdx": 0
        });
        self.signed_post("/v5/position/trading-stop", body).await.map(|_| ())
    }

    async fn set_leverage_raw(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category":     "linear",
            "symbol":       symbol,
            "buyLeverage":  leverage.to_string(),
            "sellLeverage": leverage.to_string()
        });
        match self.signed_post("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Permanent(msg)) if msg.contains(&RET_LEVERAGE_UNCHANGED.to_string()) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Bybit returns newest-first string arrays; output is oldest-first.
fn parse_klines(list: &[Value]) -> Vec<Candle> {
    let mut candles: Vec<Candle> = list
        .iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            if arr.len() < 6 {
                return None;
            }
            let ts: i64 = arr[0].as_str()?.parse().ok()?;
            Some(Candle {
                timestamp: ts,
                open: arr[1].as_str()?.parse().ok()?,
                high: arr[2].as_str()?.parse().ok()?,
                low: arr[3].as_str()?.parse().ok()?,
                close: arr[4].as_str()?.parse().ok()?,
                volume: arr[5].as_str()?.parse().ok()?,
            })
        })
        .collect();
    candles.reverse();
    candles
}

fn parse_positions(list: &[Value]) -> Vec<ExchangePosition> {
    list.iter()
        .filter_map(|entry| {
            let size = num(&entry["size"]);
            if size == 0.0 {
                return None;
            }
            Some(ExchangePosition {
                symbol: entry["symbol"].as_str()?.to_string(),
                direction: Direction::from_side(entry["side"].as_str().unwrap_or("Buy")),
                size,
                entry_price: num(&entry["avgPrice"]),
                unrealized_pnl: num(&entry["unrealisedPnl"]),
                stop_loss: num(&entry["stopLoss"]),
            })
        })
        .collect()
}

fn parse_balance(result: &Value) -> Option<Balance> {
    let account = result["list"].as_array()?.first()?;
    let total = num(&account["totalEquity"]);
    let free = num(&account["totalAvailableBalance"]);
    Some(Balance { total, free, used: (total - free).max(0.0) })
}

// ── Exchange impl (with retry) ────────────────────────────────────────────────

#[async_trait]
impl Exchange for BybitClient {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        with_retry(|| self.fetch_klines_raw(symbol, interval, limit), 3).await
    }

    async fn fetch_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let result = with_retry(
            || self.signed_get("/v5/position/list", "category=linear&settleCoin=USDT&limit=200"),
            3,
        )
        .await?;
        Ok(result["list"].as_array().map(|l| parse_positions(l)).unwrap_or_default())
    }

    async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        // Connectivity is judged on this call; the watchdog counts failures,
        // so no retry here.
        let result = self.signed_get("/v5/account/wallet-balance", "accountType=UNIFIED").await?;
        parse_balance(&result)
            .ok_or_else(|| ExchangeError::Transient("wallet-balance: empty account list".into()))
    }

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result = with_retry(|| self.public_get("/v5/market/tickers", &query), 3).await?;
        let price = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .map(|t| num(&t["lastPrice"]))
            .unwrap_or(0.0);
        if price > 0.0 {
            Ok(price)
        } else {
            Err(ExchangeError::Transient(format!("{symbol}: no last price")))
        }
    }

    /// Entry is not retried: a failure counts toward the loss streak and the
    /// cycle is abandoned. The target is attached here only without a split.
    async fn place_order(&self, order: &OrderRequest) -> Result<String, ExchangeError> {
        let order_id = self.market_entry_raw(order, order.partial_legs().is_none()).await?;
        log::info!(
            "[{}] Order placed: {} qty={:.4} sl={} orderId={}",
            order.symbol,
            order.direction.side(),
            order.size,
            order.stop_loss,
            order_id
        );
        Ok(order_id)
    }

    /// Both legs are attempted; the last failure is returned.
    async fn place_take_profits(&self, order: &OrderRequest) -> Result<(), ExchangeError> {
        let Some(legs) = order.partial_legs() else {
            return Ok(());
        };
        let mut result = Ok(());
        for (price, qty) in legs {
            if qty <= 0.0 {
                continue;
            }
            match with_retry(|| self.take_profit_raw(order, price, qty), 3).await {
                Ok(id) => log::info!("[{}] TP {} qty={} orderId={}", order.symbol, price, qty, id),
                Err(e) => {
                    log::error!("[{}] TP {} placement failed: {}", order.symbol, price, e);
                    result = Err(e);
                }
            }
        }
        result
    }

    async fn update_stop_loss(
        &self,
        symbol: &str,
        price: f64,
        price_decimals: u32,
    ) -> Result<(), ExchangeError> {
        with_retry(|| self.trading_stop_raw(symbol, price, price_decimals), 3).await?;
        log::info!("[{}] Stop-loss updated → {}", symbol, fmt_decimals(price, price_decimals));
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        with_retry(|| self.set_leverage_raw(symbol, leverage), 3).await
    }

    /// All trading USDT linear perpetuals, sorted.
    async fn fetch_linear_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        let result = with_retry(
            || self.public_get("/v5/market/instruments-info", "category=linear&status=Trading&limit=1000"),
            3,
        )
        .await?;
        let list = result["list"]
            .as_array()
            .ok_or_else(|| ExchangeError::Permanent("instruments-info: missing list".into()))?;

        let mut symbols: Vec<String> = list
            .iter()
            .filter_map(|item| {
                let symbol = item["symbol"].as_str()?;
                let quote = item["quoteCoin"].as_str()?;
                if quote == "USDT" { Some(symbol.to_string()) } else { None }
            })
            .collect();
        symbols.sort();
        Ok(symbols)
    }

    async fn fetch_instrument(&self, symbol: &str) -> Result<InstrumentSpec, ExchangeError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result =
            with_retry(|| self.public_get("/v5/market/instruments-info", &query), 3).await?;
        let item = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| ExchangeError::Permanent(format!("{symbol}: unknown instrument")))?;
        let spec = InstrumentSpec {
            tick_size: num(&item["priceFilter"]["tickSize"]),
            qty_step: num(&item["lotSizeFilter"]["qtyStep"]),
        };
        if spec.tick_size <= 0.0 || spec.qty_step <= 0.0 {
            return Err(ExchangeError::Permanent(format!("{symbol}: malformed instrument filters")));
        }
        log::debug!(
            "[{}] tick={} ({} dp) qtyStep={} ({} dp)",
            symbol,
            spec.tick_size,
            spec.price_decimals(),
            spec.qty_step,
            decimals_of(spec.qty_step)
        );
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_classification_matches_retcodes() {
        assert!(matches!(classify_error(10006, 200, ""), ExchangeError::RateLimit { .. }));
        assert!(matches!(classify_error(0, 429, ""), ExchangeError::RateLimit { .. }));
        assert!(matches!(classify_error(10016, 200, ""), ExchangeError::Transient(_)));
        assert!(matches!(classify_error(-1, 503, ""), ExchangeError::Transient(_)));
        assert!(matches!(classify_error(110007, 200, ""), ExchangeError::Permanent(_)));
    }

    #[test]
    fn klines_come_back_oldest_first() {
        let list = json!([
            ["2000", "2", "3", "1", "2.5", "10"],
            ["1000", "1", "2", "0.5", "1.5", "20"],
            ["bad"]
        ]);
        let candles = parse_klines(list.as_array().unwrap());
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, 1000);
        assert_eq!(candles[1].close, 2.5);
    }

    #[test]
    fn positions_skip_flat_entries() {
        let list = json!([
            {"symbol": "BTCUSDT", "side": "Sell", "size": "0.5", "avgPrice": "100", "unrealisedPnl": "-1.5", "stopLoss": "102"},
            {"symbol": "ETHUSDT", "side": "", "size": "0", "avgPrice": "0", "unrealisedPnl": "0", "stopLoss": ""}
        ]);
        let positions = parse_positions(list.as_array().unwrap());
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].direction, Direction::Short);
        assert_eq!(positions[0].stop_loss, 102.0);
        assert_eq!(positions[0].unrealized_pnl, -1.5);
    }

    #[test]
    fn balance_reads_unified_account() {
        let result = json!({"list": [{"totalEquity": "1050.5", "totalAvailableBalance": "1000.5"}]});
        let b = parse_balance(&result).unwrap();
        assert_eq!(b.total, 1050.5);
        assert_eq!(b.free, 1000.5);
        assert!((b.used - 50.0).abs() < 1e-9);
        assert!(parse_balance(&json!({"list": []})).is_none());
    }

    #[test]
    fn quantities_are_formatted_to_precision() {
        assert_eq!(fmt_decimals(0.1 + 0.2, 3), "0.300");
        assert_eq!(fmt_decimals(27_123.456, 1), "27123.5");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_on_permanent_errors() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(ExchangeError::Permanent("bad qty".into())) }
            },
            3,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        calls.store(0, std::sync::atomic::Ordering::SeqCst);
        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(ExchangeError::Transient("502".into())) }
            },
            3,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }
}
