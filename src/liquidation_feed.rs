use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::{BYBIT_WS_URL, LIQ_WS_RECONNECT_DELAY};
use crate::types::Liquidation;

const PING_INTERVAL_SECS: u64 = 20;

/// Streams forced liquidations for a symbol set into a channel.
pub struct LiquidationFeed {
    url: String,
    symbols: Vec<String>,
    tx: mpsc::Sender<Liquidation>,
}

type WsError = Box<dyn std::error::Error + Send + Sync>;

impl LiquidationFeed {
    pub fn new(symbols: &[String], tx: mpsc::Sender<Liquidation>) -> Self {
        LiquidationFeed { url: BYBIT_WS_URL.to_string(), symbols: symbols.to_vec(), tx }
    }

    /// Reconnects after a fixed delay until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect(&shutdown) => match result {
                    Ok(()) => break,
                    Err(e) => log::warn!(
                        "Liquidation WS dropped: {}. Reconnect in {}s…",
                        e,
                        LIQ_WS_RECONNECT_DELAY.as_secs()
                    ),
                },
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(LIQ_WS_RECONNECT_DELAY) => {}
            }
        }
        log::info!("Liquidation feed stopped");
    }

    /// One connection lifetime. `Ok` only on shutdown or when the receiver
    /// side is gone.
    async fn connect(&self, shutdown: &CancellationToken) -> Result<(), WsError> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        log::info!("Liquidation WS connected ({})", self.url);

        let (mut write, mut read) = ws_stream.split();

        // Bybit caps args per subscribe request
        let args: Vec<String> =
            self.symbols.iter().map(|s| format!("allLiquidation.{}", s)).collect();
        for chunk in args.chunks(10) {
            let sub_msg = json!({ "op": "subscribe", "args": chunk });
            write.send(Message::Text(sub_msg.to_string())).await?;
        }
        log::info!("Subscribed to liquidations for {} symbols", self.symbols.len());

        let mut ping_timer = interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_timer.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping_timer.tick() => {
                    let ping = json!({"op": "ping"}).to_string();
                    write.send(Message::Text(ping)).await?;
                    log::debug!("Liquidation WS ping sent");
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(data) = serde_json::from_str::<Value>(&text) else { continue };
                        for liq in parse_liquidations(&data) {
                            if self.tx.send(liq).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Err("closed by server".into()),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err("stream ended".into()),
                    _ => {}
                },
            }
        }
    }
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn str_f64(v: &Value) -> f64 {
    v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()).unwrap_or(0.0)
}

/// Accepts both the `allLiquidation` array payload and the older single-
/// object `liquidation` payload. Pongs and op acks yield nothing.
pub fn parse_liquidations(msg: &Value) -> Vec<Liquidation> {
    let Some(topic) = msg["topic"].as_str() else {
        return Vec::new();
    };
    let data = &msg["data"];
    if topic.starts_with("allLiquidation.") {
        data.as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|d| {
                        Some(Liquidation {
                            symbol: d["s"].as_str()?.to_string(),
                            side: d["S"].as_str()?.to_string(),
                            price: str_f64(&d["p"]),
                            qty: str_f64(&d["v"]),
                            timestamp: ms_to_utc(d["T"].as_i64().unwrap_or_default()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    } else if topic.starts_with("liquidation.") {
        let Some(symbol) = data["symbol"].as_str() else {
            return Vec::new();
        };
        vec![Liquidation {
            symbol: symbol.to_string(),
            side: data["side"].as_str().unwrap_or_default().to_string(),
            price: str_f64(&data["price"]),
            qty: str_f64(&data["size"]),
            timestamp: ms_to_utc(data["updatedTime"].as_i64().unwrap_or_default()),
        }]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_liquidation_batches() {
        let msg = json!({
            "topic": "allLiquidation.BTCUSDT",
            "type": "snapshot",
            "ts": 1739502303204i64,
            "data": [
                {"T": 1739502302929i64, "s": "BTCUSDT", "S": "Sell", "v": "2.5", "p": "96000"},
                {"T": 1739502302930i64, "s": "BTCUSDT", "S": "Buy", "v": "0.01", "p": "96010"}
            ]
        });
        let liqs = parse_liquidations(&msg);
        assert_eq!(liqs.len(), 2);
        assert_eq!(liqs[0].side, "Sell");
        assert_eq!(liqs[0].value_usdt(), 240_000.0);
        assert_eq!(liqs[0].timestamp.timestamp_millis(), 1739502302929);
    }

    #[test]
    fn parses_legacy_single_payload() {
        let msg = json!({
            "topic": "liquidation.ETHUSDT",
            "data": {"updatedTime": 1673251091822i64, "symbol": "ETHUSDT", "side": "Buy", "size": "20", "price": "1300"}
        });
        let liqs = parse_liquidations(&msg);
        assert_eq!(liqs.len(), 1);
        assert_eq!(liqs[0].symbol, "ETHUSDT");
        assert_eq!(liqs[0].value_usdt(), 26_000.0);
    }

    #[test]
    fn ignores_control_frames() {
        assert!(parse_liquidations(&json!({"op": "pong", "success": true})).is_empty());
        assert!(parse_liquidations(&json!({"topic": "kline.1.BTCUSDT", "data": []})).is_empty());
    }
}
