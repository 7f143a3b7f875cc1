use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Settings;
use crate::types::{Direction, TradePlan};

const BASE_URL: &str = "https://api.telegram.org";
const LONG_POLL_SECS: u64 = 25;

/// Outbound operator channel. Only `send` is required; the helpers format
/// the engine's standard messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);

    // ── Convenience helpers ──────────────────────────────────────────────────

    async fn notify_start(&self, symbols: &[String], live: bool) {
        let mode = if live { "🔴 LIVE" } else { "🧪 dry-run" };
        let msg = format!(
            "🤖 <b>Perp Sentinel started</b> ({mode})\nPairs ({}): {}",
            symbols.len(),
            symbols.join(", ")
        );
        self.send(&msg).await;
    }

    async fn notify_trade_open(
        &self,
        symbol: &str,
        plan: &TradePlan,
        confidence: i64,
        reasons: &[String],
    ) {
        let side = plan.direction.side();
        let emoji = if plan.direction == Direction::Long { "🟢" } else { "🔴" };
        let tp1 = plan
            .take_profit_1
            .map(|p| format!("TP1:    <code>{p}</code> ({:.0}%)\n", plan.tp1_ratio * 100.0))
            .unwrap_or_default();
        let msg = format!(
            "{emoji} <b>Trade Opened — {side} {symbol}</b>\n\
             Qty:    <code>{:.4}</code>\n\
             Entry:  <code>{}</code>\n\
             SL:     <code>{}</code>\n\
             {tp1}\
             TP2:    <code>{}</code> ({:.0}%)\n\
             Confidence: <code>{confidence}</code>\n\
             {}",
            plan.size,
            plan.entry,
            plan.stop_loss,
            plan.take_profit_2,
            plan.tp2_ratio * 100.0,
            reasons.join(", "),
        );
        self.send(&msg).await;
    }

    async fn notify_trade_close(
        &self,
        symbol: &str,
        direction: Direction,
        entry: f64,
        exit: f64,
        pnl: f64,
        reason: &str,
    ) {
        let emoji = if pnl >= 0.0 { "✅" } else { "❌" };
        let side = direction.side();
        let msg = format!(
            "{emoji} <b>Trade Closed — {side} {symbol}</b>\n\
             Entry: <code>{entry:.4}</code>  Exit: <code>{exit:.4}</code>\n\
             PnL:   <code>{pnl:+.2} USDT</code>\n\
             Reason: {reason}",
        );
        self.send(&msg).await;
    }

    async fn notify_stop_moved(&self, symbol: &str, label: &str, stop: f64) {
        self.send(&format!("🔁 <b>{symbol}</b>: {label} → <code>{stop}</code>")).await;
    }

    async fn notify_daily_summary(&self, daily_pnl: f64, trades: u32, wins: u32, equity: f64) {
        let win_rate = if trades > 0 { wins as f64 / trades as f64 * 100.0 } else { 0.0 };
        let msg = format!(
            "📊 <b>Daily Summary</b>\n\
             PnL:      <code>{daily_pnl:+.2} USDT</code>\n\
             Trades:   <code>{trades}</code>  Wins: <code>{wins}</code>  WR: <code>{win_rate:.1}%</code>\n\
             Equity:   <code>{equity:.2} USDT</code>",
        );
        self.send(&msg).await;
    }

    async fn notify_risk_alert(&self, message: &str) {
        self.send(&format!("⚠️ <b>Risk Alert</b>\n{message}")).await;
    }

    async fn notify_status(&self, lines: &[String], equity: f64, trading_enabled: bool) {
        let status_flag = if trading_enabled { "✅ active" } else { "⛔ blocked" };
        let header = format!(
            "📡 <b>Heartbeat</b> | {status_flag}\n\
             Equity: <code>${equity:.2}</code>\n\
             ─────────────────────"
        );
        let body = if lines.is_empty() { "No open positions".to_string() } else { lines.join("\n") };
        self.send(&format!("{header}\n{body}")).await;
    }
}

/// Fallback when no bot is configured: messages only reach the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) {
        log::info!("[notify] {}", text.replace('\n', " | "));
    }
}

#[derive(Clone)]
pub struct TelegramBot {
    client: reqwest::Client,
    api: String,
    chat_id: String,
}

impl TelegramBot {
    /// `None` unless both the token and the chat id are set.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let token = settings.telegram_token.as_ref()?;
        let chat_id = settings.telegram_chat_id.clone()?;
        Some(TelegramBot {
            client: reqwest::Client::new(),
            api: format!("{}/bot{}", BASE_URL, token),
            chat_id,
        })
    }

    /// Long-polls `getUpdates` and returns the texts sent from the operator
    /// chat, advancing `offset` past everything seen.
    pub async fn poll_commands(&self, offset: &mut i64) -> Result<Vec<String>, reqwest::Error> {
        let url = format!("{}/getUpdates", self.api);
        let json: Value = self
            .client
            .get(&url)
            .query(&[("offset", offset.to_string()), ("timeout", LONG_POLL_SECS.to_string())])
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .send()
            .await?
            .json()
            .await?;
        Ok(extract_commands(&json, &self.chat_id, offset))
    }
}

fn extract_commands(json: &Value, chat_id: &str, offset: &mut i64) -> Vec<String> {
    let mut texts = Vec::new();
    for update in json["result"].as_array().into_iter().flatten() {
        if let Some(id) = update["update_id"].as_i64() {
            *offset = (*offset).max(id + 1);
        }
        let message = &update["message"];
        let from_chat = message["chat"]["id"].as_i64().map(|id| id.to_string());
        if from_chat.as_deref() != Some(chat_id) {
            if from_chat.is_some() {
                log::warn!("Ignoring command from unknown chat {:?}", from_chat);
            }
            continue;
        }
        if let Some(text) = message["text"].as_str() {
            texts.push(text.to_string());
        }
    }
    texts
}

#[async_trait]
impl Notifier for TelegramBot {
    async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        let url = format!("{}/sendMessage", self.api);
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::info!("Telegram sent: {}", preview.replace('\n', " "));
            }
            Ok(resp) => {
                log::warn!("Telegram error status: {}", resp.status());
            }
            Err(e) => {
                log::warn!("Telegram send failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_operator_chat_is_accepted() {
        let updates = json!({"ok": true, "result": [
            {"update_id": 10, "message": {"chat": {"id": 42}, "text": "/status"}},
            {"update_id": 11, "message": {"chat": {"id": 7}, "text": "/halt"}},
            {"update_id": 12, "edited_message": {"chat": {"id": 42}, "text": "/pause"}}
        ]});
        let mut offset = 0;
        let cmds = extract_commands(&updates, "42", &mut offset);
        assert_eq!(cmds, vec!["/status"]);
        assert_eq!(offset, 13);
    }

    #[test]
    fn bot_requires_token_and_chat() {
        let mut settings = crate::config::tests::settings();
        assert!(TelegramBot::from_settings(&settings).is_none());
        settings.telegram_token = Some("t".into());
        assert!(TelegramBot::from_settings(&settings).is_none());
        settings.telegram_chat_id = Some("42".into());
        assert!(TelegramBot::from_settings(&settings).is_some());
    }
}
