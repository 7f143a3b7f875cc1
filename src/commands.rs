//! Operator chat commands.

use chrono::Utc;

use crate::engine::{status_lines, EngineContext};
use crate::exchange::with_timeout;
use crate::overrides::OverrideState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Pause,
    Resume,
    Halt,
    Status,
    Positions,
    Balance,
    Risk,
    Reoptimize,
    ResetEmergency,
    Help,
    Unknown(String),
}

impl Command {
    /// `/status@my_bot extra` → `Status`. Case-insensitive.
    pub fn parse(text: &str) -> Command {
        let word = text.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default().to_lowercase();
        match name.as_str() {
            "/start" => Command::Start,
            "/stop" => Command::Stop,
            "/pause" => Command::Pause,
            "/resume" => Command::Resume,
            "/halt" => Command::Halt,
            "/status" => Command::Status,
            "/positions" => Command::Positions,
            "/balance" => Command::Balance,
            "/risk" => Command::Risk,
            "/reoptimize" => Command::Reoptimize,
            "/reset_emergency" => Command::ResetEmergency,
            "/help" => Command::Help,
            _ => Command::Unknown(text.trim().to_string()),
        }
    }
}

const HELP: &str = "<b>Commands</b>\n\
/start – resume entries (clears stop, halt and pause)\n\
/stop – stop new entries\n\
/pause – pause new entries\n\
/resume – lift the pause\n\
/halt – stop new entries and persist the halt flag\n\
/status – engine state\n\
/positions – tracked positions\n\
/balance – account balance\n\
/risk – risk limits and breaker state\n\
/reoptimize – reload weight and SL/TP tables\n\
/reset_emergency – clear the emergency stop\n\
/help – this message";

/// Applies `cmd` and returns the reply text.
pub async fn handle(ctx: &EngineContext, cmd: Command) -> String {
    match cmd {
        Command::Start => {
            ctx.overrides.set_halted(false);
            ctx.overrides.set_paused(false);
            for flag in [&ctx.settings.halt_flag, &ctx.settings.pause_flag] {
                if let Err(e) = tokio::fs::remove_file(flag).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Cannot remove {}: {}", flag.display(), e);
                    }
                }
            }
            "▶️ Entries enabled".to_string()
        }
        Command::Stop => {
            ctx.overrides.set_halted(true);
            "⏹ Entries stopped. Open positions stay monitored.".to_string()
        }
        Command::Pause => {
            ctx.overrides.set_paused(true);
            "⏸ Entries paused".to_string()
        }
        Command::Resume => {
            ctx.overrides.set_paused(false);
            match ctx.overrides.state().await {
                OverrideState::Running => "▶️ Entries resumed".to_string(),
                other => format!("Pause lifted, still {:?}", other),
            }
        }
        Command::Halt => {
            ctx.overrides.set_halted(true);
            if let Err(e) = tokio::fs::write(&ctx.settings.halt_flag, b"halted via chat\n").await {
                log::warn!("Cannot write {}: {}", ctx.settings.halt_flag.display(), e);
            }
            "🛑 Halted. Remove the halt flag or send /start to resume.".to_string()
        }
        Command::Status => status(ctx).await,
        Command::Positions => {
            let lines = status_lines(ctx);
            if lines.is_empty() {
                "No open positions".to_string()
            } else {
                lines.join("\n")
            }
        }
        Command::Balance => match with_timeout(ctx.exchange.fetch_balance()).await {
            Ok(b) => format!(
                "💰 Total <code>{:.2}</code> | Free <code>{:.2}</code> | Used <code>{:.2}</code> USDT",
                b.total, b.free, b.used
            ),
            Err(e) => format!("Balance unavailable: {e}"),
        },
        Command::Risk => risk(ctx),
        Command::Reoptimize => {
            let lines = ctx.reload_tables();
            format!("🔄 Reloaded\n{}", lines.join("\n"))
        }
        Command::ResetEmergency => {
            if ctx.breaker.reset_emergency() {
                log::warn!("Emergency stop cleared by operator");
                "✅ Emergency stop cleared".to_string()
            } else {
                "No emergency stop active".to_string()
            }
        }
        Command::Help => HELP.to_string(),
        Command::Unknown(text) => format!("Unknown command {text:?}. Try /help"),
    }
}

async fn status(ctx: &EngineContext) -> String {
    let now = Utc::now();
    let overrides = ctx.overrides.state().await;
    let breaker = ctx.breaker.blocking_reason(now);
    let verdict = ctx.risk.verdict();
    let cb = ctx.breaker.snapshot();
    format!(
        "📡 <b>Status</b>\n\
         Mode: {}\n\
         Operator: {:?}\n\
         Breaker: {}\n\
         Risk: {}\n\
         Regime: {:?}\n\
         Tracked positions: {}\n\
         Weights: v{}",
        if ctx.settings.live_mode { "live" } else { "dry-run" },
        overrides,
        breaker.map_or("clear".to_string(), |b| format!("{b:?}")),
        verdict.describe(),
        cb.regime,
        ctx.registry.len(),
        ctx.weights.snapshot().version,
    )
}

fn risk(ctx: &EngineContext) -> String {
    let st = ctx.risk.state();
    let limits = ctx.risk.limits();
    let cb = ctx.breaker.snapshot();
    let fmt = |v: Option<f64>| v.map_or("n/a".to_string(), |x| format!("{x:.2}"));
    let cooldown = cb
        .cooldown_until
        .map_or("none".to_string(), |t| format!("until {} UTC", t.format("%H:%M")));
    format!(
        "⚖️ <b>Risk</b>\n\
         Equity: {} (start {}, high {})\n\
         Trades today: {}/{}\n\
         Daily loss limit: {:.1}% | Max drawdown: {:.1}%\n\
         Risk/trade: {:.1}%–{:.1}% × {:.2}\n\
         Loss streak: {} | Cooldown: {}\n\
         Emergency: {} | Monitoring-only: {}",
        fmt(st.current_equity),
        fmt(st.start_equity),
        fmt(st.equity_high_watermark),
        st.trades_today,
        limits.max_trades_per_day,
        limits.daily_loss_limit_pct * 100.0,
        limits.max_drawdown_pct * 100.0,
        limits.min_risk_pct * 100.0,
        limits.max_risk_pct * 100.0,
        ctx.breaker.risk_scale(),
        cb.loss_streak,
        cooldown,
        cb.emergency_active,
        cb.monitoring_only,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{context, MockExchange};
    use crate::types::Liquidation;
    use std::sync::Arc;

    #[test]
    fn parses_commands_with_bot_suffix() {
        assert_eq!(Command::parse("/status@sentinel_bot"), Command::Status);
        assert_eq!(Command::parse("  /RESET_EMERGENCY  "), Command::ResetEmergency);
        assert_eq!(Command::parse("/halt now"), Command::Halt);
        assert_eq!(Command::parse("hello"), Command::Unknown("hello".into()));
    }

    #[tokio::test]
    async fn halt_persists_and_start_clears() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(MockExchange::default()));

        handle(&ctx, Command::Halt).await;
        assert!(dir.path().join("halt.flag").exists());
        assert_eq!(ctx.overrides.state().await, OverrideState::Halted);

        handle(&ctx, Command::Pause).await;
        handle(&ctx, Command::Start).await;
        assert!(!dir.path().join("halt.flag").exists());
        assert_eq!(ctx.overrides.state().await, OverrideState::Running);
    }

    #[tokio::test]
    async fn resume_reports_remaining_halt() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(MockExchange::default()));
        handle(&ctx, Command::Stop).await;
        handle(&ctx, Command::Pause).await;
        let reply = handle(&ctx, Command::Resume).await;
        assert!(reply.contains("Halted"), "{reply}");
    }

    #[tokio::test]
    async fn reset_emergency_clears_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(MockExchange::default()));
        let now = Utc::now();
        for i in 0..5 {
            ctx.breaker.record_liquidation(Liquidation {
                symbol: "BTCUSDT".into(),
                side: "Sell".into(),
                price: 100_000.0,
                qty: 6.0,
                timestamp: now - chrono::Duration::seconds(i),
            });
        }
        assert!(ctx.breaker.snapshot().emergency_active);
        assert_eq!(handle(&ctx, Command::ResetEmergency).await, "✅ Emergency stop cleared");
        assert!(!ctx.breaker.snapshot().emergency_active);
        assert_eq!(handle(&ctx, Command::ResetEmergency).await, "No emergency stop active");
    }

    #[tokio::test]
    async fn balance_and_risk_replies() {
        let dir = tempfile::tempdir().unwrap();
        let ex = Arc::new(MockExchange::default());
        *ex.balance.lock().unwrap() = 1_234.5;
        let ctx = context(dir.path(), ex);
        ctx.risk.set_equity(1_234.5);
        assert!(handle(&ctx, Command::Balance).await.contains("1234.50"));
        let risk = handle(&ctx, Command::Risk).await;
        assert!(risk.contains("Trades today: 0/20"), "{risk}");
        assert_eq!(handle(&ctx, Command::Positions).await, "No open positions");
    }
}
