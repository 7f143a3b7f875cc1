#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use perp_sentinel::bybit_api::BybitClient;
use perp_sentinel::config::{Settings, SUPERVISOR_RESTART_DELAY};
use perp_sentinel::engine::{self, EngineContext};
use perp_sentinel::exchange::{DryRunExchange, Exchange};
use perp_sentinel::telegram::{LogNotifier, Notifier, TelegramBot};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = Settings::from_env()?;
    let bot = TelegramBot::from_settings(&settings);
    let notifier: Arc<dyn Notifier> = match &bot {
        Some(b) => Arc::new(b.clone()),
        None => {
            log::warn!("TELEGRAM_TOKEN/TELEGRAM_CHAT_ID not set, notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };

    // ── Supervisor: rebuild and rerun the engine after a fatal error ─────────
    loop {
        let client: Arc<dyn Exchange> = Arc::new(BybitClient::new(&settings)?);
        let exchange: Arc<dyn Exchange> = if settings.live_mode {
            log::warn!("LIVE mode: orders go to {}", settings.rest_url);
            client
        } else {
            log::info!("Dry-run mode: orders are simulated");
            Arc::new(DryRunExchange::new(client))
        };
        let ctx = Arc::new(EngineContext::new(settings.clone(), exchange, Arc::clone(&notifier)));

        let result = tokio::select! {
            r = engine::run(Arc::clone(&ctx), bot.clone()) => r,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-C received, shutting down");
                ctx.shutdown.cancel();
                ctx.monitors.close();
                ctx.monitors.wait().await;
                return Ok(());
            }
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                ctx.shutdown.cancel();
                log::error!("Engine failed: {}. Restarting in {}s", e, SUPERVISOR_RESTART_DELAY.as_secs());
                notifier
                    .notify_risk_alert(&format!(
                        "Engine failed: {e}\nRestarting in {}s",
                        SUPERVISOR_RESTART_DELAY.as_secs()
                    ))
                    .await;
                tokio::time::sleep(SUPERVISOR_RESTART_DELAY).await;
            }
        }
    }
}
