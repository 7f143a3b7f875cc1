//! Shared context and the fixed set of long-running tasks.
//!
//! Task groups: `worker:<SYMBOL>` (one per symbol, restartable as a group by
//! the connectivity watchdog), `position-sweep`, `liquidation-feed`,
//! `regime-evaluator`, `connectivity-watchdog`, `reporter`,
//! `weights-reloader` and `command-poller`. All of them stop when
//! [`EngineContext::shutdown`] is cancelled.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::{NaiveDate, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::circuit_breaker::{BreakerEvent, CircuitBreaker};
use crate::commands::{self, Command};
use crate::config::{
    Settings, BALANCE_ALERT_PCT, HEARTBEAT_INTERVAL, REGIME_EVAL_INTERVAL, WATCHDOG_INTERVAL,
    WEIGHTS_RELOAD_INTERVAL,
};
use crate::confidence::WeightStore;
use crate::entry_gate::EntryGate;
use crate::error::{EngineError, ExchangeError};
use crate::exchange::{with_timeout, Exchange};
use crate::journal::{SignalLog, TradeJournal};
use crate::liquidation_feed::LiquidationFeed;
use crate::orchestrator;
use crate::overrides::OperatorOverrides;
use crate::planner::SlTpStore;
use crate::position_monitor::{self, PositionRegistry};
use crate::risk::{RiskLimits, RiskManager};
use crate::telegram::{Notifier, TelegramBot};
use crate::types::InstrumentSpec;

const REPORTER_TICK: Duration = Duration::from_secs(60);
const LIQ_CHANNEL_CAPACITY: usize = 1024;

/// Everything the tasks share. Built once per engine run.
pub struct EngineContext {
    pub settings: Settings,
    pub exchange: Arc<dyn Exchange>,
    pub notifier: Arc<dyn Notifier>,
    pub risk: Arc<RiskManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub overrides: Arc<OperatorOverrides>,
    pub gate: EntryGate,
    pub weights: WeightStore,
    pub sltp: SlTpStore,
    pub registry: PositionRegistry,
    pub journal: TradeJournal,
    pub signal_log: SignalLog,
    /// Position monitors; they outlive worker restarts.
    pub monitors: TaskTracker,
    pub shutdown: CancellationToken,
    instruments: Mutex<HashMap<String, InstrumentSpec>>,
    leverage: Mutex<HashMap<String, u32>>,
}

impl EngineContext {
    pub fn new(settings: Settings, exchange: Arc<dyn Exchange>, notifier: Arc<dyn Notifier>) -> Self {
        let risk = Arc::new(RiskManager::new(RiskLimits {
            max_trades_per_day: settings.max_trades_per_day,
            ..RiskLimits::default()
        }));
        let breaker = Arc::new(CircuitBreaker::new());
        let overrides =
            Arc::new(OperatorOverrides::new(&settings.halt_flag, &settings.pause_flag));
        let gate = EntryGate::new(Arc::clone(&overrides), Arc::clone(&breaker), Arc::clone(&risk));

        EngineContext {
            weights: WeightStore::load_or_default(&settings.weights_path),
            sltp: SlTpStore::load_or_empty(&settings.sltp_path),
            journal: TradeJournal::new(&settings.journal_path),
            signal_log: SignalLog::new(&settings.signal_log_path),
            registry: PositionRegistry::new(),
            monitors: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            instruments: Mutex::default(),
            leverage: Mutex::default(),
            settings,
            exchange,
            notifier,
            risk,
            breaker,
            overrides,
            gate,
        }
    }

    /// Logs a breaker transition and forwards it to the operator.
    pub async fn announce(&self, event: BreakerEvent) {
        match &event {
            BreakerEvent::LargeLiquidation(l) => {
                log::info!("[{}] Large liquidation {:.0} USDT ({})", l.symbol, l.value_usdt(), l.side)
            }
            other => log::warn!("Breaker: {:?}", other),
        }
        self.notifier.send(&event.message()).await;
    }

    /// Cached tick/qty precision; falls back to defaults when the lookup fails.
    pub async fn instrument(&self, symbol: &str) -> InstrumentSpec {
        if let Some(spec) = lock(&self.instruments).get(symbol) {
            return *spec;
        }
        match with_timeout(self.exchange.fetch_instrument(symbol)).await {
            Ok(spec) => {
                lock(&self.instruments).insert(symbol.to_string(), spec);
                spec
            }
            Err(e) => {
                log::warn!("[{}] Instrument info unavailable, using defaults: {}", symbol, e);
                InstrumentSpec::default()
            }
        }
    }

    /// Applies `target` leverage unless it is already the last value set.
    /// Returns whether a call was made.
    pub async fn ensure_leverage(&self, symbol: &str, target: u32) -> Result<bool, ExchangeError> {
        if lock(&self.leverage).get(symbol) == Some(&target) {
            return Ok(false);
        }
        with_timeout(self.exchange.set_leverage(symbol, target)).await?;
        lock(&self.leverage).insert(symbol.to_string(), target);
        log::info!("[{}] Leverage set to {}x", symbol, target);
        Ok(true)
    }

    /// Re-reads the weight and SL/TP tables. Returns a line per table.
    pub fn reload_tables(&self) -> Vec<String> {
        let weights = match self.weights.reload_from(&self.settings.weights_path) {
            Ok(v) => format!("weights v{v} loaded"),
            Err(e) => format!("weights unchanged ({e})"),
        };
        let sltp = match self.sltp.reload_from(&self.settings.sltp_path) {
            Ok(n) => format!("SL/TP table: {n} symbols"),
            Err(e) => format!("SL/TP table unchanged ({e})"),
        };
        log::info!("Tables reloaded: {} | {}", weights, sltp);
        vec![weights, sltp]
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Run ──────────────────────────────────────────────────────────────────────

/// Resolves symbols, seeds equity, starts every task group and waits for
/// shutdown. Errors only during start-up; the caller decides to restart.
pub async fn run(ctx: Arc<EngineContext>, inbound: Option<TelegramBot>) -> Result<(), EngineError> {
    let symbols = if ctx.settings.trading_pairs.is_empty() {
        orchestrator::rank_symbols(ctx.exchange.as_ref(), ctx.settings.top_n_symbols).await?
    } else {
        ctx.settings.trading_pairs.clone()
    };
    if symbols.is_empty() {
        return Err(EngineError::NoSymbols);
    }

    let balance = with_timeout(ctx.exchange.fetch_balance()).await?;
    ctx.risk.set_equity(balance.total);
    log::info!("Starting with {} symbols, equity {:.2} USDT", symbols.len(), balance.total);
    ctx.notifier.notify_start(&symbols, ctx.settings.live_mode).await;

    let tasks = TaskTracker::new();
    let token = ctx.shutdown.clone();

    spawn_named(&tasks, "position-sweep", position_monitor::run_sweep(Arc::clone(&ctx), token.clone()));

    let (liq_tx, liq_rx) = mpsc::channel(LIQ_CHANNEL_CAPACITY);
    let feed = LiquidationFeed::new(&symbols, liq_tx);
    let feed_token = token.clone();
    spawn_named(&tasks, "liquidation-feed", async move { feed.run(feed_token).await });
    spawn_named(&tasks, "liquidation-consumer", consume_liquidations(Arc::clone(&ctx), liq_rx, token.clone()));

    spawn_named(&tasks, "regime-evaluator", run_regime_evaluator(Arc::clone(&ctx), token.clone()));
    spawn_named(
        &tasks,
        "connectivity-watchdog",
        run_watchdog(Arc::clone(&ctx), symbols.clone(), token.clone()),
    );
    spawn_named(&tasks, "reporter", run_reporter(Arc::clone(&ctx), token.clone()));
    spawn_named(&tasks, "weights-reloader", run_weights_reloader(Arc::clone(&ctx), token.clone()));
    if let Some(bot) = inbound {
        spawn_named(&tasks, "command-poller", run_command_poller(Arc::clone(&ctx), bot, token.clone()));
    }
    tasks.close();

    token.cancelled().await;
    log::info!("Shutdown requested, waiting for tasks…");
    tasks.wait().await;
    ctx.monitors.close();
    ctx.monitors.wait().await;
    log::info!("Engine stopped");
    Ok(())
}

fn spawn_named<F>(tasks: &TaskTracker, name: &'static str, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tasks.spawn(async move {
        log::debug!("task {} started", name);
        fut.await;
        log::debug!("task {} finished", name);
    });
}

// ── Workers ──────────────────────────────────────────────────────────────────

/// The per-symbol workers of one connectivity epoch.
struct WorkerGroup {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerGroup {
    fn spawn(ctx: &Arc<EngineContext>, symbols: &[String], token: CancellationToken) -> Self {
        let tracker = TaskTracker::new();
        for symbol in symbols {
            let worker = orchestrator::run_symbol(Arc::clone(ctx), symbol.clone(), token.clone());
            let symbol = symbol.clone();
            tracker.spawn(async move {
                // a panicking worker is logged, its symbol stays idle
                if let Err(e) = tokio::spawn(worker).await {
                    log::error!("[{}] worker:{} crashed: {}", symbol, symbol, e);
                }
            });
        }
        tracker.close();
        log::info!("Started {} symbol workers", symbols.len());
        WorkerGroup { token, tracker }
    }

    async fn stop(self) {
        self.token.cancel();
        self.tracker.wait().await;
    }
}

/// Owns the worker group of the current connectivity epoch.
struct Watchdog {
    ctx: Arc<EngineContext>,
    symbols: Vec<String>,
    token: CancellationToken,
    workers: Option<WorkerGroup>,
}

impl Watchdog {
    fn start(ctx: Arc<EngineContext>, symbols: Vec<String>, token: CancellationToken) -> Self {
        let workers = Some(WorkerGroup::spawn(&ctx, &symbols, token.child_token()));
        Watchdog { ctx, symbols, token, workers }
    }

    fn workers_running(&self) -> bool {
        self.workers.is_some()
    }

    /// One balance probe. Three straight failures stop the workers, the next
    /// success restarts them.
    async fn check(&mut self) {
        let ok = match with_timeout(self.ctx.exchange.fetch_balance()).await {
            Ok(balance) => {
                self.ctx.risk.set_equity(balance.total);
                true
            }
            Err(e) => {
                log::warn!("Balance fetch failed: {}", e);
                false
            }
        };
        match self.ctx.breaker.record_balance_fetch(ok) {
            Some(event @ BreakerEvent::ConnectivityLost) => {
                if let Some(group) = self.workers.take() {
                    group.stop().await;
                }
                self.ctx.announce(event).await;
            }
            Some(event @ BreakerEvent::ConnectivityRestored) => {
                self.ctx.announce(event).await;
                if self.workers.is_none() {
                    self.workers =
                        Some(WorkerGroup::spawn(&self.ctx, &self.symbols, self.token.child_token()));
                }
            }
            Some(other) => self.ctx.announce(other).await,
            None => {}
        }
    }

    async fn stop(self) {
        if let Some(group) = self.workers {
            group.stop().await;
        }
    }
}

async fn run_watchdog(ctx: Arc<EngineContext>, symbols: Vec<String>, token: CancellationToken) {
    let mut watchdog = Watchdog::start(ctx, symbols, token.clone());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
        }
        watchdog.check().await;
    }
    watchdog.stop().await;
}

// ── Liquidations and regime ──────────────────────────────────────────────────

async fn consume_liquidations(
    ctx: Arc<EngineContext>,
    mut rx: mpsc::Receiver<crate::types::Liquidation>,
    token: CancellationToken,
) {
    loop {
        let liq = tokio::select! {
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(l) => l,
                None => break,
            },
        };
        for event in ctx.breaker.record_liquidation(liq) {
            ctx.announce(event).await;
        }
    }
}

async fn run_regime_evaluator(ctx: Arc<EngineContext>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(REGIME_EVAL_INTERVAL) => {}
        }
        if let Some(event) = ctx.breaker.evaluate_regime() {
            ctx.announce(event).await;
        }
    }
}

// ── Reporter ─────────────────────────────────────────────────────────────────

/// State the reporter carries between ticks.
struct ReporterState {
    day: NaiveDate,
    last_heartbeat: Option<Instant>,
    alert_equity: Option<f64>,
}

async fn run_reporter(ctx: Arc<EngineContext>, token: CancellationToken) {
    let mut state = ReporterState { day: Utc::now().date_naive(), last_heartbeat: None, alert_equity: None };
    loop {
        report_tick(&ctx, &mut state).await;
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(REPORTER_TICK) => {}
        }
    }
}

async fn report_tick(ctx: &EngineContext, state: &mut ReporterState) {
    let now = Utc::now();

    if let Some(verdict) = ctx.risk.violation_transition() {
        log::warn!("Risk violation: {}", verdict.describe());
        ctx.notifier
            .notify_risk_alert(&format!("Trading blocked: {}", verdict.describe()))
            .await;
    }
    if let Some(event) = ctx.breaker.refresh_cooldown(now) {
        ctx.announce(event).await;
    }

    let equity = ctx.risk.state().current_equity.unwrap_or(0.0);
    match state.alert_equity {
        Some(prev) if prev > 0.0 && ((equity - prev) / prev).abs() >= BALANCE_ALERT_PCT => {
            let change = (equity - prev) / prev * 100.0;
            ctx.notifier
                .notify_risk_alert(&format!(
                    "Balance moved {change:+.1}%: {prev:.2} → {equity:.2} USDT"
                ))
                .await;
            state.alert_equity = Some(equity);
        }
        None if equity > 0.0 => state.alert_equity = Some(equity),
        _ => {}
    }

    if state.last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT_INTERVAL) {
        let lines = status_lines(ctx);
        let enabled = ctx.risk.allowed_to_trade() && ctx.breaker.blocking_reason(now).is_none();
        ctx.notifier.notify_status(&lines, equity, enabled).await;
        state.last_heartbeat = Some(Instant::now());
        #[cfg(feature = "jemalloc")]
        jemalloc_purge();
    }

    let today = now.date_naive();
    if today != state.day {
        let since = state
            .day
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(now);
        match ctx.journal.summary_since(since) {
            Ok(s) => {
                log::info!("Daily reset | PnL: {:.2} | Trades: {} | Wins: {}", s.pnl, s.trades, s.wins);
                ctx.notifier.notify_daily_summary(s.pnl, s.trades, s.wins, equity).await;
            }
            Err(e) => log::warn!("Daily summary unavailable: {}", e),
        }
        ctx.risk.start_new_day();
        state.day = today;
    }
}

/// One line per tracked position, for heartbeats and `/positions`.
pub fn status_lines(ctx: &EngineContext) -> Vec<String> {
    ctx.registry
        .snapshot()
        .iter()
        .map(|t| {
            let p = &t.position;
            let emoji = if t.last_pnl >= 0.0 { "📈" } else { "📉" };
            let be = if p.moved_to_break_even { " | BE✓" } else { "" };
            format!(
                "{emoji} <b>{}</b> {} @ <code>{}</code> → <code>{}</code> | SL <code>{}</code>{be} | PnL <code>{:+.2}</code>",
                p.symbol,
                p.direction.side(),
                p.entry_price,
                t.last_price,
                p.current_stop,
                t.last_pnl
            )
        })
        .collect()
}

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced");
}

// ── Hot reload and commands ──────────────────────────────────────────────────

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Reloads a table only when its file's mtime moved.
async fn run_weights_reloader(ctx: Arc<EngineContext>, token: CancellationToken) {
    let mut seen = (modified_at(&ctx.settings.weights_path), modified_at(&ctx.settings.sltp_path));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(WEIGHTS_RELOAD_INTERVAL) => {}
        }
        let current = (modified_at(&ctx.settings.weights_path), modified_at(&ctx.settings.sltp_path));
        if current.0.is_some() && current.0 != seen.0 {
            match ctx.weights.reload_from(&ctx.settings.weights_path) {
                Ok(v) => log::info!("Weight table hot-reloaded (v{})", v),
                Err(e) => log::warn!("Weight reload rejected, keeping current table: {}", e),
            }
        }
        if current.1.is_some() && current.1 != seen.1 {
            match ctx.sltp.reload_from(&ctx.settings.sltp_path) {
                Ok(n) => log::info!("SL/TP table hot-reloaded ({} symbols)", n),
                Err(e) => log::warn!("SL/TP reload rejected: {}", e),
            }
        }
        seen = current;
    }
}

async fn run_command_poller(ctx: Arc<EngineContext>, bot: TelegramBot, token: CancellationToken) {
    let mut offset = 0i64;
    loop {
        let polled = tokio::select! {
            _ = token.cancelled() => break,
            r = bot.poll_commands(&mut offset) => r,
        };
        match polled {
            Ok(texts) => {
                for text in texts {
                    let cmd = Command::parse(&text);
                    log::info!("Operator command: {:?}", cmd);
                    let reply = commands::handle(&ctx, cmd).await;
                    bot.send(&reply).await;
                }
            }
            Err(e) => {
                log::warn!("Command poll failed: {}", e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }
}
