//! Position lifecycle: Idle → Tracking → BreakEvenMoved (trailing) → Closed.
//!
//! [`step`] is the pure stop-progression rule; the async half polls the
//! exchange, commits stop moves only once the exchange has accepted them, and
//! journals the close. One monitor task per symbol, guarded by
//! [`PositionRegistry`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{
    BREAK_EVEN_RR, DEFAULT_PRICE_DECIMALS, DEFAULT_SL_PCT, MONITOR_POLL, TRAILING_DISTANCE,
    TRAILING_START_RR,
};
use crate::engine::EngineContext;
use crate::exchange::with_timeout;
use crate::journal::TradeRecord;
use crate::types::{round_to, Direction, ExchangePosition, OpenPosition, TrailingConfig};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MonitorParams {
    pub break_even_rr: f64,
    pub trailing_start_rr: f64,
    /// Fraction of price, 0.005 = 0.5 %.
    pub trailing_distance: f64,
    pub price_decimals: u32,
}

impl Default for MonitorParams {
    fn default() -> Self {
        MonitorParams {
            break_even_rr: BREAK_EVEN_RR,
            trailing_start_rr: TRAILING_START_RR,
            trailing_distance: TRAILING_DISTANCE,
            price_decimals: DEFAULT_PRICE_DECIMALS,
        }
    }
}

impl MonitorParams {
    /// Break-even and trail distance from the plan; trailing never starts
    /// before the break-even move.
    pub fn from_trailing(cfg: &TrailingConfig, price_decimals: u32) -> Self {
        let break_even_rr = cfg.move_to_break_even_after_rr;
        MonitorParams {
            break_even_rr,
            trailing_start_rr: if cfg.enabled {
                TRAILING_START_RR.max(break_even_rr)
            } else {
                f64::INFINITY
            },
            trailing_distance: cfg.trail_percent / 100.0,
            price_decimals,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MonitorState {
    Tracking,
    BreakEvenMoved,
}

impl MonitorState {
    pub fn of(pos: &OpenPosition) -> Self {
        if pos.moved_to_break_even {
            MonitorState::BreakEvenMoved
        } else {
            MonitorState::Tracking
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StopUpdate {
    BreakEven(f64),
    Trail(f64),
}

impl StopUpdate {
    pub fn price(self) -> f64 {
        match self {
            StopUpdate::BreakEven(p) | StopUpdate::Trail(p) => p,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StopUpdate::BreakEven(_) => "Stop moved to break-even",
            StopUpdate::Trail(_) => "Trailing stop",
        }
    }
}

/// Favourable excursion in units of the initial risk. Adverse moves are
/// negative; a degenerate initial stop gives 0.
pub fn reward_risk(pos: &OpenPosition, price: f64) -> f64 {
    let risk = (pos.entry_price - pos.initial_stop).abs();
    if risk <= 0.0 {
        return 0.0;
    }
    (price - pos.entry_price) * pos.direction.sign() / risk
}

fn improves(pos: &OpenPosition, candidate: f64) -> bool {
    match pos.direction {
        Direction::Long => candidate > pos.current_stop,
        Direction::Short => candidate < pos.current_stop,
        Direction::Neutral => false,
    }
}

/// Applies at most one break-even move per position and any trailing
/// improvement, mutating `pos`. Returned updates are in application order.
pub fn step(pos: &mut OpenPosition, price: f64, params: &MonitorParams) -> Vec<StopUpdate> {
    let mut updates = Vec::new();
    let rr = reward_risk(pos, price);

    if !pos.moved_to_break_even && rr >= params.break_even_rr {
        pos.moved_to_break_even = true;
        if improves(pos, pos.entry_price) {
            pos.current_stop = pos.entry_price;
            updates.push(StopUpdate::BreakEven(pos.entry_price));
        }
    }

    if pos.moved_to_break_even && rr >= params.trailing_start_rr {
        let candidate = round_to(
            price * (1.0 - pos.direction.sign() * params.trailing_distance),
            params.price_decimals,
        );
        if improves(pos, candidate) {
            pos.current_stop = candidate;
            updates.push(StopUpdate::Trail(candidate));
        }
    }
    updates
}

/// Best guess at why a position closed, from where the last price sat.
pub fn exit_reason(pos: &OpenPosition, exit: f64) -> &'static str {
    let s = pos.direction.sign();
    let tolerance = pos.entry_price * 0.001;
    let at_stop = (exit - pos.current_stop) * s <= tolerance;
    match (at_stop, pos.moved_to_break_even) {
        (true, false) => "stop_loss",
        (true, true) if pos.current_stop == pos.entry_price => "break_even",
        (true, true) => "trailing_stop",
        (false, _) if (exit - pos.entry_price) * s > 0.0 => "take_profit",
        (false, _) => "closed",
    }
}

/// Adopt a position opened outside this process. Uses the exchange stop when
/// set, otherwise the default 1 % stop.
pub fn orphan_position(ep: &ExchangePosition) -> OpenPosition {
    let s = ep.direction.sign();
    let default_stop = ep.entry_price * (1.0 - s * DEFAULT_SL_PCT);
    let stop = if ep.stop_loss > 0.0 { ep.stop_loss } else { default_stop };
    // a stop already at or past entry means break-even was done earlier
    let past_entry = (stop - ep.entry_price) * s >= 0.0;
    OpenPosition {
        symbol: ep.symbol.clone(),
        direction: ep.direction,
        entry_price: ep.entry_price,
        initial_stop: if past_entry { default_stop } else { stop },
        current_stop: stop,
        moved_to_break_even: past_entry,
        size: ep.size,
        confidence: 0,
        opened_at: Utc::now(),
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct TrackedPosition {
    pub position: OpenPosition,
    pub params: MonitorParams,
    pub last_price: f64,
    pub last_pnl: f64,
}

impl TrackedPosition {
    pub fn new(position: OpenPosition, params: MonitorParams) -> Self {
        let last_price = position.entry_price;
        TrackedPosition { position, params, last_price, last_pnl: 0.0 }
    }
}

/// Symbol → tracked position, plus symbols reserved by an in-flight order.
/// A symbol is owned by at most one of the two and by at most one monitor.
#[derive(Default)]
pub struct PositionRegistry {
    tracked: Mutex<HashMap<String, TrackedPosition>>,
    pending: Mutex<HashSet<String>>,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `symbol` for an order about to be placed.
    pub fn reserve(&self, symbol: &str) -> bool {
        let tracked = lock(&self.tracked);
        if tracked.contains_key(symbol) {
            return false;
        }
        lock(&self.pending).insert(symbol.to_string())
    }

    pub fn release(&self, symbol: &str) {
        lock(&self.pending).remove(symbol);
    }

    /// False when the symbol already has a monitor.
    pub fn try_track(&self, tp: TrackedPosition) -> bool {
        let mut tracked = lock(&self.tracked);
        let symbol = tp.position.symbol.clone();
        if tracked.contains_key(&symbol) {
            return false;
        }
        lock(&self.pending).remove(&symbol);
        tracked.insert(symbol, tp);
        true
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        lock(&self.tracked).contains_key(symbol)
    }

    pub fn is_claimed(&self, symbol: &str) -> bool {
        self.is_tracked(symbol) || lock(&self.pending).contains(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<TrackedPosition> {
        lock(&self.tracked).get(symbol).cloned()
    }

    /// Overwrites an existing entry; a symbol untracked meanwhile stays gone.
    pub fn commit(&self, tp: TrackedPosition) {
        if let Some(slot) = lock(&self.tracked).get_mut(&tp.position.symbol) {
            *slot = tp;
        }
    }

    pub fn untrack(&self, symbol: &str) -> Option<TrackedPosition> {
        lock(&self.tracked).remove(symbol)
    }

    pub fn snapshot(&self) -> Vec<TrackedPosition> {
        let mut all: Vec<_> = lock(&self.tracked).values().cloned().collect();
        all.sort_by(|a, b| a.position.symbol.cmp(&b.position.symbol));
        all
    }

    pub fn len(&self) -> usize {
        lock(&self.tracked).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Async monitor ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PollOutcome {
    Open,
    Closed,
    /// Transient read failure; nothing changed.
    Skipped,
}

/// Tracks the position and spawns its monitor. False if already tracked.
pub fn register(ctx: &Arc<EngineContext>, tracked: TrackedPosition) -> bool {
    let symbol = tracked.position.symbol.clone();
    if !ctx.registry.try_track(tracked) {
        return false;
    }
    let task_ctx = Arc::clone(ctx);
    let token = ctx.shutdown.child_token();
    ctx.monitors.spawn(async move { monitor_symbol(task_ctx, symbol, token).await });
    true
}

async fn monitor_symbol(ctx: Arc<EngineContext>, symbol: String, token: CancellationToken) {
    log::info!("[{}] Monitor started", symbol);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(MONITOR_POLL) => {}
        }
        if poll_once(&ctx, &symbol).await == PollOutcome::Closed {
            break;
        }
    }
    log::info!("[{}] Monitor stopped", symbol);
}

/// One monitor tick for `symbol`.
pub async fn poll_once(ctx: &EngineContext, symbol: &str) -> PollOutcome {
    let positions = match with_timeout(ctx.exchange.fetch_open_positions()).await {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Position read failed, retry next tick: {}", symbol, e);
            return PollOutcome::Skipped;
        }
    };
    let Some(tracked) = ctx.registry.get(symbol) else {
        return PollOutcome::Closed;
    };
    let Some(live) = positions.iter().find(|p| p.symbol == symbol && p.size > 0.0) else {
        close(ctx, tracked).await;
        return PollOutcome::Closed;
    };

    let price = match with_timeout(ctx.exchange.fetch_last_price(symbol)).await {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Price read failed, retry next tick: {}", symbol, e);
            return PollOutcome::Skipped;
        }
    };

    let mut observed = tracked;
    observed.last_price = price;
    observed.last_pnl = live.unrealized_pnl;
    observed.position.size = live.size;

    let mut next = observed.clone();
    let updates = step(&mut next.position, price, &next.params);
    let Some(last) = updates.last().copied() else {
        ctx.registry.commit(observed);
        return PollOutcome::Open;
    };

    let decimals = next.params.price_decimals;
    match with_timeout(ctx.exchange.update_stop_loss(symbol, last.price(), decimals)).await {
        Ok(()) => {
            for u in &updates {
                log::info!(
                    "[{}] {} → {} (price {:.4}, rr {:.2})",
                    symbol,
                    u.label(),
                    u.price(),
                    price,
                    reward_risk(&next.position, price)
                );
                ctx.notifier.notify_stop_moved(symbol, u.label(), u.price()).await;
            }
            ctx.registry.commit(next);
        }
        Err(e) => {
            // state stays put, the move is re-derived next tick
            log::warn!("[{}] Stop update to {} failed: {}", symbol, last.price(), e);
            ctx.registry.commit(observed);
        }
    }
    PollOutcome::Open
}

async fn close(ctx: &EngineContext, tracked: TrackedPosition) {
    let pos = &tracked.position;
    let exit = if tracked.last_price > 0.0 { tracked.last_price } else { pos.entry_price };
    let pnl = (exit - pos.entry_price) * pos.size * pos.direction.sign();
    let reason = exit_reason(pos, exit);
    log::info!(
        "[{}] Closed {} @ {:.4} | PnL ≈ {:+.2} | {}",
        pos.symbol,
        pos.direction.as_str(),
        exit,
        pnl,
        reason
    );

    let record = TradeRecord {
        timestamp: Utc::now(),
        symbol: pos.symbol.clone(),
        side: pos.direction.side().to_string(),
        size: pos.size,
        entry: pos.entry_price,
        exit,
        pnl,
        exit_reason: reason.to_string(),
        strategy: "structure".to_string(),
        confidence: pos.confidence,
    };
    if let Err(e) = ctx.journal.record(record).await {
        log::error!("[{}] Journal write failed: {}", pos.symbol, e);
    }

    ctx.registry.untrack(&pos.symbol);
    ctx.notifier
        .notify_trade_close(&pos.symbol, pos.direction, pos.entry_price, exit, pnl, reason)
        .await;
    if let Some(event) = ctx.breaker.record_trade_outcome(pnl, Utc::now()) {
        ctx.announce(event).await;
    }
}

/// Adopts every untracked open position. Returns how many were imported.
pub async fn sweep_once(ctx: &Arc<EngineContext>) -> usize {
    let positions = match with_timeout(ctx.exchange.fetch_open_positions()).await {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Position sweep skipped: {}", e);
            return 0;
        }
    };
    let mut imported = 0;
    for ep in positions.iter().filter(|p| p.size > 0.0) {
        if ctx.registry.is_claimed(&ep.symbol) {
            continue;
        }
        let pos = orphan_position(ep);
        let decimals = ctx.instrument(&ep.symbol).await.price_decimals();
        log::warn!(
            "[{}] Orphan position imported: {} size={:.4} @ {:.4} sl={:.4}",
            ep.symbol,
            ep.direction.as_str(),
            ep.size,
            ep.entry_price,
            pos.current_stop
        );
        let params = MonitorParams { price_decimals: decimals, ..MonitorParams::default() };
        if register(ctx, TrackedPosition::new(pos, params)) {
            imported += 1;
            ctx.notifier
                .send(&format!(
                    "📥 Orphan position on <b>{}</b> ({} {:.4} @ {}) is now monitored",
                    ep.symbol,
                    ep.direction.side(),
                    ep.size,
                    ep.entry_price
                ))
                .await;
        }
    }
    imported
}

pub async fn run_sweep(ctx: Arc<EngineContext>, token: CancellationToken) {
    loop {
        sweep_once(&ctx).await;
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(MONITOR_POLL) => {}
        }
    }
}
