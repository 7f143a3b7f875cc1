//! Per-symbol decision cycle: gate → data → structure → score → admit →
//! plan → size → leverage → order → monitor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::{
    ATR_WINDOW, COOLDOWN_CYCLE_INTERVAL, CYCLE_INTERVAL, HTF_LIMIT, MIN_CANDLES, OHLCV_LIMIT,
    ORDER_TIMEOUT, SYMBOL_RANK_CANDLES, TF_ENTRY, TF_HTF_1D, TF_HTF_4H,
};
use crate::confidence::{detect_features, score, FeatureInputs};
use crate::engine::EngineContext;
use crate::entry_gate::Rejection;
use crate::error::ExchangeError;
use crate::exchange::{with_deadline, with_timeout, Exchange};
use crate::indicators;
use crate::market_structure::analyze;
use crate::planner::{plan, PlanInput};
use crate::position_monitor::{self, MonitorParams, TrackedPosition};
use crate::types::{decimals_of, round_to, Direction, OpenPosition, OrderRequest, Signal, TradePlan};

/// ATR/price below this gets the higher leverage.
const LOW_VOLATILITY_ATR_RATIO: f64 = 0.03;
const LOW_VOLATILITY_LEVERAGE: u32 = 3;
const HIGH_VOLATILITY_LEVERAGE: u32 = 2;
const RANK_CONCURRENCY: usize = 10;

#[derive(Debug)]
pub enum CycleOutcome {
    Blocked(Rejection),
    AlreadyTracked,
    DataUnavailable(ExchangeError),
    InsufficientData(usize),
    NoDirection,
    Rejected { confidence: i64, reason: Rejection },
    InvalidPlan,
    ZeroSize,
    OrderFailed(ExchangeError),
    Opened(TradePlan),
}

/// 3× in calm markets, 2× otherwise, never above `max`.
pub fn adaptive_leverage(atr: f64, price: f64, max: u32) -> u32 {
    let target = if price > 0.0 && atr / price < LOW_VOLATILITY_ATR_RATIO {
        LOW_VOLATILITY_LEVERAGE
    } else {
        HIGH_VOLATILITY_LEVERAGE
    };
    target.min(max).max(1)
}

/// Rounds down to a whole number of `step`s.
pub fn floor_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    round_to((qty / step + 1e-9).floor() * step, decimals_of(step))
}

/// One pass for `symbol`. Never fails: every problem maps to an outcome.
pub async fn run_cycle(ctx: &Arc<EngineContext>, symbol: &str) -> CycleOutcome {
    if let Err(r) = ctx.gate.precheck(Utc::now()).await {
        return CycleOutcome::Blocked(r);
    }
    if ctx.registry.is_claimed(symbol) {
        return CycleOutcome::AlreadyTracked;
    }

    let balance = match with_timeout(ctx.exchange.fetch_balance()).await {
        Ok(b) => b,
        Err(e) => return CycleOutcome::DataUnavailable(e),
    };
    ctx.risk.set_equity(balance.total);

    let candles = match with_timeout(ctx.exchange.fetch_ohlcv(symbol, TF_ENTRY, OHLCV_LIMIT)).await {
        Ok(c) => c,
        Err(e) => return CycleOutcome::DataUnavailable(e),
    };
    if candles.len() < MIN_CANDLES {
        return CycleOutcome::InsufficientData(candles.len());
    }
    let htf_4h = fetch_optional(ctx, symbol, TF_HTF_4H).await;
    let htf_1d = fetch_optional(ctx, symbol, TF_HTF_1D).await;

    let structure = analyze(&candles);
    let direction = structure.trend.direction();
    if direction == Direction::Neutral {
        return CycleOutcome::NoDirection;
    }
    let price = match candles.last() {
        Some(c) => c.close,
        None => return CycleOutcome::InsufficientData(0),
    };

    let now = Utc::now();
    let liquidations = ctx.breaker.recent_liquidations();
    let inputs = FeatureInputs {
        htf_4h: htf_4h.as_deref(),
        htf_1d: htf_1d.as_deref(),
        liquidations: &liquidations,
    };
    let features = detect_features(symbol, &candles, &structure, direction, &inputs, now);
    let table = ctx.weights.snapshot();
    let scored = score(&features, &table);

    let signal = Signal {
        symbol: symbol.to_string(),
        direction,
        confidence: scored.raw,
        normalized: scored.normalized,
        reasons: scored.reasons.clone(),
        price,
        timestamp: now,
    };
    // re-validates every flag after the fetches above
    if let Err(reason) = ctx.gate.admit(&signal).await {
        return CycleOutcome::Rejected { confidence: scored.raw, reason };
    }
    log::info!(
        "[{}] Signal {} @ {:.4} | confidence {} ({:.2}) | weights v{} | {}",
        symbol,
        direction.as_str(),
        price,
        scored.raw,
        scored.normalized,
        scored.table_version,
        scored.reasons.join(", ")
    );

    let spec = ctx.instrument(symbol).await;
    let atr = indicators::atr(&candles, ATR_WINDOW);
    let sltp = ctx.sltp.snapshot();
    let input = PlanInput {
        entry: price,
        direction,
        confidence: scored.raw,
        normalized: scored.normalized,
        atr,
        price_decimals: spec.price_decimals(),
        regime_rr: ctx.breaker.regime_rr(),
    };
    let mut trade = plan(&input, sltp.get(symbol));

    let raw_size = ctx.risk.calculate_position_size(
        balance.total,
        trade.entry,
        trade.stop_loss,
        scored.normalized,
        ctx.breaker.risk_scale(),
    );
    trade.size = floor_to_step(raw_size, spec.qty_step);
    if !trade.is_consistent() {
        log::error!(
            "[{}] Inconsistent plan: {} entry={} sl={} tp={}",
            symbol,
            direction.as_str(),
            trade.entry,
            trade.stop_loss,
            trade.take_profit_2
        );
        return CycleOutcome::InvalidPlan;
    }
    if trade.size <= 0.0 {
        log::warn!("[{}] Position size rounds to zero, skipping", symbol);
        return CycleOutcome::ZeroSize;
    }

    if !ctx.registry.reserve(symbol) {
        return CycleOutcome::AlreadyTracked;
    }
    let outcome = execute(ctx, symbol, &signal, trade, atr, spec.price_decimals()).await;
    if !matches!(outcome, CycleOutcome::Opened(_)) {
        ctx.registry.release(symbol);
    }
    outcome
}

async fn fetch_optional(
    ctx: &EngineContext,
    symbol: &str,
    interval: &str,
) -> Option<Vec<crate::types::Candle>> {
    match with_timeout(ctx.exchange.fetch_ohlcv(symbol, interval, HTF_LIMIT)).await {
        Ok(c) if !c.is_empty() => Some(c),
        Ok(_) => None,
        Err(e) => {
            log::debug!("[{}] {} candles unavailable: {}", symbol, interval, e);
            None
        }
    }
}

async fn execute(
    ctx: &Arc<EngineContext>,
    symbol: &str,
    signal: &Signal,
    trade: TradePlan,
    atr: f64,
    price_decimals: u32,
) -> CycleOutcome {
    let leverage = adaptive_leverage(atr, trade.entry, ctx.settings.max_leverage);
    if let Err(e) = ctx.ensure_leverage(symbol, leverage).await {
        log::warn!("[{}] Leverage update failed, keeping previous: {}", symbol, e);
    }

    if let Err(r) = ctx.gate.precheck(Utc::now()).await {
        return CycleOutcome::Blocked(r);
    }

    let spec = ctx.instrument(symbol).await;
    let order = OrderRequest::from_plan(symbol, &trade, &spec);
    let order_id = match with_deadline(ORDER_TIMEOUT, ctx.exchange.place_order(&order)).await {
        Ok(id) => id,
        Err(e) if e.is_ambiguous() && position_is_open(ctx, symbol).await => {
            log::warn!("[{}] Order call failed ({}) but the position is open, tracking it", symbol, e);
            "unconfirmed".to_string()
        }
        Err(e) => {
            log::error!("[{}] Place order failed: {}", symbol, e);
            if let Some(event) = ctx.breaker.record_order_failure(Utc::now()) {
                ctx.announce(event).await;
            }
            ctx.notifier
                .notify_risk_alert(&format!("[{}] Order placement failed: {}", symbol, e))
                .await;
            return CycleOutcome::OrderFailed(e);
        }
    };
    log::info!(
        "[{}] {} qty={:.4} entry={:.4} sl={} tp={} {}x orderId={}",
        symbol,
        trade.direction.side(),
        trade.size,
        trade.entry,
        trade.stop_loss,
        trade.take_profit_2,
        leverage,
        order_id
    );
    let position = OpenPosition {
        symbol: symbol.to_string(),
        direction: trade.direction,
        entry_price: trade.entry,
        initial_stop: trade.stop_loss,
        current_stop: trade.stop_loss,
        moved_to_break_even: false,
        size: trade.size,
        confidence: signal.confidence,
        opened_at: Utc::now(),
    };
    let params = MonitorParams::from_trailing(&trade.trailing, price_decimals);
    position_monitor::register(ctx, TrackedPosition::new(position, params));
    ctx.risk.record_trade();

    // the entry is live from here on; a missing partial exit is only reported
    if order.partial_legs().is_some() {
        if let Err(e) = with_deadline(ORDER_TIMEOUT, ctx.exchange.place_take_profits(&order)).await {
            log::error!("[{}] Partial take-profits incomplete: {}", symbol, e);
            ctx.notifier
                .notify_risk_alert(&format!("[{}] Take-profit orders incomplete: {}", symbol, e))
                .await;
        }
    }

    ctx.notifier
        .notify_trade_open(symbol, &trade, signal.confidence, &signal.reasons)
        .await;
    if let Err(e) = ctx.signal_log.record(signal.clone()).await {
        log::warn!("[{}] Signal log write failed: {}", symbol, e);
    }
    CycleOutcome::Opened(trade)
}

/// Whether the venue reports an open position for `symbol`.
async fn position_is_open(ctx: &EngineContext, symbol: &str) -> bool {
    match with_timeout(ctx.exchange.fetch_open_positions()).await {
        Ok(positions) => positions.iter().any(|p| p.symbol == symbol && p.size > 0.0),
        Err(e) => {
            log::warn!("[{}] Cannot confirm the order outcome: {}", symbol, e);
            false
        }
    }
}

/// Sleep before the next cycle; longer while a loss-streak cooldown runs.
pub fn cycle_delay(ctx: &EngineContext) -> Duration {
    if ctx.breaker.cooldown_active(Utc::now()) {
        COOLDOWN_CYCLE_INTERVAL
    } else {
        CYCLE_INTERVAL
    }
}

/// `worker:<SYMBOL>`: cycles until cancelled, slower while cooling down.
pub async fn run_symbol(ctx: Arc<EngineContext>, symbol: String, token: CancellationToken) {
    log::info!("[{}] worker started", symbol);
    loop {
        match run_cycle(&ctx, &symbol).await {
            CycleOutcome::Opened(_) => {}
            CycleOutcome::Blocked(r) => log::debug!("[{}] blocked: {}", symbol, r),
            CycleOutcome::Rejected { confidence, reason } => {
                log::debug!("[{}] rejected (confidence {}): {}", symbol, confidence, reason)
            }
            CycleOutcome::DataUnavailable(e) => log::warn!("[{}] skipped cycle: {}", symbol, e),
            CycleOutcome::InsufficientData(n) => {
                log::info!("[{}] only {} candles, need {}", symbol, n, MIN_CANDLES)
            }
            other => log::debug!("[{}] {:?}", symbol, other),
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(cycle_delay(&ctx)) => {}
        }
    }
    log::info!("[{}] worker stopped", symbol);
}

/// Top `n` USDT linear symbols by recent activity over 1H candles.
pub async fn rank_symbols(exchange: &dyn Exchange, n: usize) -> Result<Vec<String>, ExchangeError> {
    let all = with_timeout(exchange.fetch_linear_symbols()).await?;
    log::info!("Ranking {} USDT linear symbols…", all.len());
    let mut scored: Vec<(String, f64)> = stream::iter(all)
        .map(|symbol| async move {
            match with_timeout(exchange.fetch_ohlcv(&symbol, TF_ENTRY, SYMBOL_RANK_CANDLES)).await {
                Ok(c) if !c.is_empty() => Some((symbol, indicators::activity_score(&c))),
                Ok(_) => None,
                Err(e) => {
                    log::debug!("[{}] rank fetch failed: {}", symbol, e);
                    None
                }
            }
        })
        .buffer_unordered(RANK_CONCURRENCY)
        .filter_map(|r| async move { r })
        .collect()
        .await;
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(n);
    log::info!(
        "Selected: {}",
        scored.iter().map(|(s, v)| format!("{s} ({v:.0})")).collect::<Vec<_>>().join(", ")
    );
    Ok(scored.into_iter().map(|(s, _)| s).collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerBlock;
    use crate::engine::tests::{context, MockExchange};
    use crate::types::Candle;
    use std::sync::atomic::Ordering;

    /// Rising zig-zag: swing highs every 10 candles, each above the last.
    pub(crate) fn uptrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.5;
                let phase = (i % 10) as f64;
                let offset = if phase <= 5.0 { phase } else { 10.0 - phase };
                let high = base + offset;
                let low = high - 2.0;
                Candle {
                    timestamp: i as i64 * 3_600_000,
                    open: low + 0.5,
                    high,
                    low,
                    close: high - 0.5,
                    volume: 100.0,
                }
            })
            .collect()
    }

    fn exchange_with_trend() -> Arc<MockExchange> {
        let ex = Arc::new(MockExchange::default());
        *ex.balance.lock().unwrap() = 1_000.0;
        let candles = uptrend(150);
        let last = candles[149].close;
        ex.candles.lock().unwrap().insert(format!("BTCUSDT_{TF_ENTRY}"), candles);
        ex.prices.lock().unwrap().insert("BTCUSDT".into(), last);
        ex
    }

    #[test]
    fn leverage_follows_volatility() {
        assert_eq!(adaptive_leverage(1.0, 100.0, 3), 3);
        assert_eq!(adaptive_leverage(5.0, 100.0, 3), 2);
        assert_eq!(adaptive_leverage(1.0, 100.0, 2), 2);
    }

    #[test]
    fn quantities_floor_to_step() {
        assert_eq!(floor_to_step(2.2929, 0.001), 2.292);
        assert_eq!(floor_to_step(0.0004, 0.001), 0.0);
        assert_eq!(floor_to_step(7.0, 1.0), 7.0);
    }

    #[tokio::test]
    async fn uptrend_opens_a_long_and_tracks_it() {
        let dir = tempfile::tempdir().unwrap();
        let ex = exchange_with_trend();
        let ctx = context(dir.path(), Arc::clone(&ex));
        ctx.risk.set_equity(1_000.0);

        let CycleOutcome::Opened(plan) = run_cycle(&ctx, "BTCUSDT").await else {
            panic!("expected an entry");
        };
        assert_eq!(plan.direction, Direction::Long);
        assert!(plan.stop_loss < plan.entry && plan.entry < plan.take_profit_2);
        assert!(plan.size > 0.0);

        assert_eq!(ex.orders.lock().unwrap().len(), 1);
        assert_eq!(ex.leverage_calls.lock().unwrap()[0], ("BTCUSDT".to_string(), 3));
        assert!(ctx.registry.is_tracked("BTCUSDT"));
        assert_eq!(ctx.risk.state().trades_today, 1);
        assert!(dir.path().join("signals.jsonl").exists());

        assert!(matches!(run_cycle(&ctx, "BTCUSDT").await, CycleOutcome::AlreadyTracked));
        ctx.shutdown.cancel();
    }

    #[tokio::test]
    async fn order_failure_counts_toward_the_streak() {
        let dir = tempfile::tempdir().unwrap();
        let ex = exchange_with_trend();
        ex.fail_orders.store(true, Ordering::SeqCst);
        let ctx = context(dir.path(), Arc::clone(&ex));
        ctx.risk.set_equity(1_000.0);

        assert!(matches!(run_cycle(&ctx, "BTCUSDT").await, CycleOutcome::OrderFailed(_)));
        assert_eq!(ctx.breaker.snapshot().loss_streak, 1);
        assert!(!ctx.registry.is_claimed("BTCUSDT"));
        assert_eq!(ctx.risk.state().trades_today, 0);
    }

    #[tokio::test]
    async fn calm_regime_never_risks_more_than_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        // BOS alone is worth everything: full confidence
        std::fs::write(dir.path().join("weights.json"), r#"{"bos": 40}"#).unwrap();
        let ex = exchange_with_trend();
        let ctx = context(dir.path(), Arc::clone(&ex));
        ctx.risk.set_equity(1_000.0);
        ctx.breaker.evaluate_regime();
        assert!(ctx.breaker.risk_scale() > 1.0);

        let CycleOutcome::Opened(plan) = run_cycle(&ctx, "BTCUSDT").await else {
            panic!("expected an entry");
        };
        let risk = plan.entry - plan.stop_loss;
        let risked = plan.size * risk;
        assert!(risked <= 1_000.0 * crate::config::MAX_RISK_PCT * 1.0001, "risked {risked}");
        assert!(risked > 9.9, "risked {risked}");
        // the calm regime's RR sets the final target
        assert!(((plan.take_profit_2 - plan.entry) / risk - 3.0).abs() < 0.02);
        ctx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reply_after_a_fill_is_still_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let ex = exchange_with_trend();
        ex.fill_on_order.store(true, Ordering::SeqCst);
        *ex.order_delay.lock().unwrap() = Some(ORDER_TIMEOUT + Duration::from_secs(5));
        let ctx = context(dir.path(), Arc::clone(&ex));
        ctx.risk.set_equity(1_000.0);

        assert!(matches!(run_cycle(&ctx, "BTCUSDT").await, CycleOutcome::Opened(_)));
        assert_eq!(ex.orders.lock().unwrap().len(), 1);
        assert_eq!(ctx.breaker.snapshot().loss_streak, 0);
        assert!(ctx.registry.is_tracked("BTCUSDT"));
        assert_eq!(ctx.risk.state().trades_today, 1);
        ctx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reply_without_a_position_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ex = exchange_with_trend();
        *ex.order_delay.lock().unwrap() = Some(ORDER_TIMEOUT + Duration::from_secs(5));
        let ctx = context(dir.path(), Arc::clone(&ex));
        ctx.risk.set_equity(1_000.0);

        assert!(matches!(
            run_cycle(&ctx, "BTCUSDT").await,
            CycleOutcome::OrderFailed(ExchangeError::Timeout(_))
        ));
        assert_eq!(ctx.breaker.snapshot().loss_streak, 1);
        assert!(!ctx.registry.is_claimed("BTCUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_within_the_order_timeout_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ex = exchange_with_trend();
        // slower than a read may take, inside the order bound
        *ex.order_delay.lock().unwrap() = Some(crate::config::NETWORK_TIMEOUT + Duration::from_secs(1));
        let ctx = context(dir.path(), Arc::clone(&ex));
        ctx.risk.set_equity(1_000.0);

        assert!(matches!(run_cycle(&ctx, "BTCUSDT").await, CycleOutcome::Opened(_)));
        assert_eq!(ctx.breaker.snapshot().loss_streak, 0);
        ctx.shutdown.cancel();
    }

    #[tokio::test]
    async fn rejected_partial_exits_do_not_undo_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        // raw 50 lands in the split bucket
        std::fs::write(dir.path().join("weights.json"), r#"{"bos": 50, "htf_match_1d": 50}"#).unwrap();
        let ex = exchange_with_trend();
        ex.fail_take_profits.store(true, Ordering::SeqCst);
        let ctx = context(dir.path(), Arc::clone(&ex));
        ctx.risk.set_equity(1_000.0);

        let CycleOutcome::Opened(plan) = run_cycle(&ctx, "BTCUSDT").await else {
            panic!("expected an entry");
        };
        assert!(plan.take_profit_1.is_some());
        assert_eq!(ex.take_profits.lock().unwrap().len(), 1);
        assert!(ctx.registry.is_tracked("BTCUSDT"));
        assert_eq!(ctx.breaker.snapshot().loss_streak, 0);
        ctx.shutdown.cancel();
    }

    #[tokio::test]
    async fn cooldown_lengthens_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), exchange_with_trend());
        assert_eq!(cycle_delay(&ctx), CYCLE_INTERVAL);
        for _ in 0..3 {
            ctx.breaker.record_order_failure(Utc::now());
        }
        assert_eq!(cycle_delay(&ctx), COOLDOWN_CYCLE_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_cycles_on_the_normal_interval() {
        let dir = tempfile::tempdir().unwrap();
        let ex = Arc::new(MockExchange::default());
        *ex.balance.lock().unwrap() = 1_000.0;
        let ctx = context(dir.path(), Arc::clone(&ex));
        ctx.risk.set_equity(1_000.0);
        let token = CancellationToken::new();
        let worker = tokio::spawn(run_symbol(Arc::clone(&ctx), "BTCUSDT".into(), token.clone()));

        tokio::time::sleep(CYCLE_INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(ex.balance_calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ex.balance_calls.load(Ordering::SeqCst), 2);

        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn halted_engine_skips_before_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), exchange_with_trend());
        ctx.overrides.set_halted(true);
        assert!(matches!(run_cycle(&ctx, "BTCUSDT").await, CycleOutcome::Blocked(Rejection::Halted)));
        // equity was never fetched
        assert_eq!(ctx.risk.state().current_equity, None);
    }

    #[tokio::test]
    async fn monitoring_only_blocks_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), exchange_with_trend());
        ctx.risk.set_equity(1_000.0);
        for i in 0..20 {
            ctx.breaker.record_liquidation(crate::types::Liquidation {
                symbol: "ETHUSDT".into(),
                side: "Buy".into(),
                price: 1_000.0,
                qty: 60.0,
                timestamp: Utc::now() - chrono::Duration::minutes(10 + i),
            });
        }
        assert!(matches!(
            run_cycle(&ctx, "BTCUSDT").await,
            CycleOutcome::Blocked(Rejection::Breaker(BreakerBlock::MonitoringOnly))
        ));
    }

    #[tokio::test]
    async fn short_history_is_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        let ex = exchange_with_trend();
        ex.candles.lock().unwrap().insert(format!("BTCUSDT_{TF_ENTRY}"), uptrend(30));
        let ctx = context(dir.path(), ex);
        ctx.risk.set_equity(1_000.0);
        assert!(matches!(run_cycle(&ctx, "BTCUSDT").await, CycleOutcome::InsufficientData(30)));
    }

    #[tokio::test]
    async fn ranking_prefers_active_symbols() {
        let ex = MockExchange::default();
        let flat: Vec<Candle> = (0..50)
            .map(|i| Candle { timestamp: i, open: 10.0, high: 10.1, low: 9.9, close: 10.0, volume: 5.0 })
            .collect();
        ex.candles.lock().unwrap().insert(format!("AAAUSDT_{TF_ENTRY}"), flat);
        ex.candles.lock().unwrap().insert(format!("BBBUSDT_{TF_ENTRY}"), uptrend(50));
        let top = rank_symbols(&ex, 1).await.unwrap();
        assert_eq!(top, vec!["BBBUSDT"]);
    }
}
