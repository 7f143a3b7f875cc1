//! Cross-cutting breakers on one shared [`CircuitState`]:
//! loss-streak cooldown, liquidation-driven regime switch with a one-way
//! emergency stop, and the connectivity-loss halt.
//!
//! Fields are supervisory scalars read by every symbol task; each method
//! takes the lock once and never across an await.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::{
    COOLDOWN_MINUTES, CONNECTIVITY_FAIL_LIMIT, EMERGENCY_COUNT, EMERGENCY_MIN_VALUE_USDT,
    EMERGENCY_WINDOW_SECS, LIQUIDATION_THRESHOLD_USDT, LOSS_STREAK_LIMIT,
    RECENT_LIQUIDATIONS_CAP, REGIME_AGGRESSIVE, REGIME_DEFENSIVE, REGIME_HIGH_COUNT,
    REGIME_LOW_COUNT, REGIME_NORMAL,
};
use crate::types::Liquidation;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Regime {
    Defensive,
    Normal,
    Aggressive,
}

impl Regime {
    fn params(self) -> (f64, f64) {
        match self {
            Regime::Defensive => REGIME_DEFENSIVE,
            Regime::Normal => REGIME_NORMAL,
            Regime::Aggressive => REGIME_AGGRESSIVE,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CircuitState {
    pub loss_streak: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub monitoring_only: bool,
    pub emergency_active: bool,
    pub regime: Regime,
    pub current_risk_pct: f64,
    pub current_rr: f64,
    pub liquidation_counter: u32,
    pub connectivity_failures: u32,
    pub connectivity_lost: bool,
}

impl Default for CircuitState {
    fn default() -> Self {
        let (risk, rr) = REGIME_NORMAL;
        CircuitState {
            loss_streak: 0,
            cooldown_until: None,
            monitoring_only: false,
            emergency_active: false,
            regime: Regime::Normal,
            current_risk_pct: risk,
            current_rr: rr,
            liquidation_counter: 0,
            connectivity_failures: 0,
            connectivity_lost: false,
        }
    }
}

/// Transitions worth telling the operator about.
#[derive(Clone, Debug, PartialEq)]
pub enum BreakerEvent {
    CooldownStarted { until: DateTime<Utc> },
    CooldownEnded,
    RegimeChanged { regime: Regime, monitoring_only: bool },
    LargeLiquidation(Liquidation),
    EmergencyStop { reason: String },
    ConnectivityLost,
    ConnectivityRestored,
}

impl BreakerEvent {
    pub fn message(&self) -> String {
        match self {
            BreakerEvent::CooldownStarted { until } => format!(
                "🚨 <b>Auto-cooldown</b>: {} consecutive failures, entries paused until {} UTC",
                LOSS_STREAK_LIMIT,
                until.format("%H:%M")
            ),
            BreakerEvent::CooldownEnded => "✅ Cooldown over. Trading resumed.".to_string(),
            BreakerEvent::RegimeChanged { regime: Regime::Defensive, .. } => {
                "🚨 Liquidation cascade: switching to <b>monitoring-only</b> mode".to_string()
            }
            BreakerEvent::RegimeChanged { regime: Regime::Aggressive, .. } => {
                "🌙 Market calm: back to normal trading (aggressive sizing)".to_string()
            }
            BreakerEvent::RegimeChanged { regime: Regime::Normal, .. } => {
                "⚖️ Liquidation activity moderate: normal sizing".to_string()
            }
            BreakerEvent::LargeLiquidation(l) => format!(
                "💥 Large liquidation on <b>{}</b>\n• Side: {}\n• Value: <code>{:.0} USDT</code>\n• Price: <code>{:.2}</code>",
                l.symbol, l.side, l.value_usdt(), l.price
            ),
            BreakerEvent::EmergencyStop { reason } => {
                format!("🚨 <b>Emergency stop</b> activated: {reason}. Manual reset required (/reset_emergency).")
            }
            BreakerEvent::ConnectivityLost => {
                "🚨 Exchange connection lost. Entries halted, workers stopped.".to_string()
            }
            BreakerEvent::ConnectivityRestored => {
                "✅ Exchange connection restored. Restarting workers.".to_string()
            }
        }
    }
}

/// Why the breaker is currently blocking entries, if it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerBlock {
    MonitoringOnly,
    Cooldown,
    Emergency,
    ConnectivityLost,
}

pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    recent: Mutex<VecDeque<Liquidation>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker {
            state: Mutex::new(CircuitState::default()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_LIQUIDATIONS_CAP)),
        }
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CircuitState {
        lock(&self.state).clone()
    }

    /// Size multiplier relative to the normal regime. Sizing caps the scaled
    /// risk at the per-trade maximum.
    pub fn risk_scale(&self) -> f64 {
        lock(&self.state).current_risk_pct / REGIME_NORMAL.0
    }

    /// Target RR imposed by a non-normal regime; `None` in the normal one.
    pub fn regime_rr(&self) -> Option<f64> {
        let st = lock(&self.state);
        (st.regime != Regime::Normal).then_some(st.current_rr)
    }

    pub fn blocking_reason(&self, now: DateTime<Utc>) -> Option<BreakerBlock> {
        let st = lock(&self.state);
        if st.connectivity_lost {
            Some(BreakerBlock::ConnectivityLost)
        } else if st.emergency_active {
            Some(BreakerBlock::Emergency)
        } else if st.monitoring_only {
            Some(BreakerBlock::MonitoringOnly)
        } else if st.cooldown_until.is_some_and(|until| until > now) {
            Some(BreakerBlock::Cooldown)
        } else {
            None
        }
    }

    pub fn cooldown_active(&self, now: DateTime<Utc>) -> bool {
        lock(&self.state).cooldown_until.is_some_and(|until| until > now)
    }

    // ── (a) loss-streak cooldown ─────────────────────────────────────────────

    /// A failed order placement. At the streak limit starts a cooldown; while
    /// one is active further failures change nothing.
    pub fn record_order_failure(&self, now: DateTime<Utc>) -> Option<BreakerEvent> {
        let mut st = lock(&self.state);
        if st.cooldown_until.is_some_and(|until| until > now) {
            return None;
        }
        st.loss_streak += 1;
        if st.loss_streak >= LOSS_STREAK_LIMIT {
            let until = now + Duration::minutes(COOLDOWN_MINUTES);
            st.cooldown_until = Some(until);
            log::warn!("Loss streak {} → cooldown until {}", st.loss_streak, until);
            return Some(BreakerEvent::CooldownStarted { until });
        }
        None
    }

    /// Closed-trade result: a loss extends the streak, a win clears it.
    pub fn record_trade_outcome(&self, pnl: f64, now: DateTime<Utc>) -> Option<BreakerEvent> {
        if pnl < 0.0 {
            return self.record_order_failure(now);
        }
        let mut st = lock(&self.state);
        if st.cooldown_until.is_none() {
            st.loss_streak = 0;
        }
        None
    }

    /// Clears an expired cooldown and its streak.
    pub fn refresh_cooldown(&self, now: DateTime<Utc>) -> Option<BreakerEvent> {
        let mut st = lock(&self.state);
        match st.cooldown_until {
            Some(until) if until <= now => {
                st.cooldown_until = None;
                st.loss_streak = 0;
                log::info!("Cooldown expired, loss streak reset");
                Some(BreakerEvent::CooldownEnded)
            }
            _ => None,
        }
    }

    // ── (b) liquidation regime / emergency ───────────────────────────────────

    /// Feed one streamed liquidation. Small ones are ignored.
    pub fn record_liquidation(&self, liq: Liquidation) -> Vec<BreakerEvent> {
        let mut events = Vec::new();
        if liq.value_usdt() < LIQUIDATION_THRESHOLD_USDT {
            return events;
        }
        let now = liq.timestamp;
        {
            let mut recent = lock(&self.recent);
            if recent.len() == RECENT_LIQUIDATIONS_CAP {
                recent.pop_front();
            }
            recent.push_back(liq.clone());
        }
        events.push(BreakerEvent::LargeLiquidation(liq));

        let counter = {
            let mut st = lock(&self.state);
            st.liquidation_counter += 1;
            st.liquidation_counter
        };
        if counter >= REGIME_HIGH_COUNT {
            events.extend(self.evaluate_regime());
        }
        events.extend(self.check_emergency(now));
        events
    }

    /// ≥ high ⇒ defensive + monitoring-only; < low ⇒ aggressive; both reset
    /// the counter. In between the regime is normal and the count keeps rolling.
    pub fn evaluate_regime(&self) -> Option<BreakerEvent> {
        let mut st = lock(&self.state);
        let regime = if st.liquidation_counter >= REGIME_HIGH_COUNT {
            st.liquidation_counter = 0;
            Regime::Defensive
        } else if st.liquidation_counter < REGIME_LOW_COUNT {
            st.liquidation_counter = 0;
            Regime::Aggressive
        } else {
            Regime::Normal
        };
        let (risk, rr) = regime.params();
        st.current_risk_pct = risk;
        st.current_rr = rr;
        st.monitoring_only = regime == Regime::Defensive;
        if st.regime == regime {
            return None;
        }
        st.regime = regime;
        log::warn!("Regime → {:?} (risk {:.3}, rr {:.1})", regime, risk, rr);
        Some(BreakerEvent::RegimeChanged { regime, monitoring_only: st.monitoring_only })
    }

    pub fn count_recent_liquidations(
        &self,
        now: DateTime<Utc>,
        window_secs: i64,
        min_value_usdt: f64,
    ) -> usize {
        lock(&self.recent)
            .iter()
            .filter(|l| {
                (now - l.timestamp).num_seconds() <= window_secs && l.value_usdt() >= min_value_usdt
            })
            .count()
    }

    pub fn recent_liquidations(&self) -> Vec<Liquidation> {
        lock(&self.recent).iter().cloned().collect()
    }

    fn check_emergency(&self, now: DateTime<Utc>) -> Option<BreakerEvent> {
        let count =
            self.count_recent_liquidations(now, EMERGENCY_WINDOW_SECS, EMERGENCY_MIN_VALUE_USDT);
        if count < EMERGENCY_COUNT {
            return None;
        }
        let mut st = lock(&self.state);
        if st.emergency_active {
            return None;
        }
        st.emergency_active = true;
        let reason = format!("{count} liquidations ≥ ${EMERGENCY_MIN_VALUE_USDT:.0} within 5 minutes");
        log::error!("Emergency stop activated: {}", reason);
        Some(BreakerEvent::EmergencyStop { reason })
    }

    /// The only way out of an emergency stop.
    pub fn reset_emergency(&self) -> bool {
        let mut st = lock(&self.state);
        std::mem::replace(&mut st.emergency_active, false)
    }

    // ── (c) connectivity ─────────────────────────────────────────────────────

    pub fn record_balance_fetch(&self, ok: bool) -> Option<BreakerEvent> {
        let mut st = lock(&self.state);
        if ok {
            st.connectivity_failures = 0;
            if st.connectivity_lost {
                st.connectivity_lost = false;
                log::info!("Exchange connectivity restored");
                return Some(BreakerEvent::ConnectivityRestored);
            }
            return None;
        }
        st.connectivity_failures += 1;
        log::warn!("Balance fetch failed ({} in a row)", st.connectivity_failures);
        if st.connectivity_failures >= CONNECTIVITY_FAIL_LIMIT && !st.connectivity_lost {
            st.connectivity_lost = true;
            log::error!("Exchange connectivity lost");
            return Some(BreakerEvent::ConnectivityLost);
        }
        None
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn liq(value: f64, at: DateTime<Utc>) -> Liquidation {
        Liquidation { symbol: "BTCUSDT".into(), side: "Sell".into(), price: 1.0, qty: value, timestamp: at }
    }

    #[test]
    fn three_failures_start_cooldown_and_fourth_does_not_extend() {
        let cb = CircuitBreaker::new();
        let t0 = Utc::now();
        assert_eq!(cb.record_order_failure(t0), None);
        assert_eq!(cb.record_order_failure(t0), None);
        let started = cb.record_order_failure(t0);
        let until = t0 + Duration::minutes(120);
        assert_eq!(started, Some(BreakerEvent::CooldownStarted { until }));
        assert_eq!(cb.blocking_reason(t0), Some(BreakerBlock::Cooldown));

        let later = t0 + Duration::minutes(30);
        assert_eq!(cb.record_order_failure(later), None);
        assert_eq!(cb.snapshot().cooldown_until, Some(until));
        assert_eq!(cb.snapshot().loss_streak, 3);
    }

    #[test]
    fn expiry_resets_streak_and_resumes() {
        let cb = CircuitBreaker::new();
        let t0 = Utc::now();
        for _ in 0..3 {
            cb.record_order_failure(t0);
        }
        assert_eq!(cb.refresh_cooldown(t0 + Duration::minutes(60)), None);
        let after = t0 + Duration::minutes(121);
        assert!(!cb.cooldown_active(after));
        assert_eq!(cb.refresh_cooldown(after), Some(BreakerEvent::CooldownEnded));
        assert_eq!(cb.snapshot().loss_streak, 0);
        assert_eq!(cb.blocking_reason(after), None);
    }

    #[test]
    fn winning_trade_clears_streak() {
        let cb = CircuitBreaker::new();
        let t0 = Utc::now();
        cb.record_order_failure(t0);
        cb.record_trade_outcome(-5.0, t0);
        assert_eq!(cb.snapshot().loss_streak, 2);
        cb.record_trade_outcome(3.0, t0);
        assert_eq!(cb.snapshot().loss_streak, 0);
    }

    #[test]
    fn twenty_liquidations_force_monitoring_only_and_reset_counter() {
        let cb = CircuitBreaker::new();
        let t0 = Utc::now();
        let mut last = Vec::new();
        for i in 0..20 {
            // spaced out so the emergency window never fills
            last = cb.record_liquidation(liq(60_000.0, t0 + Duration::minutes(10 * i)));
        }
        let st = cb.snapshot();
        assert!(st.monitoring_only);
        assert_eq!(st.liquidation_counter, 0);
        assert_eq!(st.current_risk_pct, REGIME_DEFENSIVE.0);
        assert!(last.contains(&BreakerEvent::RegimeChanged { regime: Regime::Defensive, monitoring_only: true }));
        assert_eq!(cb.blocking_reason(t0), Some(BreakerBlock::MonitoringOnly));

        // a quiet window flips back to aggressive defaults
        assert_eq!(
            cb.evaluate_regime(),
            Some(BreakerEvent::RegimeChanged { regime: Regime::Aggressive, monitoring_only: false })
        );
        assert!(!cb.snapshot().monitoring_only);
        assert!(cb.risk_scale() > 1.0);
        assert_eq!(cb.regime_rr(), Some(REGIME_AGGRESSIVE.1));
    }

    #[test]
    fn moderate_activity_keeps_counting() {
        let cb = CircuitBreaker::new();
        let t0 = Utc::now();
        for i in 0..5 {
            cb.record_liquidation(liq(60_000.0, t0 + Duration::minutes(10 * i)));
        }
        assert_eq!(cb.evaluate_regime(), None);
        assert_eq!(cb.snapshot().liquidation_counter, 5);
        assert_eq!(cb.regime_rr(), None);
    }

    #[test]
    fn small_liquidations_are_ignored() {
        let cb = CircuitBreaker::new();
        assert!(cb.record_liquidation(liq(10_000.0, Utc::now())).is_empty());
        assert_eq!(cb.snapshot().liquidation_counter, 0);
    }

    #[test]
    fn five_huge_liquidations_in_window_trip_one_way_emergency() {
        let cb = CircuitBreaker::new();
        let t0 = Utc::now();
        let mut tripped = 0;
        for i in 0..6 {
            let events = cb.record_liquidation(liq(600_000.0, t0 + Duration::seconds(30 * i)));
            tripped += events.iter().filter(|e| matches!(e, BreakerEvent::EmergencyStop { .. })).count();
        }
        assert_eq!(tripped, 1);
        assert!(cb.snapshot().emergency_active);
        // stays on no matter what the regime evaluation says
        cb.evaluate_regime();
        assert!(cb.snapshot().emergency_active);
        assert!(cb.reset_emergency());
        assert!(!cb.snapshot().emergency_active);
    }

    #[test]
    fn spread_out_huge_liquidations_do_not_trip() {
        let cb = CircuitBreaker::new();
        let t0 = Utc::now();
        for i in 0..5 {
            cb.record_liquidation(liq(600_000.0, t0 + Duration::minutes(2 * i)));
        }
        assert!(!cb.snapshot().emergency_active);
    }

    #[test]
    fn connectivity_halts_after_three_failures_and_restores() {
        let cb = CircuitBreaker::new();
        assert_eq!(cb.record_balance_fetch(false), None);
        assert_eq!(cb.record_balance_fetch(false), None);
        assert_eq!(cb.record_balance_fetch(false), Some(BreakerEvent::ConnectivityLost));
        assert_eq!(cb.record_balance_fetch(false), None);
        assert_eq!(cb.blocking_reason(Utc::now()), Some(BreakerBlock::ConnectivityLost));
        assert_eq!(cb.record_balance_fetch(true), Some(BreakerEvent::ConnectivityRestored));
        assert_eq!(cb.record_balance_fetch(true), None);
        assert_eq!(cb.blocking_reason(Utc::now()), None);
    }
}
