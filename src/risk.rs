use std::sync::Mutex;

use crate::config::{
    DAILY_LOSS_LIMIT_PCT, MAX_DRAWDOWN_PCT, MAX_RISK_PCT, MAX_TRADES_PER_DAY, MIN_RISK_PCT,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RiskLimits {
    pub min_risk_pct: f64,
    pub max_risk_pct: f64,
    pub daily_loss_limit_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_trades_per_day: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        RiskLimits {
            min_risk_pct: MIN_RISK_PCT,
            max_risk_pct: MAX_RISK_PCT,
            daily_loss_limit_pct: DAILY_LOSS_LIMIT_PCT,
            max_drawdown_pct: MAX_DRAWDOWN_PCT,
            max_trades_per_day: MAX_TRADES_PER_DAY,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RiskState {
    pub start_equity: Option<f64>,
    pub current_equity: Option<f64>,
    pub equity_high_watermark: Option<f64>,
    pub trades_today: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskVerdict {
    Allowed,
    Uninitialized,
    DailyLossLimit,
    MaxDrawdown,
    TradeCountLimit,
}

impl RiskVerdict {
    pub fn is_allowed(self) -> bool {
        self == RiskVerdict::Allowed
    }

    pub fn describe(self) -> &'static str {
        match self {
            RiskVerdict::Allowed => "within limits",
            RiskVerdict::Uninitialized => "equity not yet known",
            RiskVerdict::DailyLossLimit => "daily loss limit reached",
            RiskVerdict::MaxDrawdown => "max drawdown reached",
            RiskVerdict::TradeCountLimit => "daily trade count reached",
        }
    }
}

/// Process-wide equity tracking and position sizing.
pub struct RiskManager {
    limits: RiskLimits,
    state: Mutex<RiskState>,
    /// Last verdict reported through `violation_transition`.
    last_reported: Mutex<RiskVerdict>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        RiskManager {
            limits,
            state: Mutex::new(RiskState::default()),
            last_reported: Mutex::new(RiskVerdict::Allowed),
        }
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits
    }

    pub fn state(&self) -> RiskState {
        *lock(&self.state)
    }

    /// First call seeds start equity and the high watermark; later calls
    /// update current equity and only ever raise the watermark.
    pub fn set_equity(&self, balance: f64) {
        if !balance.is_finite() {
            return;
        }
        let mut st = lock(&self.state);
        if st.start_equity.is_none() {
            st.start_equity = Some(balance);
            st.equity_high_watermark = Some(balance);
        }
        st.current_equity = Some(balance);
        st.equity_high_watermark = Some(st.equity_high_watermark.map_or(balance, |h| h.max(balance)));
    }

    pub fn record_trade(&self) {
        lock(&self.state).trades_today += 1;
    }

    /// UTC-midnight rollover: today's loss budget restarts from current equity.
    pub fn start_new_day(&self) {
        let mut st = lock(&self.state);
        if let Some(current) = st.current_equity {
            st.start_equity = Some(current);
        }
        st.trades_today = 0;
    }

    pub fn verdict(&self) -> RiskVerdict {
        let st = *lock(&self.state);
        let (Some(start), Some(current), Some(high)) =
            (st.start_equity, st.current_equity, st.equity_high_watermark)
        else {
            return RiskVerdict::Uninitialized;
        };
        if start - current >= start * self.limits.daily_loss_limit_pct {
            return RiskVerdict::DailyLossLimit;
        }
        if high > 0.0 && (high - current) / high >= self.limits.max_drawdown_pct {
            return RiskVerdict::MaxDrawdown;
        }
        if st.trades_today >= self.limits.max_trades_per_day {
            return RiskVerdict::TradeCountLimit;
        }
        RiskVerdict::Allowed
    }

    pub fn allowed_to_trade(&self) -> bool {
        self.verdict().is_allowed()
    }

    /// `Some(verdict)` exactly once per transition into a violation, so the
    /// operator is told once rather than every cycle. Returning to
    /// `Allowed` re-arms it.
    pub fn violation_transition(&self) -> Option<RiskVerdict> {
        let verdict = self.verdict();
        let mut last = lock(&self.last_reported);
        let changed = *last != verdict;
        *last = verdict;
        match verdict {
            RiskVerdict::Allowed | RiskVerdict::Uninitialized => None,
            v if changed => Some(v),
            _ => None,
        }
    }

    pub fn risk_pct_from_confidence(&self, score: f64) -> f64 {
        let score = score.clamp(0.0, 1.0);
        self.limits.min_risk_pct + (self.limits.max_risk_pct - self.limits.min_risk_pct) * score
    }

    /// balance × riskPct / |entry − stop|, rounded to 4 decimals; 0 for
    /// degenerate inputs. riskPct is the confidence risk times the regime
    /// `scale`, capped at `max_risk_pct`.
    pub fn calculate_position_size(
        &self,
        balance: f64,
        entry: f64,
        stop: f64,
        confidence_score: f64,
        scale: f64,
    ) -> f64 {
        let risk_pct = (self.risk_pct_from_confidence(confidence_score) * scale.max(0.0))
            .min(self.limits.max_risk_pct);
        self.size_for_risk(balance, entry, stop, risk_pct)
    }

    fn size_for_risk(&self, balance: f64, entry: f64, stop: f64, risk_pct: f64) -> f64 {
        if balance <= 0.0 || entry <= 0.0 || stop <= 0.0 {
            log::error!(
                "Invalid sizing inputs balance={:.2} entry={} stop={}",
                balance, entry, stop
            );
            return 0.0;
        }
        let sl_distance = (entry - stop).abs();
        if sl_distance == 0.0 {
            log::error!("Stop distance is zero (entry={})", entry);
            return 0.0;
        }
        let risk_amount = balance * risk_pct;
        ((risk_amount / sl_distance) * 10_000.0).round() / 10_000.0
    }
}

impl Default for RiskManager {
    fn default() -> Self {
        RiskManager::new(RiskLimits::default())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
