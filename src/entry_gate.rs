use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::circuit_breaker::{BreakerBlock, CircuitBreaker};
use crate::config::{ADMISSION_THRESHOLD, ENTRY_TIMEOUT_SECS, REENTRY_DEVIATION_PCT};
use crate::overrides::{OperatorOverrides, OverrideState};
use crate::risk::{RiskManager, RiskVerdict};
use crate::types::{Direction, Signal};

#[derive(Clone, Copy, Debug, PartialEq)]
struct LastEntry {
    price: f64,
    direction: Direction,
    at: DateTime<Utc>,
}

/// Last admitted entry per symbol.
#[derive(Default)]
pub struct EntryCache {
    entries: Mutex<HashMap<String, LastEntry>>,
}

impl EntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// False only for the same direction, within the timeout, and within 1 %
    /// of the cached price.
    pub fn allow_reentry(
        &self,
        symbol: &str,
        price: f64,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> bool {
        let entries = lock(&self.entries);
        let Some(last) = entries.get(symbol) else {
            return true;
        };
        if now - last.at >= Duration::seconds(ENTRY_TIMEOUT_SECS) {
            return true;
        }
        if last.direction != direction {
            return true;
        }
        if last.price <= 0.0 {
            return true;
        }
        let deviation = (price - last.price).abs() / last.price;
        deviation >= REENTRY_DEVIATION_PCT
    }

    pub fn record(&self, symbol: &str, price: f64, direction: Direction, now: DateTime<Utc>) {
        lock(&self.entries).insert(symbol.to_string(), LastEntry { price, direction, at: now });
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Rejection {
    Halted,
    Paused,
    Breaker(BreakerBlock),
    Risk(RiskVerdict),
    LowConfidence(i64),
    NeutralDirection,
    RecentEntry,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Halted => write!(f, "halted by operator"),
            Rejection::Paused => write!(f, "paused by operator"),
            Rejection::Breaker(BreakerBlock::MonitoringOnly) => write!(f, "monitoring-only mode"),
            Rejection::Breaker(BreakerBlock::Cooldown) => write!(f, "loss-streak cooldown"),
            Rejection::Breaker(BreakerBlock::Emergency) => write!(f, "emergency stop active"),
            Rejection::Breaker(BreakerBlock::ConnectivityLost) => write!(f, "exchange connectivity lost"),
            Rejection::Risk(v) => write!(f, "risk: {}", v.describe()),
            Rejection::LowConfidence(c) => {
                write!(f, "confidence {} below {}", c, ADMISSION_THRESHOLD)
            }
            Rejection::NeutralDirection => write!(f, "no direction"),
            Rejection::RecentEntry => write!(f, "recent entry at a similar price"),
        }
    }
}

/// Per-cycle admission check over the shared supervisory state.
pub struct EntryGate {
    overrides: Arc<OperatorOverrides>,
    breaker: Arc<CircuitBreaker>,
    risk: Arc<RiskManager>,
    cache: EntryCache,
}

impl EntryGate {
    pub fn new(
        overrides: Arc<OperatorOverrides>,
        breaker: Arc<CircuitBreaker>,
        risk: Arc<RiskManager>,
    ) -> Self {
        EntryGate { overrides, breaker, risk, cache: EntryCache::new() }
    }

    /// Signal-independent part of the gate. Cheap enough to run before any
    /// market-data fetch.
    pub async fn precheck(&self, now: DateTime<Utc>) -> Result<(), Rejection> {
        match self.overrides.state().await {
            OverrideState::Halted => return Err(Rejection::Halted),
            OverrideState::Paused => return Err(Rejection::Paused),
            OverrideState::Running => {}
        }
        if let Some(block) = self.breaker.blocking_reason(now) {
            return Err(Rejection::Breaker(block));
        }
        match self.risk.verdict() {
            RiskVerdict::Allowed => Ok(()),
            v => Err(Rejection::Risk(v)),
        }
    }

    /// Full admission. Re-reads every flag, so it is safe to call after the
    /// awaits that produced `signal`. Records the entry on success.
    pub async fn admit(&self, signal: &Signal) -> Result<(), Rejection> {
        self.precheck(signal.timestamp).await?;
        if signal.direction == Direction::Neutral {
            return Err(Rejection::NeutralDirection);
        }
        if signal.confidence < ADMISSION_THRESHOLD {
            return Err(Rejection::LowConfidence(signal.confidence));
        }
        if !self.cache.allow_reentry(&signal.symbol, signal.price, signal.direction, signal.timestamp) {
            return Err(Rejection::RecentEntry);
        }
        self.cache.record(&signal.symbol, signal.price, signal.direction, signal.timestamp);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentry_suppression() {
        let cache = EntryCache::new();
        let t0 = Utc::now();
        cache.record("BTCUSDT", 10_000.0, Direction::Long, t0);

        assert!(!cache.allow_reentry("BTCUSDT", 10_000.0, Direction::Long, t0));
        assert!(cache.allow_reentry("BTCUSDT", 10_100.0, Direction::Long, t0));
        assert!(cache.allow_reentry("BTCUSDT", 10_000.0, Direction::Short, t0));
        assert!(cache.allow_reentry("BTCUSDT", 10_000.0, Direction::Long, t0 + Duration::minutes(31)));
        assert!(cache.allow_reentry("ETHUSDT", 10_000.0, Direction::Long, t0));
    }

    #[test]
    fn deviation_is_relative_for_sub_dollar_prices() {
        let cache = EntryCache::new();
        let t0 = Utc::now();
        cache.record("DOGEUSDT", 0.10, Direction::Long, t0);

        assert!(cache.allow_reentry("DOGEUSDT", 0.105, Direction::Long, t0));
        assert!(cache.allow_reentry("DOGEUSDT", 0.098, Direction::Long, t0));
        assert!(!cache.allow_reentry("DOGEUSDT", 0.1005, Direction::Long, t0));

        cache.record("SHIBUSDT", 0.000_012, Direction::Short, t0);
        assert!(!cache.allow_reentry("SHIBUSDT", 0.000_012_05, Direction::Short, t0));
        assert!(cache.allow_reentry("SHIBUSDT", 0.000_013, Direction::Short, t0));
    }

    fn gate(dir: &tempfile::TempDir) -> (EntryGate, Arc<CircuitBreaker>, Arc<RiskManager>, Arc<OperatorOverrides>) {
        let overrides = Arc::new(OperatorOverrides::new(dir.path().join("halt"), dir.path().join("pause")));
        let breaker = Arc::new(CircuitBreaker::new());
        let risk = Arc::new(RiskManager::default());
        risk.set_equity(1_000.0);
        let g = EntryGate::new(overrides.clone(), breaker.clone(), risk.clone());
        (g, breaker, risk, overrides)
    }

    fn signal(confidence: i64, price: f64) -> Signal {
        Signal {
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            confidence,
            normalized: 0.3,
            reasons: vec![],
            price,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn admits_once_then_suppresses_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let (g, ..) = gate(&dir);
        assert_eq!(g.admit(&signal(39, 100.0)).await, Err(Rejection::LowConfidence(39)));
        assert_eq!(g.admit(&signal(40, 100.0)).await, Ok(()));
        assert_eq!(g.admit(&signal(60, 100.2)).await, Err(Rejection::RecentEntry));
        assert_eq!(g.admit(&signal(60, 102.0)).await, Ok(()));
    }

    #[tokio::test]
    async fn supervisory_state_blocks_admission() {
        let dir = tempfile::tempdir().unwrap();
        let (g, breaker, risk, overrides) = gate(&dir);

        overrides.set_paused(true);
        assert_eq!(g.admit(&signal(80, 100.0)).await, Err(Rejection::Paused));
        overrides.set_paused(false);

        std::fs::write(dir.path().join("halt"), "").unwrap();
        assert_eq!(g.admit(&signal(80, 100.0)).await, Err(Rejection::Halted));
        std::fs::remove_file(dir.path().join("halt")).unwrap();

        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_order_failure(now);
        }
        assert_eq!(
            g.admit(&signal(80, 100.0)).await,
            Err(Rejection::Breaker(BreakerBlock::Cooldown))
        );
        breaker.refresh_cooldown(now + Duration::minutes(121));
        assert!(g.precheck(now).await.is_ok());

        risk.set_equity(900.0);
        assert_eq!(
            g.admit(&signal(80, 100.0)).await,
            Err(Rejection::Risk(RiskVerdict::DailyLossLimit))
        );
    }
}
