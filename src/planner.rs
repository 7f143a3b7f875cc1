//! Stop / target / trailing derivation.
//!
//! Volatility-scaled placement is used when a per-symbol table entry exists
//! and ATR is usable; otherwise the confidence-bucketed fixed-percent mode.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::config::{DEFAULT_RR, DEFAULT_SL_MULT, DEFAULT_SL_PCT};
use crate::error::ConfigError;
use crate::types::{round_to, Direction, TradePlan, TrailingConfig};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct BucketParams {
    #[serde(alias = "sl_buffer")]
    pub sl_mult: f64,
    pub tp_rr: f64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SymbolSlTp {
    pub low_confidence: Option<BucketParams>,
    pub mid_confidence: Option<BucketParams>,
    pub high_confidence: Option<BucketParams>,
}

impl SymbolSlTp {
    /// Buckets on normalised confidence: < 0.4 low, < 0.7 mid, else high.
    pub fn bucket(&self, normalized: f64) -> BucketParams {
        let entry = if normalized < 0.4 {
            self.low_confidence
        } else if normalized < 0.7 {
            self.mid_confidence
        } else {
            self.high_confidence
        };
        entry.unwrap_or(BucketParams { sl_mult: DEFAULT_SL_MULT, tp_rr: DEFAULT_RR })
    }
}

pub type SlTpTable = HashMap<String, SymbolSlTp>;

/// Hot-swappable per-symbol SL/TP table.
pub struct SlTpStore {
    current: RwLock<Arc<SlTpTable>>,
}

impl SlTpStore {
    pub fn new(table: SlTpTable) -> Self {
        SlTpStore { current: RwLock::new(Arc::new(table)) }
    }

    pub fn load_or_empty(path: &Path) -> Self {
        let store = SlTpStore::new(SlTpTable::new());
        match store.reload_from(path) {
            Ok(n) => log::info!("SL/TP table loaded for {} symbols", n),
            Err(e) => log::warn!("No per-symbol SL/TP table, fixed buckets only: {}", e),
        }
        store
    }

    pub fn snapshot(&self) -> Arc<SlTpTable> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn reload_from(&self, path: &Path) -> Result<usize, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table: SlTpTable = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let n = table.len();
        let table = Arc::new(table);
        match self.current.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
        Ok(n)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PlanInput {
    pub entry: f64,
    pub direction: Direction,
    /// Raw 0–100 confidence.
    pub confidence: i64,
    /// 0–1 confidence.
    pub normalized: f64,
    pub atr: f64,
    pub price_decimals: u32,
    /// Final-target RR set by the liquidation regime. Overrides the
    /// confidence bucket in fixed-bucket mode.
    pub regime_rr: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlanMode {
    FixedBucket,
    VolatilityScaled,
}

/// Fixed-percent stop and single target at `rr` × stop distance.
/// Returns (stop, target).
pub fn calculate_sl_tp(entry: f64, direction: Direction, rr: f64, sl_pct: f64) -> (f64, f64) {
    let s = direction.sign();
    let distance = entry * sl_pct;
    (entry - s * distance, entry + s * distance * rr)
}

struct Bucket {
    rr1: Option<f64>,
    rr2: f64,
    tp1_ratio: f64,
    tp2_ratio: f64,
}

fn fixed_bucket(confidence: i64) -> Bucket {
    match confidence {
        c if c <= 45 => Bucket { rr1: Some(1.2), rr2: 2.0, tp1_ratio: 0.5, tp2_ratio: 0.5 },
        c if c <= 60 => Bucket { rr1: Some(1.5), rr2: 2.5, tp1_ratio: 0.5, tp2_ratio: 0.5 },
        c if c <= 75 => Bucket { rr1: Some(1.5), rr2: 3.0, tp1_ratio: 0.3, tp2_ratio: 0.7 },
        _ => Bucket { rr1: None, rr2: 4.0, tp1_ratio: 0.0, tp2_ratio: 1.0 },
    }
}

/// Low confidence trails wider and moves to break-even later.
pub fn trailing_config(confidence: i64) -> TrailingConfig {
    let (trail_percent, move_to_break_even_after_rr) = match confidence {
        c if c <= 45 => (1.0, 1.5),
        c if c <= 60 => (0.5, 1.25),
        c if c <= 75 => (0.3, 1.0),
        _ => (0.25, 1.0),
    };
    TrailingConfig { enabled: true, trail_percent, move_to_break_even_after_rr }
}

pub fn mode_for(input: &PlanInput, table: Option<&SymbolSlTp>) -> PlanMode {
    match table {
        Some(_) if input.atr > 0.0 => PlanMode::VolatilityScaled,
        _ => PlanMode::FixedBucket,
    }
}

/// Stop/targets/trailing for a candidate. `size` is left at 0 for the risk
/// manager to fill.
pub fn plan(input: &PlanInput, table: Option<&SymbolSlTp>) -> TradePlan {
    let s = input.direction.sign();
    let dec = input.price_decimals;
    let trailing = trailing_config(input.confidence);

    match (mode_for(input, table), table) {
        (PlanMode::VolatilityScaled, Some(symbol_table)) => {
            let params = symbol_table.bucket(input.normalized);
            let stop_distance = input.atr * params.sl_mult;
            TradePlan {
                direction: input.direction,
                entry: input.entry,
                stop_loss: round_to(input.entry - s * stop_distance, dec),
                take_profit_1: None,
                take_profit_2: round_to(input.entry + s * stop_distance * params.tp_rr, dec),
                tp1_ratio: 0.0,
                tp2_ratio: 1.0,
                trailing,
                size: 0.0,
            }
        }
        _ => {
            let mut b = fixed_bucket(input.confidence);
            if let Some(rr) = input.regime_rr.filter(|rr| *rr > 0.0) {
                b.rr2 = rr;
                // a first target at or past the final one is dropped
                if b.rr1.is_some_and(|rr1| rr1 >= rr) {
                    b = Bucket { rr1: None, rr2: rr, tp1_ratio: 0.0, tp2_ratio: 1.0 };
                }
            }
            let (stop, tp2) = calculate_sl_tp(input.entry, input.direction, b.rr2, DEFAULT_SL_PCT);
            let tp1 = b
                .rr1
                .map(|rr1| calculate_sl_tp(input.entry, input.direction, rr1, DEFAULT_SL_PCT).1);
            TradePlan {
                direction: input.direction,
                entry: input.entry,
                stop_loss: round_to(stop, dec),
                take_profit_1: tp1.map(|p| round_to(p, dec)),
                take_profit_2: round_to(tp2, dec),
                tp1_ratio: b.tp1_ratio,
                tp2_ratio: b.tp2_ratio,
                trailing,
                size: 0.0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn input(confidence: i64, direction: Direction) -> PlanInput {
        PlanInput {
            entry: 100.0,
            direction,
            confidence,
            normalized: confidence as f64 / 100.0,
            atr: 2.0,
            price_decimals: 2,
            regime_rr: None,
        }
    }

    #[test]
    fn fixed_percent_long_and_short_mirror() {
        let (stop, target) = calculate_sl_tp(100.0, Direction::Long, 2.0, 0.01);
        assert!((stop - 99.0).abs() < 1e-9);
        assert!((target - 102.0).abs() < 1e-9);
        let (stop, target) = calculate_sl_tp(100.0, Direction::Short, 2.0, 0.01);
        assert!((stop - 101.0).abs() < 1e-9);
        assert!((target - 98.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_buckets_choose_rr_and_split() {
        let low = plan(&input(40, Direction::Long), None);
        assert_eq!(low.take_profit_1, Some(101.2));
        assert_eq!(low.take_profit_2, 102.0);

        let mid = plan(&input(50, Direction::Long), None);
        assert_eq!(mid.take_profit_1, Some(101.5));
        assert_eq!(mid.take_profit_2, 102.5);

        let upper = plan(&input(70, Direction::Short), None);
        assert_eq!(upper.take_profit_1, Some(98.5));
        assert_eq!(upper.take_profit_2, 97.0);
        assert_eq!((upper.tp1_ratio, upper.tp2_ratio), (0.3, 0.7));

        let top = plan(&input(90, Direction::Long), None);
        assert_eq!(top.take_profit_1, None);
        assert_eq!(top.take_profit_2, 104.0);
        assert_eq!(top.tp2_ratio, 1.0);
        for p in [low, mid, upper, top] {
            assert!(p.is_consistent());
        }
    }

    #[test]
    fn regime_rr_replaces_the_bucket_target() {
        let mut calm = input(50, Direction::Long);
        calm.regime_rr = Some(3.0);
        let p = plan(&calm, None);
        assert_eq!(p.take_profit_1, Some(101.5));
        assert_eq!(p.take_profit_2, 103.0);

        let mut defensive = input(50, Direction::Short);
        defensive.regime_rr = Some(1.2);
        let p = plan(&defensive, None);
        assert_eq!(p.take_profit_1, None);
        assert_eq!(p.take_profit_2, 98.8);
        assert_eq!((p.tp1_ratio, p.tp2_ratio), (0.0, 1.0));
        assert!(p.is_consistent());

        // learned per-symbol RR is left alone
        let table = SymbolSlTp::default();
        assert_eq!(plan(&calm, Some(&table)).take_profit_2, 104.0);
    }

    #[test]
    fn volatility_mode_takes_priority_when_table_present() {
        let table = SymbolSlTp {
            mid_confidence: Some(BucketParams { sl_mult: 1.5, tp_rr: 3.0 }),
            ..Default::default()
        };
        let p = plan(&input(50, Direction::Long), Some(&table));
        assert_eq!(p.stop_loss, 97.0);
        assert_eq!(p.take_profit_2, 109.0);

        // missing bucket → multiplier 1.0, RR 2.0
        let p = plan(&input(80, Direction::Short), Some(&table));
        assert_eq!(p.stop_loss, 102.0);
        assert_eq!(p.take_profit_2, 96.0);
        assert!(p.is_consistent());
    }

    #[test]
    fn zero_atr_falls_back_to_fixed_buckets() {
        let mut i = input(50, Direction::Long);
        i.atr = 0.0;
        let table = SymbolSlTp::default();
        assert_eq!(mode_for(&i, Some(&table)), PlanMode::FixedBucket);
        assert_eq!(plan(&i, Some(&table)).stop_loss, 99.0);
    }

    #[test]
    fn trailing_tightens_with_confidence() {
        let lo = trailing_config(40);
        let hi = trailing_config(90);
        assert!(lo.trail_percent > hi.trail_percent);
        assert!(lo.move_to_break_even_after_rr > hi.move_to_break_even_after_rr);
    }

    #[test]
    fn table_file_accepts_sl_buffer_alias() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"BTCUSDT": {{"high_confidence": {{"sl_buffer": 0.8, "tp_rr": 2.5}}}}}}"#
        )
        .unwrap();
        let store = SlTpStore::new(SlTpTable::new());
        assert_eq!(store.reload_from(f.path()).unwrap(), 1);
        let table = store.snapshot();
        let btc = &table["BTCUSDT"];
        assert_eq!(btc.bucket(0.9), BucketParams { sl_mult: 0.8, tp_rr: 2.5 });
        assert_eq!(btc.bucket(0.1).tp_rr, DEFAULT_RR);
    }
}
