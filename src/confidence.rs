//! Weighted confidence scoring.
//!
//! The weight table is produced offline and hot-reloaded from disk. A reload
//! parses a complete new [`WeightTable`] and swaps the shared `Arc`; readers
//! always hold one whole table for the duration of a scoring pass.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::{
    ADMISSION_THRESHOLD, LIQ_LARGE_USDT, LIQ_NEARBY_WINDOW_SECS, VOLUME_SPIKE_MULT,
};
use crate::error::ConfigError;
use crate::indicators;
use crate::types::{Candle, Direction, Liquidation, StructureEvent, StructureEventKind, Trend};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Bos,
    Choch,
    Fvg,
    VolumeSpike,
    RsiExtreme,
    EmaFilter,
    LiqNearby,
    LiqLarge,
    HtfMatch4h,
    HtfMismatch4h,
    HtfMatch1d,
    HtfMismatch1d,
}

impl Feature {
    pub fn tag(self) -> &'static str {
        match self {
            Feature::Bos => "bos",
            Feature::Choch => "choch",
            Feature::Fvg => "fvg",
            Feature::VolumeSpike => "volume_spike",
            Feature::RsiExtreme => "rsi_extreme",
            Feature::EmaFilter => "ema_filter",
            Feature::LiqNearby => "liq_nearby",
            Feature::LiqLarge => "liq_large",
            Feature::HtfMatch4h => "htf_match_4h",
            Feature::HtfMismatch4h => "htf_mismatch_4h",
            Feature::HtfMatch1d => "htf_match_1d",
            Feature::HtfMismatch1d => "htf_mismatch_1d",
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Feature::Bos => "break of structure",
            Feature::Choch => "change of character",
            Feature::Fvg => "fair value gap",
            Feature::VolumeSpike => "volume spike",
            Feature::RsiExtreme => "RSI extreme",
            Feature::EmaFilter => "EMA50 aligned",
            Feature::LiqNearby => "recent liquidation",
            Feature::LiqLarge => "large liquidation",
            Feature::HtfMatch4h => "4H trend agrees",
            Feature::HtfMismatch4h => "4H trend disagrees",
            Feature::HtfMatch1d => "1D trend agrees",
            Feature::HtfMismatch1d => "1D trend disagrees",
        }
    }
}

const DEFAULT_WEIGHTS: &[(&str, i64)] = &[
    ("bos", 40),
    ("choch", 40),
    ("fvg", 20),
    ("rsi_extreme", 12),
    ("rsi_bounce", 10),
    ("ema_filter", 10),
    ("macd", 8),
    ("vwap", 15),
    ("volume_spike", 15),
    ("candle_confirm", 8),
    ("bounce_vwap", 8),
    ("obv_trend", 6),
    ("liq_nearby", 10),
    ("liq_large", 10),
    ("htf_match_4h", 10),
    ("htf_mismatch_4h", -3),
    ("htf_match_1d", 20),
    ("htf_mismatch_1d", -5),
];

/// Immutable tag → signed weight mapping with a version stamp.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightTable {
    pub version: u64,
    weights: BTreeMap<String, i64>,
}

/// On-disk formats: a flat map, or the optimizer's `{score, weights}` output.
#[derive(Deserialize)]
#[serde(untagged)]
enum WeightFile {
    Scored { weights: BTreeMap<String, f64> },
    Flat(BTreeMap<String, f64>),
}

impl WeightTable {
    pub fn new(version: u64, weights: BTreeMap<String, i64>) -> Self {
        WeightTable { version, weights }
    }

    pub fn defaults() -> Self {
        let weights = DEFAULT_WEIGHTS.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        WeightTable { version: 0, weights }
    }

    pub fn parse(raw: &str, version: u64) -> Result<Self, serde_json::Error> {
        let weights = match serde_json::from_str::<WeightFile>(raw)? {
            WeightFile::Scored { weights } | WeightFile::Flat(weights) => weights,
        };
        let weights = weights.into_iter().map(|(k, v)| (k, v.round() as i64)).collect();
        Ok(WeightTable { version, weights })
    }

    pub fn weight(&self, tag: &str) -> i64 {
        self.weights.get(tag).copied().unwrap_or(0)
    }

    pub fn abs_sum(&self) -> i64 {
        self.weights.values().map(|w| w.abs()).sum()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Shared holder for the current [`WeightTable`].
pub struct WeightStore {
    current: RwLock<Arc<WeightTable>>,
}

impl WeightStore {
    pub fn new(table: WeightTable) -> Self {
        WeightStore { current: RwLock::new(Arc::new(table)) }
    }

    /// Starts from the file when readable, else the built-in defaults.
    pub fn load_or_default(path: &Path) -> Self {
        let store = WeightStore::new(WeightTable::defaults());
        match store.reload_from(path) {
            Ok(v) => log::info!("Weight table v{} loaded from {}", v, path.display()),
            Err(e) => log::warn!("Using default weights: {}", e),
        }
        store
    }

    pub fn snapshot(&self) -> Arc<WeightTable> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn swap(&self, table: WeightTable) {
        let table = Arc::new(table);
        match self.current.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }

    /// Parses the file fully before swapping; a bad file leaves the current
    /// table in place. Returns the new version.
    pub fn reload_from(&self, path: &Path) -> Result<u64, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let version = self.snapshot().version + 1;
        let table = WeightTable::parse(&raw, version).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        self.swap(table);
        Ok(version)
    }
}

/// Inputs for feature detection beyond the entry timeframe.
#[derive(Default)]
pub struct FeatureInputs<'a> {
    pub htf_4h: Option<&'a [Candle]>,
    pub htf_1d: Option<&'a [Candle]>,
    pub liquidations: &'a [Liquidation],
}

/// Which tagged features are present for a candidate in `direction`.
pub fn detect_features(
    symbol: &str,
    candles: &[Candle],
    structure: &StructureEvent,
    direction: Direction,
    inputs: &FeatureInputs<'_>,
    now: DateTime<Utc>,
) -> Vec<Feature> {
    let mut present = Vec::new();
    match structure.event {
        StructureEventKind::Bos => present.push(Feature::Bos),
        StructureEventKind::Choch => present.push(Feature::Choch),
        StructureEventKind::None => {}
    }
    if indicators::has_fair_value_gap(candles, direction) {
        present.push(Feature::Fvg);
    }
    if indicators::volume_spike(candles, VOLUME_SPIKE_MULT) {
        present.push(Feature::VolumeSpike);
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    if let Some(r) = indicators::rsi(&closes, 14) {
        let extreme = match direction {
            Direction::Long => r < 30.0,
            Direction::Short => r > 70.0,
            Direction::Neutral => false,
        };
        if extreme {
            present.push(Feature::RsiExtreme);
        }
    }
    if let (Some(e), Some(last)) = (indicators::ema(&closes, 50), closes.last()) {
        if (last - e) * direction.sign() > 0.0 {
            present.push(Feature::EmaFilter);
        }
    }

    let recent = inputs.liquidations.iter().filter(|l| {
        l.symbol == symbol && (now - l.timestamp).num_seconds() < LIQ_NEARBY_WINDOW_SECS
    });
    if let Some(max_value) = recent.map(Liquidation::value_usdt).reduce(f64::max) {
        present.push(Feature::LiqNearby);
        if max_value > LIQ_LARGE_USDT {
            present.push(Feature::LiqLarge);
        }
    }

    let htf = [
        (inputs.htf_4h, Feature::HtfMatch4h, Feature::HtfMismatch4h),
        (inputs.htf_1d, Feature::HtfMatch1d, Feature::HtfMismatch1d),
    ];
    for (series, matched, mismatched) in htf {
        let Some(series) = series else { continue };
        let trend = crate::market_structure::analyze(series).trend;
        if trend == Trend::Consolidation {
            continue;
        }
        present.push(if trend.direction() == direction { matched } else { mismatched });
    }

    present
}

#[derive(Clone, Debug, PartialEq)]
pub struct Score {
    pub raw: i64,
    pub normalized: f64,
    pub reasons: Vec<String>,
    pub table_version: u64,
}

impl Score {
    pub fn admitted(&self) -> bool {
        self.raw >= ADMISSION_THRESHOLD
    }
}

/// raw = Σ weight[tag]; normalized = clamp(raw / Σ|weight|, 0, 1).
pub fn score(features: &[Feature], table: &WeightTable) -> Score {
    let mut raw = 0;
    let mut reasons = Vec::new();
    for f in features {
        let w = table.weight(f.tag());
        if w != 0 {
            reasons.push(format!("{} ({:+})", f.reason(), w));
        }
        raw += w;
    }
    Score {
        raw,
        normalized: normalize(raw, table),
        reasons,
        table_version: table.version,
    }
}

pub fn normalize(raw: i64, table: &WeightTable) -> f64 {
    let total = table.abs_sum();
    if total == 0 {
        return 0.0;
    }
    (raw as f64 / total as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn defaults_give_bos_exactly_the_threshold() {
        let table = WeightTable::defaults();
        let s = score(&[Feature::Bos], &table);
        assert_eq!(s.raw, 40);
        assert!(s.admitted());
        let s = score(&[Feature::VolumeSpike, Feature::HtfMismatch4h], &table);
        assert_eq!(s.raw, 12);
        assert!(!s.admitted());
    }

    #[test]
    fn parses_flat_and_scored_files() {
        let flat = WeightTable::parse(r#"{"bos": 35, "fvg": 10.4}"#, 3).unwrap();
        assert_eq!(flat.weight("bos"), 35);
        assert_eq!(flat.weight("fvg"), 10);
        assert_eq!(flat.version, 3);
        let scored = WeightTable::parse(r#"{"score": 0.61, "weights": {"bos": 50}}"#, 1).unwrap();
        assert_eq!(scored.weight("bos"), 50);
        assert_eq!(scored.len(), 1);
    }

    #[test]
    fn reload_swaps_whole_table_and_keeps_old_on_error() {
        let store = WeightStore::new(WeightTable::defaults());
        let before = store.snapshot();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"bos": 60}}"#).unwrap();
        assert_eq!(store.reload_from(file.path()).unwrap(), 1);

        let after = store.snapshot();
        assert_eq!(after.weight("bos"), 60);
        assert_eq!(after.weight("fvg"), 0);
        // readers holding the previous Arc still see the complete old table
        assert_eq!(before.weight("fvg"), 20);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "not json").unwrap();
        assert!(store.reload_from(bad.path()).is_err());
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn empty_table_normalizes_to_zero() {
        let table = WeightTable::new(0, BTreeMap::new());
        assert!(table.is_empty());
        assert_eq!(normalize(50, &table), 0.0);
    }

    #[test]
    fn liquidations_on_other_symbols_are_ignored() {
        let now = Utc::now();
        let liqs = vec![
            Liquidation { symbol: "ETHUSDT".into(), side: "Sell".into(), price: 3000.0, qty: 100.0, timestamp: now },
            Liquidation { symbol: "BTCUSDT".into(), side: "Sell".into(), price: 60000.0, qty: 1.0, timestamp: now },
        ];
        let inputs = FeatureInputs { liquidations: &liqs, ..Default::default() };
        let features = detect_features(
            "BTCUSDT", &[], &StructureEvent::neutral(), Direction::Long, &inputs, now,
        );
        assert!(features.contains(&Feature::LiqNearby));
        assert!(!features.contains(&Feature::LiqLarge));
    }

    proptest! {
        #[test]
        fn normalized_is_clamped_and_monotonic(
            weights in proptest::collection::btree_map("[a-z]{1,6}", -50i64..50, 1..12),
            a in -300i64..300,
            b in -300i64..300,
        ) {
            let table = WeightTable::new(0, weights);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let (nlo, nhi) = (normalize(lo, &table), normalize(hi, &table));
            prop_assert!((0.0..=1.0).contains(&nlo));
            prop_assert!((0.0..=1.0).contains(&nhi));
            prop_assert!(nlo <= nhi);
            let total = table.abs_sum();
            if total > 0 {
                let expected = (hi as f64 / total as f64).clamp(0.0, 1.0);
                prop_assert!((nhi - expected).abs() < 1e-12);
            }
        }
    }
}
