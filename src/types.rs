use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// +1 for long, -1 for short, 0 for neutral.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    /// Bybit order side.
    pub fn side(self) -> &'static str {
        match self {
            Direction::Short => "Sell",
            _ => "Buy",
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Neutral => Direction::Neutral,
        }
    }

    pub fn from_side(side: &str) -> Direction {
        match side.to_ascii_lowercase().as_str() {
            "buy" | "long" => Direction::Long,
            "sell" | "short" => Direction::Short,
            _ => Direction::Neutral,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Neutral => "neutral",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Consolidation,
}

impl Trend {
    pub fn direction(self) -> Direction {
        match self {
            Trend::Bullish => Direction::Long,
            Trend::Bearish => Direction::Short,
            Trend::Consolidation => Direction::Neutral,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureEventKind {
    #[serde(rename = "BOS")]
    Bos,
    #[serde(rename = "CHoCH")]
    Choch,
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructureEvent {
    pub trend: Trend,
    pub event: StructureEventKind,
    pub swing_highs: Vec<f64>,
    pub swing_lows: Vec<f64>,
}

impl StructureEvent {
    pub fn neutral() -> Self {
        StructureEvent {
            trend: Trend::Consolidation,
            event: StructureEventKind::None,
            swing_highs: Vec::new(),
            swing_lows: Vec::new(),
        }
    }
}

/// An admitted entry decision. Consumed once by the planner/sizer.
#[derive(Clone, Debug, Serialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    /// Raw 0–100 scale.
    pub confidence: i64,
    /// Normalised 0–1, sizing only.
    pub normalized: f64,
    pub reasons: Vec<String>,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrailingConfig {
    pub enabled: bool,
    /// Percent, e.g. 0.5 means 0.5 %.
    pub trail_percent: f64,
    pub move_to_break_even_after_rr: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TradePlan {
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit_1: Option<f64>,
    pub take_profit_2: f64,
    pub tp1_ratio: f64,
    pub tp2_ratio: f64,
    pub trailing: TrailingConfig,
    /// 0 means no trade.
    pub size: f64,
}

impl TradePlan {
    /// Stop and targets strictly on the correct side of entry.
    pub fn is_consistent(&self) -> bool {
        let s = self.direction.sign();
        if s == 0.0 {
            return false;
        }
        let tp1_ok = self
            .take_profit_1
            .map_or(true, |tp1| (tp1 - self.entry) * s > 0.0);
        (self.entry - self.stop_loss) * s > 0.0
            && (self.take_profit_2 - self.entry) * s > 0.0
            && tp1_ok
            && self.size >= 0.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpenPosition {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub initial_stop: f64,
    pub current_stop: f64,
    pub moved_to_break_even: bool,
    pub size: f64,
    pub confidence: i64,
    pub opened_at: DateTime<Utc>,
}

/// Row returned by the exchange for an open position.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    /// 0 when the exchange has no stop attached.
    pub stop_loss: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Balance {
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Liquidation {
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub timestamp: DateTime<Utc>,
}

impl Liquidation {
    pub fn value_usdt(&self) -> f64 {
        self.price * self.qty
    }
}

/// Price/qty precision of a linear contract.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InstrumentSpec {
    pub tick_size: f64,
    pub qty_step: f64,
}

impl InstrumentSpec {
    pub fn price_decimals(&self) -> u32 {
        decimals_of(self.tick_size)
    }
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        InstrumentSpec { tick_size: 0.01, qty_step: 0.001 }
    }
}

/// Number of decimals needed to represent `step` (0.001 → 3).
pub fn decimals_of(step: f64) -> u32 {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    let mut d = 0;
    let mut v = step;
    while d < 10 && (v - v.round()).abs() > 1e-9 {
        v *= 10.0;
        d += 1;
    }
    d
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    (value * f).round() / f
}

#[derive(Clone, Debug)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub take_profit_1: Option<f64>,
    pub tp1_ratio: f64,
    pub price_decimals: u32,
    pub qty_decimals: u32,
}

impl OrderRequest {
    pub fn from_plan(symbol: &str, plan: &TradePlan, spec: &InstrumentSpec) -> Self {
        OrderRequest {
            symbol: symbol.to_string(),
            direction: plan.direction,
            size: plan.size,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit_2,
            take_profit_1: plan.take_profit_1,
            tp1_ratio: plan.tp1_ratio,
            price_decimals: spec.price_decimals(),
            qty_decimals: decimals_of(spec.qty_step),
        }
    }

    /// (price, qty) of the two reduce-only exits when the plan splits its
    /// target; `None` when a single target rides on the entry.
    pub fn partial_legs(&self) -> Option<[(f64, f64); 2]> {
        let tp1 = self.take_profit_1?;
        if self.tp1_ratio <= 0.0 || self.tp1_ratio >= 1.0 {
            return None;
        }
        let tp1_qty = round_to(self.size * self.tp1_ratio, self.qty_decimals);
        let tp2_qty = round_to(self.size - tp1_qty, self.qty_decimals);
        Some([(tp1, tp1_qty), (self.take_profit, tp2_qty)])
    }
}
