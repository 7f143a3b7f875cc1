//! Trend / structure-break classification from an OHLCV snapshot.

use crate::types::{Candle, StructureEvent, StructureEventKind, Trend};

/// Strict local extrema: a swing high is higher than both neighbours, a swing
/// low lower than both. The first and last candles are never swings.
pub fn swing_points(candles: &[Candle]) -> (Vec<f64>, Vec<f64>) {
    let mut highs = Vec::new();
    let mut lows = Vec::new();
    for w in candles.windows(3) {
        let (prev, cur, next) = (&w[0], &w[1], &w[2]);
        if cur.high > prev.high && cur.high > next.high {
            highs.push(cur.high);
        }
        if cur.low < prev.low && cur.low < next.low {
            lows.push(cur.low);
        }
    }
    (highs, lows)
}

/// BOS (higher swing high) is checked before CHoCH (lower swing low).
/// Returns the neutral default when either swing series has fewer than two
/// points.
pub fn analyze(candles: &[Candle]) -> StructureEvent {
    if candles.len() < 2 {
        return StructureEvent::neutral();
    }
    let (swing_highs, swing_lows) = swing_points(candles);
    if swing_highs.len() < 2 || swing_lows.len() < 2 {
        return StructureEvent::neutral();
    }

    let last_high = swing_highs[swing_highs.len() - 1];
    let prev_high = swing_highs[swing_highs.len() - 2];
    let last_low = swing_lows[swing_lows.len() - 1];
    let prev_low = swing_lows[swing_lows.len() - 2];

    let (trend, event) = if last_high > prev_high {
        (Trend::Bullish, StructureEventKind::Bos)
    } else if last_low < prev_low {
        (Trend::Bearish, StructureEventKind::Choch)
    } else {
        (Trend::Consolidation, StructureEventKind::None)
    };

    StructureEvent { trend, event, swing_highs, swing_lows }
}
