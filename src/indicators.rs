use crate::types::{Candle, Direction};

const VOL_AVG_PERIOD: usize = 29;
const FVG_LOOKBACK: usize = 12;
const FVG_MIN_GAP_PCT: f64 = 0.001;

/// Average true range over the last `period` candles. 0.0 when there is not
/// enough history.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period + 1 {
        return 0.0;
    }
    let start = candles.len() - period - 1;
    let tr_sum: f64 = ((start + 1)..candles.len())
        .map(|i| {
            let curr = &candles[i];
            let prev = &candles[i - 1];
            (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs())
        })
        .sum();
    tr_sum / period as f64
}

pub fn ema(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = closes[..period].iter().sum::<f64>() / period as f64;
    Some(closes[period..].iter().fold(seed, |acc, c| c * k + acc * (1.0 - k)))
}

/// Wilder RSI of the closes.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let mut gain = 0.0;
    let mut loss = 0.0;
    for w in closes[..=period].windows(2) {
        let d = w[1] - w[0];
        if d > 0.0 { gain += d } else { loss -= d }
    }
    gain /= period as f64;
    loss /= period as f64;
    for w in closes[period..].windows(2) {
        let d = w[1] - w[0];
        gain = (gain * (period as f64 - 1.0) + d.max(0.0)) / period as f64;
        loss = (loss * (period as f64 - 1.0) + (-d).max(0.0)) / period as f64;
    }
    if loss == 0.0 {
        return Some(100.0);
    }
    Some(100.0 - 100.0 / (1.0 + gain / loss))
}

/// Last candle's volume above `threshold` × mean of the preceding 29.
pub fn volume_spike(candles: &[Candle], threshold: f64) -> bool {
    let n = candles.len();
    if n < 2 {
        return false;
    }
    let prior = &candles[n.saturating_sub(VOL_AVG_PERIOD + 1)..n - 1];
    let avg = prior.iter().map(|c| c.volume).sum::<f64>() / prior.len() as f64;
    avg > 0.0 && candles[n - 1].volume > avg * threshold
}

/// 3-candle fair value gap in `direction` within the recent lookback.
///
/// Bullish: c3.low > c1.high with a green impulse candle c2.
/// Bearish: c1.low > c3.high with a red impulse candle c2.
pub fn has_fair_value_gap(candles: &[Candle], direction: Direction) -> bool {
    let n = candles.len();
    if n < 3 {
        return false;
    }
    let search_start = n.saturating_sub(FVG_LOOKBACK + 2);
    (search_start..n - 2).any(|j| {
        let (c1, c2, c3) = (&candles[j], &candles[j + 1], &candles[j + 2]);
        match direction {
            Direction::Long => {
                c3.low > c1.high
                    && c3.low - c1.high > c2.close * FVG_MIN_GAP_PCT
                    && c2.close > c2.open
            }
            Direction::Short => {
                c1.low > c3.high
                    && c1.low - c3.high > c2.close * FVG_MIN_GAP_PCT
                    && c2.close < c2.open
            }
            Direction::Neutral => false,
        }
    })
}

/// (max/min close − 1) × Σvolume, used to rank symbols.
pub fn activity_score(candles: &[Candle]) -> f64 {
    let (mut lo, mut hi) = (f64::MAX, f64::MIN);
    let mut vol = 0.0;
    for c in candles {
        lo = lo.min(c.close);
        hi = hi.max(c.close);
        vol += c.volume;
    }
    if candles.is_empty() || lo <= 0.0 {
        return 0.0;
    }
    (hi / lo - 1.0) * vol
}
