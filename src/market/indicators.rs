// =============================================================================
// Indicator Engine — pure functions over OHLCV series
// =============================================================================
//
// No I/O, no side effects. Every function returns `Option<T>` and yields
// `None` on insufficient data, so callers never have to guard lengths
// themselves and a short history can never panic the strategy path.
//
// Inputs are chronological (oldest first) unless stated otherwise.
// =============================================================================

use serde::Serialize;

use crate::market::hub::DailyCandle;

/// Bollinger band triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// MACD line with optional signal/histogram (None when the signal line has
/// insufficient data).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: Option<f64>,
    pub histogram: Option<f64>,
}

/// Every indicator the hub pre-computes for a stock.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndicatorSet {
    pub sma_5: Option<f64>,
    pub sma_10: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_150: Option<f64>,
    pub sma_200: Option<f64>,
    pub ema_5: Option<f64>,
    pub ema_10: Option<f64>,
    pub ema_20: Option<f64>,
    pub ema_50: Option<f64>,
    pub rsi_14: Option<f64>,
    pub vwap: Option<f64>,
    pub bollinger: Option<Bollinger>,
    pub atr_14: Option<f64>,
    pub macd: Option<Macd>,
    pub volume_ratio_20: Option<f64>,
    pub current_close: Option<f64>,
    pub current_volume: Option<i64>,
    pub data_points: usize,
    /// MA200 today minus MA200 twenty trading days ago; positive = rising.
    pub ma200_slope: Option<f64>,
}

// -----------------------------------------------------------------------------
// Moving averages
// -----------------------------------------------------------------------------

/// Simple moving average over the last `period` prices.
pub fn sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let sum: f64 = prices[prices.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// Exponential moving average, seeded with the SMA of the first `period`
/// values, multiplier 2 / (period + 1).
pub fn ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut value: f64 = prices[..period].iter().sum::<f64>() / period as f64;
    for &price in &prices[period..] {
        value = (price - value) * multiplier + value;
    }
    Some(value)
}

/// Full EMA series, same length as the input, NaN-padded for the first
/// `period - 1` entries. Empty when there is insufficient data.
pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut result = vec![f64::NAN; period - 1];
    let mut value: f64 = prices[..period].iter().sum::<f64>() / period as f64;
    result.push(value);
    for &price in &prices[period..] {
        value = (price - value) * multiplier + value;
        result.push(value);
    }
    result
}

// -----------------------------------------------------------------------------
// RSI
// -----------------------------------------------------------------------------

/// Relative Strength Index with Wilder smoothing.
///
/// The seed averages are simple means of the first `period` gains/losses;
/// each later delta folds in as `(avg * (period - 1) + value) / period`.
/// Requires `period + 1` prices.
pub fn rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    let (mut avg_gain, mut avg_loss) = deltas[..period]
        .iter()
        .fold((0.0, 0.0), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

// -----------------------------------------------------------------------------
// VWAP
// -----------------------------------------------------------------------------

/// Volume-weighted average price over the whole series.
///
/// Typical price = (high + low + close) / 3. All slices must be the same
/// length; zero cumulative volume yields `None`.
pub fn vwap(closes: &[f64], volumes: &[i64], highs: &[f64], lows: &[f64]) -> Option<f64> {
    let n = closes.len();
    if n == 0 || volumes.len() != n || highs.len() != n || lows.len() != n {
        return None;
    }

    let mut cumul_tp_vol = 0.0;
    let mut cumul_vol: i64 = 0;
    for i in 0..n {
        let tp = (highs[i] + lows[i] + closes[i]) / 3.0;
        cumul_tp_vol += tp * volumes[i] as f64;
        cumul_vol += volumes[i];
    }

    if cumul_vol <= 0 {
        return None;
    }
    Some(cumul_tp_vol / cumul_vol as f64)
}

// -----------------------------------------------------------------------------
// Bollinger bands
// -----------------------------------------------------------------------------

/// SMA +- `num_std` population standard deviations over `period`.
pub fn bollinger_bands(prices: &[f64], period: usize, num_std: f64) -> Option<Bollinger> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    let middle: f64 = window.iter().sum::<f64>() / period as f64;
    let variance: f64 =
        window.iter().map(|p| (p - middle) * (p - middle)).sum::<f64>() / period as f64;
    let std = variance.sqrt();
    Some(Bollinger {
        upper: middle + num_std * std,
        middle,
        lower: middle - num_std * std,
    })
}

// -----------------------------------------------------------------------------
// ATR
// -----------------------------------------------------------------------------

/// Average True Range with Wilder smoothing over true ranges.
///
/// TR = max(H-L, |H - prev_close|, |L - prev_close|). Requires `period + 1`
/// bars (one previous close).
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let n = highs.len();
    if period == 0 || n < period + 1 || lows.len() != n || closes.len() != n {
        return None;
    }

    let mut true_ranges = Vec::with_capacity(n - 1);
    for i in 1..n {
        let tr = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
        true_ranges.push(tr);
    }

    let mut value: f64 = true_ranges[..period].iter().sum::<f64>() / period as f64;
    for &tr in &true_ranges[period..] {
        value = (value * (period as f64 - 1.0) + tr) / period as f64;
    }
    Some(value)
}

// -----------------------------------------------------------------------------
// MACD
// -----------------------------------------------------------------------------

/// MACD (fast/slow/signal). The MACD line requires `slow` prices; the signal
/// line additionally needs `signal` MACD points, otherwise signal and
/// histogram are `None`.
pub fn macd(prices: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if prices.len() < slow {
        return None;
    }

    let fast_series = ema_series(prices, fast);
    let slow_series = ema_series(prices, slow);

    let macd_line: Vec<f64> = fast_series
        .iter()
        .zip(slow_series.iter())
        .filter(|(f, s)| !f.is_nan() && !s.is_nan())
        .map(|(f, s)| f - s)
        .collect();

    let current = *macd_line.last()?;

    let (signal_value, histogram) = if macd_line.len() >= signal {
        let series = ema_series(&macd_line, signal);
        match series.last() {
            Some(&s) if !s.is_nan() => (Some(s), Some(current - s)),
            _ => (None, None),
        }
    } else {
        (None, None)
    };

    Some(Macd {
        macd: current,
        signal: signal_value,
        histogram,
    })
}

// -----------------------------------------------------------------------------
// Volume ratio
// -----------------------------------------------------------------------------

/// Latest volume divided by the average of the preceding `period` volumes.
pub fn volume_ratio(volumes: &[i64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period + 1 {
        return None;
    }
    let prev = &volumes[volumes.len() - period - 1..volumes.len() - 1];
    let avg: f64 = prev.iter().sum::<i64>() as f64 / period as f64;
    if avg == 0.0 {
        return None;
    }
    Some(*volumes.last().unwrap() as f64 / avg)
}

// -----------------------------------------------------------------------------
// Batch computation
// -----------------------------------------------------------------------------

/// Compute every supported indicator from chronological daily candles.
/// Indicators that cannot be computed are left as `None`.
pub fn calculate_all(daily: &[DailyCandle]) -> IndicatorSet {
    if daily.is_empty() {
        return IndicatorSet::default();
    }

    let closes: Vec<f64> = daily.iter().map(|d| d.close).collect();
    let highs: Vec<f64> = daily.iter().map(|d| d.high).collect();
    let lows: Vec<f64> = daily.iter().map(|d| d.low).collect();
    let volumes: Vec<i64> = daily.iter().map(|d| d.volume).collect();
    let n = closes.len();

    let ma200_slope = if n >= 220 {
        let now = sma(&closes, 200);
        let ago = sma(&closes[..n - 20], 200);
        match (now, ago) {
            (Some(a), Some(b)) => Some(a - b),
            _ => None,
        }
    } else {
        None
    };

    IndicatorSet {
        sma_5: sma(&closes, 5),
        sma_10: sma(&closes, 10),
        sma_20: sma(&closes, 20),
        sma_50: sma(&closes, 50),
        sma_150: sma(&closes, 150),
        sma_200: sma(&closes, 200),
        ema_5: ema(&closes, 5),
        ema_10: ema(&closes, 10),
        ema_20: ema(&closes, 20),
        ema_50: ema(&closes, 50),
        rsi_14: rsi(&closes, 14),
        vwap: vwap(&closes, &volumes, &highs, &lows),
        bollinger: bollinger_bands(&closes, 20, 2.0),
        atr_14: atr(&highs, &lows, &closes, 14),
        macd: macd(&closes, 12, 26, 9),
        volume_ratio_20: volume_ratio(&volumes, 20),
        current_close: closes.last().copied(),
        current_volume: volumes.last().copied(),
        data_points: n,
        ma200_slope,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles(closes: &[f64]) -> Vec<DailyCandle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| DailyCandle {
                date: format!("202601{:02}", (i % 28) + 1),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1000,
            })
            .collect()
    }

    // ---- sma / ema -------------------------------------------------------

    #[test]
    fn sma_last_window() {
        let prices = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&prices, 3), Some(4.0));
        assert_eq!(sma(&prices, 5), Some(3.0));
        assert!(sma(&prices, 6).is_none());
        assert!(sma(&prices, 0).is_none());
    }

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        let prices = vec![50.0; 40];
        let value = ema(&prices, 20).unwrap();
        assert!((value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn ema_tracks_recent_prices_harder_than_sma() {
        let mut prices = vec![100.0; 30];
        prices.extend([110.0, 120.0, 130.0]);
        let e = ema(&prices, 10).unwrap();
        let s = sma(&prices, 10).unwrap();
        assert!(e > s - 10.0);
        assert!(e <= 130.0);
    }

    #[test]
    fn ema_series_is_nan_padded() {
        let prices = vec![1.0, 2.0, 3.0, 4.0];
        let series = ema_series(&prices, 3);
        assert_eq!(series.len(), 4);
        assert!(series[0].is_nan());
        assert!(series[1].is_nan());
        assert!((series[2] - 2.0).abs() < 1e-9); // seed SMA of 1,2,3
        assert!(!series[3].is_nan());
    }

    // ---- rsi -------------------------------------------------------------

    #[test]
    fn rsi_all_gains_is_100() {
        let prices: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!((rsi(&prices, 14).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let prices: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        assert!(rsi(&prices, 14).unwrap().abs() < 1e-9);
    }

    #[test]
    fn rsi_requires_period_plus_one() {
        let prices: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(rsi(&prices, 14).is_none());
    }

    #[test]
    fn rsi_stays_in_range() {
        let prices = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let value = rsi(&prices, 14).unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    // ---- vwap ------------------------------------------------------------

    #[test]
    fn vwap_single_bar_is_typical_price() {
        let v = vwap(&[30.0], &[100], &[33.0], &[27.0]).unwrap();
        assert!((v - 30.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_weights_by_volume() {
        // Bar 1: TP 10 with volume 100; bar 2: TP 20 with volume 300.
        let v = vwap(&[10.0, 20.0], &[100, 300], &[10.0, 20.0], &[10.0, 20.0]).unwrap();
        assert!((v - 17.5).abs() < 1e-9);
    }

    #[test]
    fn vwap_rejects_mismatched_or_empty() {
        assert!(vwap(&[], &[], &[], &[]).is_none());
        assert!(vwap(&[1.0, 2.0], &[10], &[1.0, 2.0], &[1.0, 2.0]).is_none());
        assert!(vwap(&[1.0], &[0], &[1.0], &[1.0]).is_none());
    }

    // ---- bollinger -------------------------------------------------------

    #[test]
    fn bollinger_flat_series_collapses() {
        let prices = vec![100.0; 25];
        let bb = bollinger_bands(&prices, 20, 2.0).unwrap();
        assert!((bb.upper - 100.0).abs() < 1e-9);
        assert!((bb.middle - 100.0).abs() < 1e-9);
        assert!((bb.lower - 100.0).abs() < 1e-9);
    }

    #[test]
    fn bollinger_bands_are_symmetric() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + (i % 5) as f64).collect();
        let bb = bollinger_bands(&prices, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(((bb.upper - bb.middle) - (bb.middle - bb.lower)).abs() < 1e-9);
    }

    // ---- atr -------------------------------------------------------------

    #[test]
    fn atr_constant_range() {
        // Every bar: high-low = 2, no gaps => every TR is 2.
        let highs = vec![11.0; 20];
        let lows = vec![9.0; 20];
        let closes = vec![10.0; 20];
        let value = atr(&highs, &lows, &closes, 14).unwrap();
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_requires_prev_close() {
        let xs = vec![10.0; 14];
        assert!(atr(&xs, &xs, &xs, 14).is_none());
    }

    // ---- macd ------------------------------------------------------------

    #[test]
    fn macd_flat_series_is_zero() {
        let prices = vec![100.0; 60];
        let m = macd(&prices, 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-9);
        assert!(m.signal.unwrap().abs() < 1e-9);
        assert!(m.histogram.unwrap().abs() < 1e-9);
    }

    #[test]
    fn macd_signal_none_when_short() {
        // 26 points: MACD line exists (1 point) but signal needs 9.
        let prices: Vec<f64> = (1..=26).map(|x| x as f64).collect();
        let m = macd(&prices, 12, 26, 9).unwrap();
        assert!(m.signal.is_none());
        assert!(m.histogram.is_none());
    }

    #[test]
    fn macd_none_below_slow_period() {
        let prices = vec![1.0; 25];
        assert!(macd(&prices, 12, 26, 9).is_none());
    }

    // ---- volume ratio ----------------------------------------------------

    #[test]
    fn volume_ratio_doubles_on_spike() {
        let mut volumes = vec![100i64; 20];
        volumes.push(200);
        assert!((volume_ratio(&volumes, 20).unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn volume_ratio_none_on_zero_average() {
        let mut volumes = vec![0i64; 20];
        volumes.push(100);
        assert!(volume_ratio(&volumes, 20).is_none());
    }

    // ---- calculate_all ---------------------------------------------------

    #[test]
    fn calculate_all_short_history_fills_none() {
        let set = calculate_all(&candles(&[1.0, 2.0, 3.0]));
        assert!(set.sma_5.is_none());
        assert!(set.rsi_14.is_none());
        assert!(set.macd.is_none());
        assert!(set.ma200_slope.is_none());
        assert_eq!(set.data_points, 3);
        assert_eq!(set.current_close, Some(3.0));
    }

    #[test]
    fn calculate_all_long_history_has_slope() {
        let closes: Vec<f64> = (0..230).map(|i| 100.0 + i as f64 * 0.1).collect();
        let set = calculate_all(&candles(&closes));
        assert!(set.sma_200.is_some());
        // Rising series => positive slope of the 200-day average.
        assert!(set.ma200_slope.unwrap() > 0.0);
        assert!(set.rsi_14.is_some());
        assert!(set.bollinger.is_some());
        assert!(set.atr_14.is_some());
        assert!(set.macd.unwrap().signal.is_some());
        assert!(set.volume_ratio_20.is_some());
    }

    #[test]
    fn calculate_all_empty_is_default() {
        let set = calculate_all(&[]);
        assert_eq!(set.data_points, 0);
        assert!(set.current_close.is_none());
    }

    #[test]
    fn calculate_all_is_deterministic_for_same_input() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + ((i * 7) % 13) as f64).collect();
        let input = candles(&closes);
        let a = calculate_all(&input);
        let b = calculate_all(&input);
        assert_eq!(a.sma_20, b.sma_20);
        assert_eq!(a.rsi_14, b.rsi_14);
        assert_eq!(a.vwap, b.vwap);
    }
}
