//! Indicator engine: SMA pair, RSI and trend from a candle window.
//!
//! Everything here is a pure function of the candle slice so a recorded
//! history replays to the same readings.

use crate::config::Config;
use crate::error::NotReady;
use crate::types::{Candle, Trend};

#[derive(Clone, Copy, Debug)]
pub struct IndicatorParams {
    pub ma_short: usize,
    pub ma_long: usize,
    pub trend_lookback: usize,
    pub rsi_period: usize,
}

impl IndicatorParams {
    pub fn from_config(cfg: &Config) -> Self {
        IndicatorParams {
            ma_short: cfg.ma_short,
            ma_long: cfg.ma_long,
            trend_lookback: cfg.trend_lookback,
            rsi_period: cfg.rsi_period,
        }
    }

    /// Minimum window: the long SMA `trend_lookback` candles ago, or RSI deltas.
    pub fn required_candles(&self) -> usize {
        (self.ma_long + self.trend_lookback).max(self.rsi_period + 1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndicatorSnapshot {
    pub sma_short: f64,
    pub sma_long: f64,
    pub rsi: f64,
    pub is_uptrend: bool,
}

impl IndicatorSnapshot {
    pub fn trend(&self) -> Trend {
        Trend::from_flag(self.is_uptrend)
    }
}

/// Latest snapshot plus the SMA pair one candle earlier, enough to classify a cross.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub timestamp: i64,
    pub price: f64,
    pub current: IndicatorSnapshot,
    pub prev_sma_short: f64,
    pub prev_sma_long: f64,
}

/// Mean close of the `window` candles ending at `end` (exclusive).
fn sma_ending(closes: &[f64], end: usize, window: usize) -> f64 {
    closes[end - window..end].iter().sum::<f64>() / window as f64
}

/// Simple moving average of the trailing `window` closes. None until `window` candles exist.
pub fn sma(candles: &[Candle], window: usize) -> Option<f64> {
    if window == 0 || candles.len() < window {
        return None;
    }
    let closes: Vec<f64> = candles[candles.len() - window..].iter().map(|c| c.close).collect();
    Some(sma_ending(&closes, window, window))
}

/// Average gain / average loss over the trailing `period` close-to-close deltas.
///
/// avg_loss == 0 saturates to 100.0 (a flat window included) instead of
/// dividing by zero.
pub fn rsi(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let window = &candles[candles.len() - period - 1..];
    let (gain, loss) = window.windows(2).fold((0.0, 0.0), |(g, l), pair| {
        let delta = pair[1].close - pair[0].close;
        (g + delta.max(0.0), l + (-delta).max(0.0))
    });
    let avg_gain = gain / period as f64;
    let avg_loss = loss / period as f64;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
}

/// Long SMA now vs. `lookback` candles ago.
pub fn is_uptrend(candles: &[Candle], ma_long: usize, lookback: usize) -> Option<bool> {
    let n = candles.len();
    if n < ma_long + lookback {
        return None;
    }
    let now = sma(candles, ma_long)?;
    let then = sma(&candles[..n - lookback], ma_long)?;
    Some(now > then)
}

/// Refuses to produce anything short of the configured window.
pub fn evaluate(candles: &[Candle], params: &IndicatorParams) -> Result<Reading, NotReady> {
    let required = params.required_candles();
    let n = candles.len();
    let not_ready = NotReady { required, available: n };
    if n < required {
        return Err(not_ready);
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let last = &candles[n - 1];

    let current = IndicatorSnapshot {
        sma_short: sma_ending(&closes, n, params.ma_short),
        sma_long: sma_ending(&closes, n, params.ma_long),
        rsi: rsi(candles, params.rsi_period).ok_or(not_ready.clone())?,
        is_uptrend: is_uptrend(candles, params.ma_long, params.trend_lookback)
            .ok_or(not_ready)?,
    };

    Ok(Reading {
        timestamp: last.timestamp,
        price: last.close,
        current,
        prev_sma_short: sma_ending(&closes, n - 1, params.ma_short),
        prev_sma_long: sma_ending(&closes, n - 1, params.ma_long),
    })
}

#[cfg(test)]
pub(crate) fn make_candles(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Candle {
            timestamp: 1_700_000_000_000 + i as i64 * 60_000,
            open: c,
            high: c,
            low: c,
            close: c,
            volume: 1.0,
        })
        .collect()
}
