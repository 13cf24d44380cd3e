use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::indicators::IndicatorParams;

// ─── Bybit ────────────────────────────────────────────────────────────────────
pub const BYBIT_REST_URL: &str = "https://api-demo.bybit.com";
pub const BYBIT_PUBLIC_URL: &str = "https://api.bybit.com";
// BYBIT_API_KEY, BYBIT_SECRET, TELEGRAM_TOKEN, TELEGRAM_CHAT_ID
// are read from environment variables at runtime

// ─── Strategy defaults ────────────────────────────────────────────────────────
pub const DEFAULT_SYMBOL: &str = "LTCUSDT";
pub const DEFAULT_INTERVAL: &str = "1"; // 1-minute candles
pub const MA_SHORT: usize = 50;
pub const MA_LONG: usize = 200;
pub const TREND_LOOKBACK: usize = 5;
pub const RSI_PERIOD: usize = 14;
pub const RSI_OVERBOUGHT: f64 = 70.0;
pub const RSI_OVERSOLD: f64 = 30.0;
pub const FEE_BUFFER_PCT: f64 = 0.001;
pub const CHECK_INTERVAL_SECS: u64 = 30;
pub const ERROR_BACKOFF_SECS: u64 = 10;
pub const CANDLE_HISTORY_HOURS: i64 = 6;
pub const MIN_TRADE_QTY: f64 = 0.01;
pub const QTY_STEP: f64 = 0.01;
pub const TRADE_USDT: f64 = 10.0;
pub const PENDING_WINDOW_SECS: i64 = 120;
pub const MAX_CROSSES: usize = 4;
pub const RATCHET_RETENTION: f64 = 0.70; // keep 70 % of peak unrealized profit

/// How an accepted signal is turned into an order quantity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SizingPolicy {
    /// Always trade this many units.
    Fixed { qty: f64 },
    /// Spend roughly this much quote currency, floored to the qty step.
    Notional { quote: f64 },
}

/// Profit ratchet: arms once unrealized PnL exceeds `min_profit`, then closes
/// when unrealized PnL falls below `peak × retention`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatchetParams {
    pub min_profit: f64,
    pub retention: f64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub symbol: String,
    pub interval: String,
    pub ma_short: usize,
    pub ma_long: usize,
    pub trend_lookback: usize,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub fee_buffer_pct: f64,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub candle_history: chrono::Duration,
    pub min_trade_qty: f64,
    pub qty_step: f64,
    pub sizing: SizingPolicy,
    pub shorting_enabled: bool,
    pub early_exit_enabled: bool,
    pub rearm_early_exit_on_cross: bool,
    pub trailing_stop_pct: Option<f64>,
    pub ratchet: Option<RatchetParams>,
    pub pending_window: chrono::Duration,
    pub max_crosses: usize,
    pub saves_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            symbol: DEFAULT_SYMBOL.to_string(),
            interval: DEFAULT_INTERVAL.to_string(),
            ma_short: MA_SHORT,
            ma_long: MA_LONG,
            trend_lookback: TREND_LOOKBACK,
            rsi_period: RSI_PERIOD,
            rsi_overbought: RSI_OVERBOUGHT,
            rsi_oversold: RSI_OVERSOLD,
            fee_buffer_pct: FEE_BUFFER_PCT,
            poll_interval: Duration::from_secs(CHECK_INTERVAL_SECS),
            error_backoff: Duration::from_secs(ERROR_BACKOFF_SECS),
            candle_history: chrono::Duration::hours(CANDLE_HISTORY_HOURS),
            min_trade_qty: MIN_TRADE_QTY,
            qty_step: QTY_STEP,
            sizing: SizingPolicy::Notional { quote: TRADE_USDT },
            shorting_enabled: false,
            early_exit_enabled: false,
            rearm_early_exit_on_cross: false,
            trailing_stop_pct: None,
            ratchet: None,
            pending_window: chrono::Duration::seconds(PENDING_WINDOW_SECS),
            max_crosses: MAX_CROSSES,
            saves_dir: PathBuf::from("saves"),
        }
    }
}

impl Config {
    /// Build from environment variables; anything unset keeps its default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Config::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let sizing = match (get("TRADE_QTY"), get("TRADE_USDT")) {
            (Some(q), _) => SizingPolicy::Fixed { qty: parse_value("TRADE_QTY", &q)? },
            (None, Some(u)) => SizingPolicy::Notional { quote: parse_value("TRADE_USDT", &u)? },
            (None, None) => d.sizing,
        };

        let ratchet = match get("RATCHET_MIN_PROFIT") {
            Some(v) => Some(RatchetParams {
                min_profit: parse_value("RATCHET_MIN_PROFIT", &v)?,
                retention: opt_parse(&get, "RATCHET_RETENTION")?.unwrap_or(RATCHET_RETENTION),
            }),
            None => None,
        };

        let cfg = Config {
            symbol: get("SYMBOL").unwrap_or(d.symbol),
            interval: get("INTERVAL").unwrap_or(d.interval),
            ma_short: opt_parse(&get, "MA_SHORT")?.unwrap_or(d.ma_short),
            ma_long: opt_parse(&get, "MA_LONG")?.unwrap_or(d.ma_long),
            trend_lookback: opt_parse(&get, "TREND_LOOKBACK")?.unwrap_or(d.trend_lookback),
            rsi_period: opt_parse(&get, "RSI_PERIOD")?.unwrap_or(d.rsi_period),
            rsi_overbought: opt_parse(&get, "RSI_OVERBOUGHT")?.unwrap_or(d.rsi_overbought),
            rsi_oversold: opt_parse(&get, "RSI_OVERSOLD")?.unwrap_or(d.rsi_oversold),
            fee_buffer_pct: opt_parse(&get, "FEE_BUFFER_PCT")?.unwrap_or(d.fee_buffer_pct),
            poll_interval: opt_parse(&get, "CHECK_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.poll_interval),
            error_backoff: opt_parse(&get, "ERROR_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.error_backoff),
            candle_history: opt_parse(&get, "CANDLE_HISTORY_HOURS")?
                .map(chrono::Duration::hours)
                .unwrap_or(d.candle_history),
            min_trade_qty: opt_parse(&get, "MIN_TRADE_QTY")?.unwrap_or(d.min_trade_qty),
            qty_step: opt_parse(&get, "QTY_STEP")?.unwrap_or(d.qty_step),
            sizing,
            shorting_enabled: opt_flag(&get, "SHORTING_ENABLED")?.unwrap_or(d.shorting_enabled),
            early_exit_enabled: opt_flag(&get, "EARLY_EXIT_ENABLED")?
                .unwrap_or(d.early_exit_enabled),
            rearm_early_exit_on_cross: opt_flag(&get, "REARM_EARLY_EXIT_ON_CROSS")?
                .unwrap_or(d.rearm_early_exit_on_cross),
            trailing_stop_pct: opt_parse(&get, "TRAILING_STOP_PCT")?,
            ratchet,
            pending_window: opt_parse(&get, "PENDING_WINDOW_SECS")?
                .map(chrono::Duration::seconds)
                .unwrap_or(d.pending_window),
            max_crosses: opt_parse(&get, "MAX_CROSSES")?.unwrap_or(d.max_crosses),
            saves_dir: get("SAVES_DIR").map(PathBuf::from).unwrap_or(d.saves_dir),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.ma_short == 0 || self.ma_short >= self.ma_long {
            return invalid(format!(
                "MA periods must satisfy 0 < short < long (short={}, long={})",
                self.ma_short, self.ma_long
            ));
        }
        if self.trend_lookback == 0 || self.rsi_period == 0 {
            return invalid("TREND_LOOKBACK and RSI_PERIOD must be at least 1".into());
        }
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(self.rsi_oversold)
            || !in_range(self.rsi_overbought)
            || self.rsi_oversold >= self.rsi_overbought
        {
            return invalid(format!(
                "RSI thresholds must satisfy 0 <= oversold < overbought <= 100 ({} / {})",
                self.rsi_oversold, self.rsi_overbought
            ));
        }
        if self.qty_step <= 0.0 || self.min_trade_qty <= 0.0 {
            return invalid("QTY_STEP and MIN_TRADE_QTY must be positive".into());
        }
        match self.sizing {
            SizingPolicy::Fixed { qty } if qty < self.min_trade_qty => {
                return invalid(format!(
                    "TRADE_QTY {qty} below minimum tradeable size {}",
                    self.min_trade_qty
                ));
            }
            SizingPolicy::Notional { quote } if quote <= 0.0 => {
                return invalid("TRADE_USDT must be positive".into());
            }
            _ => {}
        }
        if let Some(pct) = self.trailing_stop_pct {
            if !(pct > 0.0 && pct < 1.0) {
                return invalid(format!("TRAILING_STOP_PCT {pct} must be in (0, 1)"));
            }
        }
        if let Some(r) = self.ratchet {
            if r.min_profit <= 0.0 || !(r.retention > 0.0 && r.retention <= 1.0) {
                return invalid(format!(
                    "ratchet needs min_profit > 0 and retention in (0, 1] ({} / {})",
                    r.min_profit, r.retention
                ));
            }
        }
        if self.max_crosses == 0 {
            return invalid("MAX_CROSSES must be at least 1".into());
        }
        if self.pending_window <= chrono::Duration::zero() {
            return invalid("PENDING_WINDOW_SECS must be positive".into());
        }
        let Some(minutes) = self.interval_minutes() else {
            return invalid(format!("INTERVAL {:?} is not a Bybit kline interval", self.interval));
        };
        let covered = self.candle_history.num_minutes() / minutes;
        if covered < self.required_candles() as i64 {
            return invalid(format!(
                "CANDLE_HISTORY_HOURS covers {} candles of {}m, indicators need {}",
                covered,
                minutes,
                self.required_candles()
            ));
        }
        Ok(())
    }

    /// Candles the indicator engine needs before it produces a snapshot.
    pub fn required_candles(&self) -> usize {
        IndicatorParams::from_config(self).required_candles()
    }

    /// Length of one candle in minutes ("1".."720", "D", "W", "M").
    pub fn interval_minutes(&self) -> Option<i64> {
        match self.interval.trim() {
            "D" => Some(24 * 60),
            "W" => Some(7 * 24 * 60),
            "M" => Some(30 * 24 * 60),
            n => n.parse::<i64>().ok().filter(|m| *m > 0),
        }
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Parse { key, value: raw.to_string() })
}

fn opt_parse<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&'static str) -> Option<String>,
{
    get(key).map(|v| parse_value(key, &v)).transpose()
}

fn opt_flag<G>(get: &G, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    get(key)
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Parse { key, value: v }),
        })
        .transpose()
}
