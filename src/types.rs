use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64, // ms, unique and ascending within a series
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Direction of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short. Multiplies a price delta into PnL.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    #[default]
    Flat,
    Long,
    Short,
}

impl PositionSide {
    pub fn side(self) -> Option<Side> {
        match self {
            PositionSide::Flat => None,
            PositionSide::Long => Some(Side::Long),
            PositionSide::Short => Some(Side::Short),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PositionSide::Flat => "flat",
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

impl From<Side> for PositionSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Long => PositionSide::Long,
            Side::Short => PositionSide::Short,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossKind {
    Golden,
    Death,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Uptrend,
    Downtrend,
}

impl Trend {
    pub fn from_flag(is_uptrend: bool) -> Self {
        if is_uptrend { Trend::Uptrend } else { Trend::Downtrend }
    }

    pub fn label(self) -> &'static str {
        match self {
            Trend::Uptrend => "Uptrend",
            Trend::Downtrend => "Downtrend",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossEvent {
    pub kind: CrossKind,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub trend: Trend,
}

/// Time-boxed entry intent awaiting execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingTrade {
    pub side: Side,
    pub qty: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Short,
    Cover,
}

impl TradeAction {
    pub fn open(side: Side) -> Self {
        match side {
            Side::Long => TradeAction::Buy,
            Side::Short => TradeAction::Short,
        }
    }

    pub fn close(side: Side) -> Self {
        match side {
            Side::Long => TradeAction::Sell,
            Side::Short => TradeAction::Cover,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Short => "SHORT",
            TradeAction::Cover => "COVER",
        }
    }
}

/// One line of the append-only trade log, written on every fill.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub action: TradeAction,
    pub qty: f64,
    pub price: f64,
    pub notional: f64,
}

impl TradeRecord {
    pub fn new(timestamp: DateTime<Utc>, action: TradeAction, qty: f64, price: f64) -> Self {
        TradeRecord { timestamp, action, qty, price, notional: qty * price }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub qty: f64,
}

/// Outcome of an order the venue accepted for processing.
#[derive(Clone, Debug, PartialEq)]
pub enum FillResult {
    Filled(Fill),
    Rejected { reason: String },
}

/// Exposure reported by the venue for the configured instrument.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VenuePosition {
    pub side: PositionSide,
    pub size: f64,
    pub avg_price: Option<f64>,
}

/// The durable triple (plus profit counter) written after every transition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DurableState {
    pub position_open: bool,
    pub side: PositionSide,
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub quantity: f64,
    pub total_profit: f64,
}

pub fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
