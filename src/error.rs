use thiserror::Error;

#[derive(Debug, Error)]
pub enum VenueError {
    /// Rate limited (retCode=10006 or HTTP 429). retry_after in seconds.
    #[error("rate limited (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },
    /// Network, timeout, HTTP 5xx, server overload.
    #[error("transient error: {0}")]
    Transient(String),
    /// Invalid params, insufficient balance, HTTP 4xx.
    #[error("permanent error: {0}")]
    Permanent(String),
    /// Credentials rejected or account unusable. The loop must not keep trading.
    #[error("fatal venue error: {0}")]
    Fatal(String),
}

impl VenueError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, VenueError::Fatal(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("missing required variable {0}")]
    Missing(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupted journal file {path}: {source}")]
    Corrupted {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The candle window is too short for the configured indicators.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("need {required} candles, have {available}")]
pub struct NotReady {
    pub required: usize,
    pub available: usize,
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    Venue(#[from] VenueError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    /// Startup could not see a full candle window yet.
    #[error("not ready: {0}")]
    NotReady(#[from] NotReady),
}

impl TickError {
    pub fn is_fatal(&self) -> bool {
        match self {
            TickError::Fatal(_) => true,
            TickError::Venue(e) => e.is_fatal(),
            TickError::Journal(_) | TickError::NotReady(_) => false,
        }
    }
}

/// Why a position transition did not happen. Prior state is always intact.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Venue(#[from] VenueError),
    #[error("no open position to close")]
    NotOpen,
    #[error("position already open")]
    NotFlat,
}

impl ExecutionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Venue(e) if e.is_fatal())
    }
}
