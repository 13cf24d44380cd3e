use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::JournalError;
use crate::types::{CrossEvent, DurableState, TradeRecord};

const STATE_FILE: &str = "state.json";
const TRADES_FILE: &str = "trades.jsonl";
const CROSSES_FILE: &str = "crosses.json";
const STATUS_FILE: &str = "status.json";

/// Durable sinks for crash recovery and the trade history.
pub trait Journal: Send {
    fn load_state(&self) -> Result<Option<DurableState>, JournalError>;
    fn save_state(&mut self, state: &DurableState) -> Result<(), JournalError>;
    /// Append-only: records are never rewritten or removed.
    fn append_trade(&mut self, record: &TradeRecord) -> Result<(), JournalError>;
    fn load_crosses(&self) -> Result<Vec<CrossEvent>, JournalError>;
    fn save_crosses(&mut self, crosses: &[CrossEvent]) -> Result<(), JournalError>;
}

/// Trade log line as written to disk, rounded like the dashboard expects.
#[derive(Serialize)]
struct TradeLine<'a> {
    timestamp: String,
    action: &'a str,
    qty: f64,
    price: f64,
    notional: f64,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// JSON files under a saves directory.
pub struct JsonJournal {
    dir: PathBuf,
}

impl JsonJournal {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| JournalError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(JsonJournal { dir })
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, JournalError> {
        let path = self.dir.join(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(JournalError::Io { path: path.display().to_string(), source })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| JournalError::Corrupted { path: path.display().to_string(), source })
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), JournalError> {
        write_json_atomic(&self.dir.join(name), value)
    }
}

/// Write to a temp file and rename so readers never see a half-written file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), JournalError> {
    let io_err = |source| JournalError::Io { path: path.display().to_string(), source };
    let body = serde_json::to_string_pretty(value)
        .map_err(|source| JournalError::Corrupted { path: path.display().to_string(), source })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

impl Journal for JsonJournal {
    fn load_state(&self) -> Result<Option<DurableState>, JournalError> {
        self.read_json(STATE_FILE)
    }

    fn save_state(&mut self, state: &DurableState) -> Result<(), JournalError> {
        self.write_json(STATE_FILE, state)
    }

    fn append_trade(&mut self, record: &TradeRecord) -> Result<(), JournalError> {
        let path = self.dir.join(TRADES_FILE);
        let io_err = |source| JournalError::Io { path: path.display().to_string(), source };
        let line = TradeLine {
            timestamp: record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            action: record.action.label(),
            qty: round_to(record.qty, 6),
            price: round_to(record.price, 2),
            notional: round_to(record.notional, 2),
        };
        let mut json = serde_json::to_string(&line)
            .map_err(|source| JournalError::Corrupted { path: path.display().to_string(), source })?;
        json.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)
    }

    fn load_crosses(&self) -> Result<Vec<CrossEvent>, JournalError> {
        Ok(self.read_json(CROSSES_FILE)?.unwrap_or_default())
    }

    fn save_crosses(&mut self, crosses: &[CrossEvent]) -> Result<(), JournalError> {
        self.write_json(CROSSES_FILE, crosses)
    }
}
