use async_trait::async_trait;

use crate::error::VenueError;
use crate::types::{Candle, FillResult, VenuePosition};

/// Market data and order execution for the single configured instrument.
///
/// Timeouts and retries belong to the implementation; callers treat each
/// call as one blocking step that either completes or fails.
#[async_trait]
pub trait Venue: Send + Sync {
    /// Candles in `[from_ms, to_ms]`, oldest first. May be empty on a hiccup.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>, VenueError>;

    /// Free quote balance available for new entries.
    async fn get_balance(&self) -> Result<f64, VenueError>;

    async fn get_position(&self) -> Result<VenuePosition, VenueError>;

    async fn open_long(&self, qty: f64) -> Result<FillResult, VenueError>;

    async fn open_short(&self, qty: f64) -> Result<FillResult, VenueError>;

    /// Flatten whatever the venue holds for the instrument.
    async fn close_position(&self) -> Result<FillResult, VenueError>;
}
