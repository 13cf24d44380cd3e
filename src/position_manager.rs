use chrono::{DateTime, Utc};

use crate::config::SizingPolicy;
use crate::error::ExecutionError;
use crate::exchange::Venue;
use crate::types::{
    DurableState, Fill, FillResult, PositionSide, Side, TradeAction, TradeRecord, VenuePosition,
};

/// Order quantity for an entry at `price`, floored to the exchange's lot step.
/// None when the result is below the minimum tradeable size.
pub fn calculate_position_size(
    policy: SizingPolicy,
    price: f64,
    qty_step: f64,
    min_qty: f64,
) -> Option<f64> {
    let raw_qty = match policy {
        SizingPolicy::Fixed { qty } => qty,
        SizingPolicy::Notional { quote } if price > 0.0 => quote / price,
        SizingPolicy::Notional { .. } => return None,
    };
    // Round DOWN to the lot step (e.g. 0.01 LTC); the epsilon absorbs float noise like 4.999999
    let steps = (raw_qty / qty_step + 1e-9).floor();
    let qty = steps * qty_step;
    if qty + 1e-12 >= min_qty {
        Some(qty)
    } else {
        None
    }
}

/// Pre-trade sufficiency: free balance must cover notional plus the fee buffer.
pub fn validate_entry(
    qty: f64,
    price: f64,
    balance: f64,
    fee_buffer_pct: f64,
    min_qty: f64,
) -> Result<(), String> {
    if qty < min_qty {
        return Err(format!("qty {:.6} below minimum {:.6}", qty, min_qty));
    }
    let needed = qty * price * (1.0 + fee_buffer_pct);
    if balance < needed {
        return Err(format!(
            "insufficient balance {:.2} (need {:.2} for qty={:.6} @ {:.2})",
            balance, needed, qty, price
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    /// Best price since entry: max for longs, min for shorts.
    pub peak_favorable: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.side != PositionSide::Flat
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        match self.side.side() {
            Some(side) => (price - self.entry_price) * self.quantity * side.sign(),
            None => 0.0,
        }
    }
}

/// Result of a close: the fill record and realized PnL.
#[derive(Clone, Debug, PartialEq)]
pub struct Closed {
    pub record: TradeRecord,
    pub pnl: f64,
}

/// Local view of a venue position. A missing or zero average price falls
/// back to `last_price`.
fn seeded(venue_pos: &VenuePosition, last_price: f64) -> Position {
    let entry = venue_pos.avg_price.filter(|p| *p > 0.0).unwrap_or(last_price);
    Position {
        side: venue_pos.side,
        entry_price: entry,
        quantity: venue_pos.size,
        peak_favorable: entry,
    }
}

/// Sole owner of the instrument's exposure. Every mutation goes through a
/// transition method; a failed execution leaves the previous state untouched.
#[derive(Debug, Default)]
pub struct PositionManager {
    position: Position,
    total_profit: f64,
}

impl PositionManager {
    pub fn new() -> Self {
        PositionManager::default()
    }

    /// Rebuild from the durable triple written before a restart.
    pub fn restore(state: &DurableState) -> Self {
        let position = match (state.position_open, state.side, state.entry_price) {
            (true, side @ (PositionSide::Long | PositionSide::Short), Some(entry)) => Position {
                side,
                entry_price: entry,
                quantity: state.quantity,
                peak_favorable: entry,
            },
            _ => Position::default(),
        };
        PositionManager { position, total_profit: state.total_profit }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn side(&self) -> PositionSide {
        self.position.side
    }

    pub fn is_flat(&self) -> bool {
        !self.position.is_open()
    }

    pub fn total_profit(&self) -> f64 {
        self.total_profit
    }

    pub fn durable_state(&self) -> DurableState {
        let open = self.position.is_open();
        DurableState {
            position_open: open,
            side: self.position.side,
            entry_price: open.then_some(self.position.entry_price),
            quantity: if open { self.position.quantity } else { 0.0 },
            total_profit: self.total_profit,
        }
    }

    /// Align local state with what the venue actually holds. Returns true if
    /// anything changed.
    pub fn reconcile(&mut self, venue_pos: &VenuePosition, last_price: f64) -> bool {
        let venue_open = venue_pos.side != PositionSide::Flat && venue_pos.size > 0.0;
        match (self.position.is_open(), venue_open) {
            (false, true) => {
                self.position = seeded(venue_pos, last_price);
                log::warn!(
                    "Recovered open position: {} {:.6} @ {:.2}",
                    venue_pos.side.label(),
                    venue_pos.size,
                    self.position.entry_price
                );
                true
            }
            (true, false) => {
                log::warn!("Local position exists but venue is flat. Resetting.");
                self.position = Position::default();
                true
            }
            (true, true) if venue_pos.side != self.position.side => {
                log::warn!(
                    "Side mismatch: local={} venue={}. Using venue.",
                    self.position.side.label(),
                    venue_pos.side.label()
                );
                self.position = seeded(venue_pos, last_price);
                true
            }
            (true, true) if (self.position.quantity - venue_pos.size).abs() > 1e-9 => {
                log::warn!(
                    "Size mismatch: local={:.6}, venue={:.6}. Using venue.",
                    self.position.quantity,
                    venue_pos.size
                );
                self.position.quantity = venue_pos.size;
                true
            }
            _ => false,
        }
    }

    /// Track the most favorable price since entry.
    pub fn mark(&mut self, price: f64) {
        match self.position.side {
            PositionSide::Long => {
                self.position.peak_favorable = self.position.peak_favorable.max(price)
            }
            PositionSide::Short => {
                self.position.peak_favorable = self.position.peak_favorable.min(price)
            }
            PositionSide::Flat => {}
        }
    }

    fn apply_open(&mut self, side: Side, fill: Fill, now: DateTime<Utc>) -> TradeRecord {
        self.position = Position {
            side: side.into(),
            entry_price: fill.price,
            quantity: fill.qty,
            peak_favorable: fill.price,
        };
        TradeRecord::new(now, TradeAction::open(side), fill.qty, fill.price)
    }

    fn apply_close(&mut self, side: Side, fill: Fill, now: DateTime<Utc>) -> Closed {
        let qty = if fill.qty > 0.0 { fill.qty } else { self.position.quantity };
        let pnl = (fill.price - self.position.entry_price) * qty * side.sign();
        self.total_profit += pnl;
        self.position = Position::default();
        Closed { record: TradeRecord::new(now, TradeAction::close(side), qty, fill.price), pnl }
    }

    /// FLAT → LONG / SHORT.
    pub async fn enter<V: Venue + ?Sized>(
        &mut self,
        venue: &V,
        side: Side,
        qty: f64,
        now: DateTime<Utc>,
    ) -> Result<TradeRecord, ExecutionError> {
        if !self.is_flat() {
            return Err(ExecutionError::NotFlat);
        }
        let result = match side {
            Side::Long => venue.open_long(qty).await?,
            Side::Short => venue.open_short(qty).await?,
        };
        match result {
            FillResult::Filled(fill) => {
                let record = self.apply_open(side, fill, now);
                log::info!(
                    "{}: {:.6} @ {:.2}",
                    TradeAction::open(side).label(),
                    fill.qty,
                    fill.price
                );
                Ok(record)
            }
            FillResult::Rejected { reason } => Err(ExecutionError::Rejected(reason)),
        }
    }

    /// LONG / SHORT → FLAT. Realized PnL accumulates into the running total.
    pub async fn exit<V: Venue + ?Sized>(
        &mut self,
        venue: &V,
        now: DateTime<Utc>,
    ) -> Result<Closed, ExecutionError> {
        let Some(side) = self.position.side.side() else {
            return Err(ExecutionError::NotOpen);
        };
        match venue.close_position().await? {
            FillResult::Filled(fill) => {
                let closed = self.apply_close(side, fill, now);
                log::info!(
                    "{}: {:.6} @ {:.2} | Profit: {:+.2} | Total: {:+.2}",
                    closed.record.action.label(),
                    closed.record.qty,
                    closed.record.price,
                    closed.pnl,
                    self.total_profit
                );
                Ok(closed)
            }
            FillResult::Rejected { reason } => Err(ExecutionError::Rejected(reason)),
        }
    }
}
