use chrono::{DateTime, Duration, Utc};

use crate::types::{CrossKind, PendingTrade, Side};

#[derive(Clone, Debug, PartialEq)]
pub enum PendingAction {
    Idle,
    Expired(PendingTrade),
    Cancelled(PendingTrade),
    /// Still live and the position is flat: try to fill it now.
    Execute(PendingTrade),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProposeError {
    AlreadyPending,
    PositionOpen,
}

/// Holds at most one entry intent between signal acceptance and fill.
#[derive(Debug)]
pub struct PendingWindow {
    window: Duration,
    pending: Option<PendingTrade>,
}

impl PendingWindow {
    pub fn new(window: Duration) -> Self {
        PendingWindow { window, pending: None }
    }

    pub fn current(&self) -> Option<&PendingTrade> {
        self.pending.as_ref()
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn propose(
        &mut self,
        side: Side,
        qty: f64,
        now: DateTime<Utc>,
        position_flat: bool,
    ) -> Result<&PendingTrade, ProposeError> {
        if self.pending.is_some() {
            return Err(ProposeError::AlreadyPending);
        }
        if !position_flat {
            return Err(ProposeError::PositionOpen);
        }
        Ok(&*self.pending.insert(PendingTrade {
            side,
            qty,
            created_at: now,
            expires_at: now + self.window,
        }))
    }

    /// Drop the intent if it has expired or `latest_cross` opposes it.
    /// Never returns `Execute`.
    pub fn sweep(&mut self, now: DateTime<Utc>, latest_cross: Option<CrossKind>) -> PendingAction {
        let Some(trade) = self.pending.as_ref() else {
            return PendingAction::Idle;
        };

        if now > trade.expires_at {
            return self.pending.take().map_or(PendingAction::Idle, PendingAction::Expired);
        }

        let opposing = matches!(
            (trade.side, latest_cross),
            (Side::Long, Some(CrossKind::Death)) | (Side::Short, Some(CrossKind::Golden))
        );
        if opposing {
            return self.pending.take().map_or(PendingAction::Idle, PendingAction::Cancelled);
        }
        PendingAction::Idle
    }

    /// Expire or cancel the intent, or hand it back for execution.
    /// An executed intent stays here until `fill` confirms it.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        latest_cross: Option<CrossKind>,
        position_flat: bool,
    ) -> PendingAction {
        match self.sweep(now, latest_cross) {
            PendingAction::Idle => {}
            dropped => return dropped,
        }
        match self.pending.as_ref() {
            Some(trade) if position_flat => PendingAction::Execute(trade.clone()),
            _ => PendingAction::Idle,
        }
    }

    /// The entry filled; the intent is consumed.
    pub fn fill(&mut self) -> Option<PendingTrade> {
        self.pending.take()
    }
}
