use std::collections::VecDeque;

use crate::indicators::Reading;
use crate::types::{ms_to_utc, CrossEvent, CrossKind};

/// Bounded FIFO of recent crosses, oldest first.
#[derive(Clone, Debug, Default)]
pub struct CrossHistory {
    events: VecDeque<CrossEvent>,
    capacity: usize,
}

impl CrossHistory {
    pub fn new(capacity: usize) -> Self {
        CrossHistory { events: VecDeque::with_capacity(capacity), capacity }
    }

    /// Reload a persisted log, keeping only the newest `capacity` entries.
    pub fn from_events(capacity: usize, events: Vec<CrossEvent>) -> Self {
        let mut history = CrossHistory::new(capacity);
        for e in events {
            history.push(e);
        }
        history
    }

    pub fn push(&mut self, event: CrossEvent) {
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CrossEvent> {
        self.events.iter()
    }

    /// Newest first, the order the dashboard shows them in.
    pub fn newest_first(&self) -> Vec<CrossEvent> {
        self.events.iter().rev().cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<CrossEvent> {
        self.events.iter().cloned().collect()
    }
}

/// Result of feeding one reading to the detector.
#[derive(Clone, Debug, PartialEq)]
pub enum Detection {
    /// Candle timestamp already processed; nothing evaluated.
    Repeat,
    /// New candle, no cross.
    NoCross,
    Cross(CrossEvent),
}

impl Detection {
    pub fn is_new_candle(&self) -> bool {
        !matches!(self, Detection::Repeat)
    }

    pub fn cross(&self) -> Option<&CrossEvent> {
        match self {
            Detection::Cross(e) => Some(e),
            _ => None,
        }
    }
}

/// Golden is checked first, so a degenerate reading satisfying both resolves to golden.
pub fn classify(reading: &Reading) -> Option<CrossKind> {
    let cur_short = reading.current.sma_short;
    let cur_long = reading.current.sma_long;
    let prev_short = reading.prev_sma_short;
    let prev_long = reading.prev_sma_long;

    if cur_short > cur_long && prev_short <= prev_long {
        Some(CrossKind::Golden)
    } else if cur_short < cur_long && prev_short >= prev_long {
        Some(CrossKind::Death)
    } else {
        None
    }
}

/// Raises at most one cross per candle timestamp.
#[derive(Debug)]
pub struct CrossDetector {
    last_processed: Option<i64>,
    history: CrossHistory,
}

impl CrossDetector {
    pub fn new(history: CrossHistory) -> Self {
        CrossDetector { last_processed: None, history }
    }

    #[cfg(test)]
    pub fn last_processed(&self) -> Option<i64> {
        self.last_processed
    }

    pub fn history(&self) -> &CrossHistory {
        &self.history
    }

    pub fn observe(&mut self, reading: &Reading) -> Detection {
        // Candle timestamps are monotonic, so anything at or before the cursor is a replay.
        if self.last_processed.is_some_and(|ts| reading.timestamp <= ts) {
            return Detection::Repeat;
        }
        self.last_processed = Some(reading.timestamp);

        match classify(reading) {
            Some(kind) => {
                let event = CrossEvent {
                    kind,
                    time: ms_to_utc(reading.timestamp),
                    price: reading.price,
                    trend: reading.current.trend(),
                };
                self.history.push(event.clone());
                Detection::Cross(event)
            }
            None => Detection::NoCross,
        }
    }
}
