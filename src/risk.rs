//! Exit protection that runs independently of crosses.
//!
//! Both policies can only force a close. Neither opens nor resizes.

use crate::config::{Config, RatchetParams};
use crate::types::Side;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StopTrigger {
    TrailingStop { peak: f64, level: f64 },
    ProfitRatchet { peak_unrealized: f64, floor: f64, unrealized: f64 },
}

impl StopTrigger {
    pub fn reason(&self) -> &'static str {
        match self {
            StopTrigger::TrailingStop { .. } => "trailing stop hit",
            StopTrigger::ProfitRatchet { .. } => "profit ratchet hit",
        }
    }
}

/// Exit level for a trailing stop given the best price seen since entry.
pub fn trailing_level(side: Side, peak: f64, trail_pct: f64) -> f64 {
    match side {
        Side::Long => peak * (1.0 - trail_pct),
        Side::Short => peak * (1.0 + trail_pct),
    }
}

/// One-way latch on unrealized PnL: inactive → active → triggered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfitRatchet {
    params: RatchetParams,
    active: bool,
    peak_unrealized: f64,
}

impl ProfitRatchet {
    pub fn new(params: RatchetParams) -> Self {
        ProfitRatchet { params, active: false, peak_unrealized: 0.0 }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn peak_unrealized(&self) -> f64 {
        self.peak_unrealized
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.peak_unrealized = 0.0;
    }

    /// Feed the latest unrealized PnL; returns a trigger when profit gives back
    /// more than `1 - retention` of its peak.
    pub fn update(&mut self, unrealized: f64) -> Option<StopTrigger> {
        if !self.active {
            if unrealized > self.params.min_profit {
                self.active = true;
                self.peak_unrealized = unrealized;
                log::info!(
                    "Profit ratchet armed at {:+.4} (retain {:.0}%)",
                    unrealized,
                    self.params.retention * 100.0
                );
            }
            return None;
        }

        self.peak_unrealized = self.peak_unrealized.max(unrealized);
        let floor = self.peak_unrealized * self.params.retention;
        if unrealized < floor {
            Some(StopTrigger::ProfitRatchet {
                peak_unrealized: self.peak_unrealized,
                floor,
                unrealized,
            })
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct RiskManager {
    trail_pct: Option<f64>,
    ratchet: Option<ProfitRatchet>,
}

impl RiskManager {
    pub fn new(trail_pct: Option<f64>, ratchet: Option<RatchetParams>) -> Self {
        RiskManager { trail_pct, ratchet: ratchet.map(ProfitRatchet::new) }
    }

    pub fn from_config(cfg: &Config) -> Self {
        RiskManager::new(cfg.trailing_stop_pct, cfg.ratchet)
    }

    pub fn ratchet(&self) -> Option<&ProfitRatchet> {
        self.ratchet.as_ref()
    }

    /// Clears per-position state. Called on every entry and every close.
    pub fn reset(&mut self) {
        if let Some(r) = self.ratchet.as_mut() {
            r.reset();
        }
    }

    /// `peak` is the most favorable price since entry (max for longs, min for shorts).
    pub fn evaluate(
        &mut self,
        side: Side,
        peak: f64,
        price: f64,
        unrealized: f64,
    ) -> Option<StopTrigger> {
        let ratchet_hit = self.ratchet.as_mut().and_then(|r| r.update(unrealized));

        if let Some(pct) = self.trail_pct {
            let level = trailing_level(side, peak, pct);
            let hit = match side {
                Side::Long => price <= level,
                Side::Short => price >= level,
            };
            if hit {
                return Some(StopTrigger::TrailingStop { peak, level });
            }
        }
        ratchet_hit
    }
}
