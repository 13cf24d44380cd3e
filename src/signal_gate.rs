use crate::config::Config;
use crate::indicators::IndicatorSnapshot;
use crate::types::{CrossEvent, CrossKind, PositionSide, Side};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    Buy,
    Short,
    Sell,
    Cover,
    SellEarly,
    CoverEarly,
    None,
}

impl Directive {
    pub fn label(self) -> &'static str {
        match self {
            Directive::Buy => "buy",
            Directive::Short => "short",
            Directive::Sell => "sell",
            Directive::Cover => "cover",
            Directive::SellEarly => "sell_early",
            Directive::CoverEarly => "cover_early",
            Directive::None => "none",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub directive: Directive,
    /// Set on an opposite-signal close when the cross would also pass the entry
    /// filters for the other side: close, then open `flip_into`.
    pub flip_into: Option<Side>,
    pub reason: Option<&'static str>,
}

impl Decision {
    fn act(directive: Directive) -> Self {
        Decision { directive, flip_into: None, reason: None }
    }

    fn suppressed(reason: &'static str) -> Self {
        Decision { directive: Directive::None, flip_into: None, reason: Some(reason) }
    }

    pub fn none() -> Self {
        Decision::act(Directive::None)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GateParams {
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub shorting_enabled: bool,
    pub early_exit_enabled: bool,
    pub rearm_early_exit_on_cross: bool,
}

impl GateParams {
    pub fn from_config(cfg: &Config) -> Self {
        GateParams {
            rsi_overbought: cfg.rsi_overbought,
            rsi_oversold: cfg.rsi_oversold,
            shorting_enabled: cfg.shorting_enabled,
            early_exit_enabled: cfg.early_exit_enabled,
            rearm_early_exit_on_cross: cfg.rearm_early_exit_on_cross,
        }
    }
}

/// Early exits fire at most once per arming. A failed early-exit close
/// disarms the latch until RSI leaves the extreme zone (or, optionally, a
/// same-direction cross re-arms it).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EarlyExitLatch {
    armed: bool,
}

impl Default for EarlyExitLatch {
    fn default() -> Self {
        EarlyExitLatch { armed: true }
    }
}

impl EarlyExitLatch {
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

pub struct SignalGate {
    params: GateParams,
}

impl SignalGate {
    pub fn new(params: GateParams) -> Self {
        SignalGate { params }
    }

    fn long_entry(&self, snap: &IndicatorSnapshot) -> Result<(), &'static str> {
        if !snap.is_uptrend {
            Err("not in uptrend")
        } else if snap.rsi >= self.params.rsi_overbought {
            Err("RSI too high")
        } else {
            Ok(())
        }
    }

    fn short_entry(&self, snap: &IndicatorSnapshot) -> Result<(), &'static str> {
        if !self.params.shorting_enabled {
            Err("shorts disabled")
        } else if snap.is_uptrend {
            Err("in uptrend")
        } else if snap.rsi <= self.params.rsi_oversold {
            Err("RSI too low")
        } else {
            Ok(())
        }
    }

    /// Map a cross (if any) plus the current exposure to a directive.
    pub fn decide(
        &self,
        cross: Option<&CrossEvent>,
        snap: &IndicatorSnapshot,
        position: PositionSide,
        latch: &mut EarlyExitLatch,
    ) -> Decision {
        if let Some(event) = cross {
            let decision = self.on_cross(event.kind, snap, position, latch);
            if decision.directive != Directive::None {
                return decision;
            }
            if position == PositionSide::Flat {
                return decision;
            }
        }
        self.early_exit(snap, position, latch)
    }

    fn on_cross(
        &self,
        kind: CrossKind,
        snap: &IndicatorSnapshot,
        position: PositionSide,
        latch: &mut EarlyExitLatch,
    ) -> Decision {
        match (kind, position) {
            (CrossKind::Golden, PositionSide::Flat) => match self.long_entry(snap) {
                Ok(()) => Decision::act(Directive::Buy),
                Err(reason) => Decision::suppressed(reason),
            },
            (CrossKind::Death, PositionSide::Flat) => match self.short_entry(snap) {
                Ok(()) => Decision::act(Directive::Short),
                Err(reason) => Decision::suppressed(reason),
            },
            (CrossKind::Death, PositionSide::Long) => Decision {
                directive: Directive::Sell,
                flip_into: self.short_entry(snap).ok().map(|_| Side::Short),
                reason: None,
            },
            (CrossKind::Golden, PositionSide::Short) => Decision {
                directive: Directive::Cover,
                flip_into: self.long_entry(snap).ok().map(|_| Side::Long),
                reason: None,
            },
            (CrossKind::Golden, PositionSide::Long) | (CrossKind::Death, PositionSide::Short) => {
                if self.params.rearm_early_exit_on_cross {
                    latch.arm();
                }
                Decision::suppressed("already positioned in cross direction")
            }
        }
    }

    fn early_exit(
        &self,
        snap: &IndicatorSnapshot,
        position: PositionSide,
        latch: &mut EarlyExitLatch,
    ) -> Decision {
        if !self.params.early_exit_enabled {
            return Decision::none();
        }
        let extreme = match position {
            PositionSide::Long => snap.rsi > self.params.rsi_overbought,
            PositionSide::Short => snap.rsi < self.params.rsi_oversold,
            PositionSide::Flat => return Decision::none(),
        };
        if !extreme {
            latch.arm();
            return Decision::none();
        }
        if !latch.is_armed() {
            return Decision::suppressed("early exit disarmed");
        }
        match position {
            PositionSide::Long => Decision::act(Directive::SellEarly),
            _ => Decision::act(Directive::CoverEarly),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trend;
    use chrono::Utc;

    fn gate(shorting: bool, early: bool) -> SignalGate {
        SignalGate::new(GateParams {
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            shorting_enabled: shorting,
            early_exit_enabled: early,
            rearm_early_exit_on_cross: false,
        })
    }

    fn snap(rsi: f64, up: bool) -> IndicatorSnapshot {
        IndicatorSnapshot { sma_short: 1.0, sma_long: 1.0, rsi, is_uptrend: up }
    }

    fn cross(kind: CrossKind) -> CrossEvent {
        CrossEvent { kind, time: Utc::now(), price: 100.0, trend: Trend::Uptrend }
    }

    fn decide(g: &SignalGate, kind: Option<CrossKind>, s: IndicatorSnapshot, pos: PositionSide) -> Decision {
        let event = kind.map(cross);
        g.decide(event.as_ref(), &s, pos, &mut EarlyExitLatch::default())
    }

    #[test]
    fn golden_in_uptrend_with_room_buys() {
        let d = decide(&gate(false, false), Some(CrossKind::Golden), snap(45.0, true), PositionSide::Flat);
        assert_eq!(d.directive, Directive::Buy);
    }

    #[test]
    fn golden_suppression_reasons() {
        let g = gate(false, false);
        let d = decide(&g, Some(CrossKind::Golden), snap(75.0, true), PositionSide::Flat);
        assert_eq!(d, Decision { directive: Directive::None, flip_into: None, reason: Some("RSI too high") });
        let d = decide(&g, Some(CrossKind::Golden), snap(45.0, false), PositionSide::Flat);
        assert_eq!(d.reason, Some("not in uptrend"));
    }

    #[test]
    fn death_suppression_reasons() {
        let d = decide(&gate(false, false), Some(CrossKind::Death), snap(50.0, false), PositionSide::Flat);
        assert_eq!(d.reason, Some("shorts disabled"));
        let g = gate(true, false);
        assert_eq!(decide(&g, Some(CrossKind::Death), snap(50.0, true), PositionSide::Flat).reason, Some("in uptrend"));
        assert_eq!(decide(&g, Some(CrossKind::Death), snap(25.0, false), PositionSide::Flat).reason, Some("RSI too low"));
        assert_eq!(decide(&g, Some(CrossKind::Death), snap(50.0, false), PositionSide::Flat).directive, Directive::Short);
    }

    #[test]
    fn opposite_cross_closes_and_flips_when_allowed() {
        let d = decide(&gate(false, false), Some(CrossKind::Death), snap(50.0, false), PositionSide::Long);
        assert_eq!(d.directive, Directive::Sell);
        assert_eq!(d.flip_into, None);

        let d = decide(&gate(true, false), Some(CrossKind::Death), snap(50.0, false), PositionSide::Long);
        assert_eq!(d.flip_into, Some(Side::Short));

        let d = decide(&gate(true, false), Some(CrossKind::Golden), snap(50.0, true), PositionSide::Short);
        assert_eq!(d.directive, Directive::Cover);
        assert_eq!(d.flip_into, Some(Side::Long));

        // cover still happens even when the long filters reject the flip
        let d = decide(&gate(true, false), Some(CrossKind::Golden), snap(80.0, true), PositionSide::Short);
        assert_eq!(d.directive, Directive::Cover);
        assert_eq!(d.flip_into, None);
    }

    #[test]
    fn early_exit_on_rsi_extremes() {
        let g = gate(true, true);
        assert_eq!(decide(&g, None, snap(75.0, true), PositionSide::Long).directive, Directive::SellEarly);
        assert_eq!(decide(&g, None, snap(25.0, false), PositionSide::Short).directive, Directive::CoverEarly);
        assert_eq!(decide(&g, None, snap(50.0, true), PositionSide::Long).directive, Directive::None);
        assert_eq!(decide(&g, None, snap(75.0, true), PositionSide::Flat).directive, Directive::None);
        // disabled: no early exits at all
        assert_eq!(decide(&gate(true, false), None, snap(75.0, true), PositionSide::Long).directive, Directive::None);
    }

    #[test]
    fn same_direction_cross_falls_through_to_early_exit() {
        let g = gate(false, true);
        let d = decide(&g, Some(CrossKind::Golden), snap(75.0, true), PositionSide::Long);
        assert_eq!(d.directive, Directive::SellEarly);
    }

    #[test]
    fn disarmed_latch_waits_for_rsi_to_normalise() {
        let g = gate(false, true);
        let mut latch = EarlyExitLatch::default();
        latch.disarm();
        let d = g.decide(None, &snap(75.0, true), PositionSide::Long, &mut latch);
        assert_eq!(d.reason, Some("early exit disarmed"));
        g.decide(None, &snap(60.0, true), PositionSide::Long, &mut latch);
        assert!(latch.is_armed());
        let d = g.decide(None, &snap(75.0, true), PositionSide::Long, &mut latch);
        assert_eq!(d.directive, Directive::SellEarly);
    }

    #[test]
    fn same_direction_cross_rearms_when_configured() {
        let g = SignalGate::new(GateParams {
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            shorting_enabled: false,
            early_exit_enabled: true,
            rearm_early_exit_on_cross: true,
        });
        let mut latch = EarlyExitLatch::default();
        latch.disarm();
        let d = g.decide(Some(&cross(CrossKind::Golden)), &snap(75.0, true), PositionSide::Long, &mut latch);
        assert_eq!(d.directive, Directive::SellEarly);

        let mut latch = EarlyExitLatch::default();
        latch.disarm();
        let d = gate(false, true).decide(Some(&cross(CrossKind::Golden)), &snap(75.0, true), PositionSide::Long, &mut latch);
        assert_eq!(d.directive, Directive::None);
    }
}
