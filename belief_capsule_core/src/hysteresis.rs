use serde::{Deserialize, Serialize};

use crate::track::Tick;

/// Per-track reclassification ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HysteresisState {
    /// Reclassification emissions are closed until this tick.
    pub cooldown_until: Tick,
    /// Emissions since the budget last refilled.
    pub spent: u32,
    /// Last tick the computed level differed from the one before it.
    pub last_flip: Tick,
}

/// Gate deciding whether a computed risk change may be emitted.
///
/// Two brakes: a cooldown after every emission, and a budget of `budget`
/// emissions that refills only once the computed level has held still for
/// `settle` ticks. Input that keeps flipping never settles, so a track
/// emits at most `budget` reclassifications for as long as it oscillates.
#[derive(Clone, Copy, Debug)]
pub struct HysteresisGate {
    cooldown: u64,
    budget: u32,
    settle: u64,
}

impl HysteresisGate {
    pub fn new(cooldown: u64, budget: u32, settle: u64) -> Self {
        Self {
            cooldown,
            budget,
            settle: settle.max(1),
        }
    }

    /// Note that the computed level changed at `tick`.
    pub fn record_flip(&self, state: &mut HysteresisState, tick: Tick) {
        state.last_flip = state.last_flip.max(tick);
    }

    /// Whether the computed level has been steady for a full settle period.
    pub fn is_settled(&self, state: &HysteresisState, tick: Tick) -> bool {
        tick.saturating_sub(state.last_flip) >= self.settle
    }

    /// Whether an emission at `tick` would pass, without recording it.
    pub fn is_open(&self, state: &HysteresisState, tick: Tick) -> bool {
        if self.budget == 0 || tick < state.cooldown_until {
            return false;
        }
        state.spent < self.budget || self.is_settled(state, tick)
    }

    /// Record an emission if the gate is open. Returns whether it was.
    pub fn try_pass(&self, state: &mut HysteresisState, tick: Tick) -> bool {
        if !self.is_open(state, tick) {
            return false;
        }
        if self.is_settled(state, tick) {
            state.spent = 0;
        }
        state.spent = state.spent.saturating_add(1);
        state.cooldown_until = tick.saturating_add(self.cooldown);
        true
    }
}
