use serde::{Deserialize, Serialize};

use crate::codec::Fnv1a;
use crate::error::{CapsuleError, CapsuleResult};
use crate::evidence::Observation;
use crate::risk::RiskLevel;
use crate::track::{Tick, Track, TrackId, TrackPhase};

/// Why a track left the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    UncertaintyExpired,
    CapacityPressure,
}

impl EvictionReason {
    pub fn code(self) -> u8 {
        match self {
            EvictionReason::UncertaintyExpired => 0,
            EvictionReason::CapacityPressure => 1,
        }
    }
}

/// One discrete change event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    NewThreat {
        tick: Tick,
        track_id: TrackId,
        track: Box<Track>,
    },
    Reclassified {
        tick: Tick,
        track_id: TrackId,
        from: RiskLevel,
        to: RiskLevel,
    },
    Evicted {
        tick: Tick,
        track_id: TrackId,
        reason: EvictionReason,
        track: Box<Track>,
    },
    /// A new external id was bound to an existing track.
    Reassociated {
        tick: Tick,
        track_id: TrackId,
        previous_entity: String,
        entity: String,
    },
}

impl Delta {
    pub fn tick(&self) -> Tick {
        match self {
            Delta::NewThreat { tick, .. }
            | Delta::Reclassified { tick, .. }
            | Delta::Evicted { tick, .. }
            | Delta::Reassociated { tick, .. } => *tick,
        }
    }

    pub fn track_id(&self) -> TrackId {
        match self {
            Delta::NewThreat { track_id, .. }
            | Delta::Reclassified { track_id, .. }
            | Delta::Evicted { track_id, .. }
            | Delta::Reassociated { track_id, .. } => *track_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Delta::NewThreat { .. } => "new_threat",
            Delta::Reclassified { .. } => "reclassified",
            Delta::Evicted { .. } => "evicted",
            Delta::Reassociated { .. } => "reassociated",
        }
    }

    pub fn is_new_threat(&self) -> bool {
        matches!(self, Delta::NewThreat { .. })
    }

    pub fn is_reclassified(&self) -> bool {
        matches!(self, Delta::Reclassified { .. })
    }

    pub fn is_evicted(&self) -> bool {
        matches!(self, Delta::Evicted { .. })
    }

    /// Structural producer obligations, checked by the envelope packager
    /// independently of how the delta was produced.
    pub fn validate(&self) -> CapsuleResult<()> {
        let fail = |why: String| {
            Err(CapsuleError::ProducerObligation(format!(
                "{} for {} at tick {}: {why}",
                self.kind(),
                self.track_id(),
                self.tick()
            )))
        };
        match self {
            Delta::NewThreat { tick, track_id, track } => {
                if track.track_id != *track_id {
                    return fail(format!("payload carries {}", track.track_id));
                }
                if track.created_tick != *tick {
                    return fail(format!("payload created at tick {}", track.created_tick));
                }
                if track.phase != TrackPhase::Active {
                    return fail(format!("payload phase {:?}", track.phase));
                }
                check_payload(track).or_else(fail)
            }
            Delta::Evicted { tick, track_id, track, .. } => {
                if track.track_id != *track_id {
                    return fail(format!("payload carries {}", track.track_id));
                }
                if track.created_tick > *tick {
                    return fail(format!("payload created at future tick {}", track.created_tick));
                }
                if track.phase != TrackPhase::Evicted {
                    return fail(format!("payload phase {:?}", track.phase));
                }
                check_payload(track).or_else(fail)
            }
            Delta::Reclassified { from, to, .. } => {
                if from == to {
                    return fail(format!("no-op change {from} -> {to}"));
                }
                Ok(())
            }
            Delta::Reassociated {
                previous_entity,
                entity,
                ..
            } => {
                if previous_entity == entity || entity.is_empty() {
                    return fail(format!("entity `{previous_entity}` -> `{entity}`"));
                }
                Ok(())
            }
        }
    }
}

fn check_payload(track: &Track) -> Result<(), String> {
    if !(0.0..=1.0).contains(&track.p_unknown) {
        return Err(format!("p_unknown {} outside [0, 1]", track.p_unknown));
    }
    if track.entity_id.is_empty() {
        return Err("empty entity_id".into());
    }
    Ok(())
}

/// Watches delta volume across runs of identical input.
///
/// Each batch is fingerprinted over its observations (no tick, no
/// features). While consecutive fingerprints match, ingest deltas are
/// tallied against `sparsity_budget`.
#[derive(Clone, Debug, Default)]
pub struct SparsityMonitor {
    budget: u32,
    last_fingerprint: Option<u64>,
    steady_deltas: u64,
    warned: bool,
    violations: u64,
}

impl SparsityMonitor {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    pub fn fingerprint(observations: &[Observation]) -> u64 {
        let mut h = Fnv1a::new();
        for o in observations {
            h.write(o.entity_id.as_bytes());
            h.write(&[0xff, o.class.code(), o.proximity.get(), o.los.code()]);
            h.write(&o.position.x.to_le_bytes());
            h.write(&o.position.y.to_le_bytes());
            h.write(&o.position.z.to_le_bytes());
        }
        h.finish()
    }

    /// Record one ingest. Returns true the first time a steady run goes
    /// over budget.
    pub fn record(&mut self, fingerprint: u64, deltas: usize) -> bool {
        if self.last_fingerprint != Some(fingerprint) {
            self.last_fingerprint = Some(fingerprint);
            self.steady_deltas = 0;
            self.warned = false;
            return false;
        }
        self.steady_deltas += deltas as u64;
        if self.steady_deltas > self.budget as u64 && !self.warned {
            self.warned = true;
            self.violations += 1;
            return true;
        }
        false
    }

    pub fn steady_deltas(&self) -> u64 {
        self.steady_deltas
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }
}
