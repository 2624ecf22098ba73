use std::fmt;

use serde::{Deserialize, Serialize};

use crate::evidence::{EntityClass, Los, Observation, PositionBucket, ProximityBucket};
use crate::hysteresis::HysteresisState;
use crate::risk::{RiskAssessment, RiskComponents, RiskLevel};

/// Logical time supplied by the caller. No wall clock is ever read.
pub type Tick = u64;

/// Capsule-assigned identity. Allocated from a monotonic counter and
/// never handed out twice, even after eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Per-track lifecycle. `Evicted` is terminal and only ever appears in the
/// payload of an `evicted` delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackPhase {
    Active,
    Aging,
    Evicted,
}

impl TrackPhase {
    pub fn code(self) -> u8 {
        match self {
            TrackPhase::Active => 0,
            TrackPhase::Aging => 1,
            TrackPhase::Evicted => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TrackPhase::Active),
            1 => Some(TrackPhase::Aging),
            2 => Some(TrackPhase::Evicted),
            _ => None,
        }
    }
}

/// The capsule's belief about one externally observed entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: TrackId,
    /// External identifier currently bound to this track. May change under
    /// `id_robustness` re-association; `track_id` never does.
    pub entity_id: String,
    pub class: EntityClass,
    pub position: PositionBucket,
    pub proximity: ProximityBucket,
    pub los: Los,
    pub p_unknown: f64,
    /// Level consumers have been told about (last emitted).
    pub risk_level: RiskLevel,
    /// Level most recently computed; differs from `risk_level` while the
    /// hysteresis gate holds a change back.
    pub assessed_risk: RiskLevel,
    /// Level assessed at the last observation.
    pub observed_risk: RiskLevel,
    /// Present only when `risk_components_v1` is active.
    pub components: Option<RiskComponents>,
    pub phase: TrackPhase,
    pub created_tick: Tick,
    pub last_seen_tick: Tick,
    /// Uncertainty has been advanced through this tick.
    pub aged_through_tick: Tick,
    pub hysteresis: HysteresisState,
}

impl Track {
    pub(crate) fn create(
        track_id: TrackId,
        obs: &Observation,
        tick: Tick,
        assessment: RiskAssessment,
    ) -> Self {
        Self {
            track_id,
            entity_id: obs.entity_id.clone(),
            class: obs.class,
            position: obs.position,
            proximity: obs.proximity,
            los: obs.los,
            p_unknown: 0.0,
            risk_level: assessment.level,
            assessed_risk: assessment.level,
            observed_risk: assessment.level,
            components: assessment.components,
            phase: TrackPhase::Active,
            created_tick: tick,
            last_seen_tick: tick,
            aged_through_tick: tick,
            hysteresis: HysteresisState::default(),
        }
    }

    /// Refresh from a reobservation. Uncertainty restarts from zero.
    pub(crate) fn observe(&mut self, obs: &Observation, tick: Tick) {
        self.entity_id.clone_from(&obs.entity_id);
        self.class = obs.class;
        self.position = obs.position;
        self.proximity = obs.proximity;
        self.los = obs.los;
        self.p_unknown = 0.0;
        self.phase = TrackPhase::Active;
        self.last_seen_tick = tick;
        self.aged_through_tick = tick;
    }

    pub fn reclassify_cooldown_until_tick(&self) -> Tick {
        self.hysteresis.cooldown_until
    }

    /// Consecutive ticks this track has gone without evidence.
    pub fn unseen_ticks(&self) -> u64 {
        self.aged_through_tick.saturating_sub(self.last_seen_tick)
    }

    /// Ordering key for capacity reclamation: least certain first
    /// (highest `p_unknown`, then oldest sighting, then lowest id).
    pub(crate) fn reclaim_rank(&self) -> (std::cmp::Reverse<u64>, Tick, TrackId) {
        (
            std::cmp::Reverse(self.p_unknown.to_bits()),
            self.last_seen_tick,
            self.track_id,
        )
    }
}
