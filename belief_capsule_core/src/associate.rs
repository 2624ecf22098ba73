use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;

use crate::evidence::Observation;
use crate::store::TrackStore;
use crate::track::{Tick, TrackId};

/// How an observation was matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Association {
    /// Same external entity as an existing track.
    Existing(TrackId),
    /// Entity-id churn recovered by secondary matching (`id_robustness`).
    Recovered {
        track_id: TrackId,
        previous_entity: String,
    },
    /// Nothing matched; a new track is needed.
    Unmatched,
}

/// `id_robustness` capability: secondary matching when the entity id is
/// unknown.
pub trait IdentityRecovery: Send + Sync {
    /// `batch_entities` holds every entity id in the current batch; tracks
    /// whose own entity is present this tick are never candidates.
    fn recover(
        &self,
        obs: &Observation,
        store: &TrackStore,
        tick: Tick,
        batch_entities: &HashSet<&str>,
    ) -> Option<TrackId>;
}

/// Exact class + position-bucket match against tracks silent for at most
/// `horizon_ticks`. Ties go to the most recently seen, then lowest id.
#[derive(Clone, Copy, Debug)]
pub struct ExactBucketRecovery {
    pub horizon_ticks: u64,
}

impl IdentityRecovery for ExactBucketRecovery {
    fn recover(
        &self,
        obs: &Observation,
        store: &TrackStore,
        tick: Tick,
        batch_entities: &HashSet<&str>,
    ) -> Option<TrackId> {
        store
            .bucket_members(obs.class, obs.position)
            .filter(|t| t.last_seen_tick < tick)
            .filter(|t| tick - t.last_seen_tick <= self.horizon_ticks)
            .filter(|t| !batch_entities.contains(t.entity_id.as_str()))
            .min_by_key(|t| (Reverse(t.last_seen_tick), t.track_id))
            .map(|t| t.track_id)
    }
}

/// Matches evidence to tracks: entity id first, then the optional
/// recovery strategy.
pub struct AssociationResolver {
    recovery: Option<Box<dyn IdentityRecovery>>,
}

impl AssociationResolver {
    pub(crate) fn new(recovery: Option<Box<dyn IdentityRecovery>>) -> Self {
        Self { recovery }
    }

    pub fn recovers_identity(&self) -> bool {
        self.recovery.is_some()
    }

    pub fn resolve(
        &self,
        obs: &Observation,
        store: &TrackStore,
        tick: Tick,
        batch_entities: &HashSet<&str>,
    ) -> Association {
        if let Some(id) = store.lookup_entity(&obs.entity_id) {
            return Association::Existing(id);
        }
        let recovered = self
            .recovery
            .as_ref()
            .and_then(|r| r.recover(obs, store, tick, batch_entities))
            .and_then(|id| store.get(id));
        match recovered {
            Some(t) => Association::Recovered {
                track_id: t.track_id,
                previous_entity: t.entity_id.clone(),
            },
            None => Association::Unmatched,
        }
    }
}

impl fmt::Debug for AssociationResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationResolver")
            .field("recovers_identity", &self.recovers_identity())
            .finish()
    }
}
