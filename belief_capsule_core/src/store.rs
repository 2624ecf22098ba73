use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::evidence::{EntityClass, Observation, PositionBucket};
use crate::track::{Tick, Track, TrackId};

type BucketKey = (EntityClass, PositionBucket);

/// Bounded map of live tracks.
///
/// Tracks live in a `BTreeMap` keyed by id so every walk over the store is
/// in ascending id order regardless of insertion history. The hash indexes
/// are lookup-only and never iterated.
#[derive(Clone, Debug)]
pub struct TrackStore {
    cap: usize,
    next_id: u64,
    tracks: BTreeMap<TrackId, Track>,
    by_entity: HashMap<String, TrackId>,
    by_bucket: HashMap<BucketKey, BTreeSet<TrackId>>,
}

impl TrackStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            next_id: 1,
            tracks: BTreeMap::new(),
            by_entity: HashMap::new(),
            by_bucket: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.tracks.len() >= self.cap
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Mutable access for risk and hysteresis bookkeeping. Identity and
    /// bucket fields change only through `observe`, which keeps the indexes
    /// in step.
    pub(crate) fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub fn lookup_entity(&self, entity_id: &str) -> Option<TrackId> {
        self.by_entity.get(entity_id).copied()
    }

    /// Live tracks sharing an exact class and position bucket, ascending id.
    pub fn bucket_members(
        &self,
        class: EntityClass,
        position: PositionBucket,
    ) -> impl Iterator<Item = &Track> + '_ {
        self.by_bucket
            .get(&(class, position))
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.tracks.get(id))
    }

    /// Next never-used id. The counter only moves forward.
    pub(crate) fn allocate_id(&mut self) -> TrackId {
        let id = TrackId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, track: Track) {
        self.by_entity.insert(track.entity_id.clone(), track.track_id);
        self.by_bucket
            .entry((track.class, track.position))
            .or_default()
            .insert(track.track_id);
        self.tracks.insert(track.track_id, track);
    }

    /// Apply a reobservation, re-indexing entity and bucket.
    pub(crate) fn observe(&mut self, id: TrackId, obs: &Observation, tick: Tick) -> Option<&mut Track> {
        let (old_entity, old_key) = {
            let t = self.tracks.get(&id)?;
            (t.entity_id.clone(), (t.class, t.position))
        };
        if old_entity != obs.entity_id {
            self.by_entity.remove(&old_entity);
            self.by_entity.insert(obs.entity_id.clone(), id);
        }
        let new_key = (obs.class, obs.position);
        if old_key != new_key {
            self.unindex_bucket(old_key, id);
            self.by_bucket.entry(new_key).or_default().insert(id);
        }
        let track = self.tracks.get_mut(&id)?;
        track.observe(obs, tick);
        Some(track)
    }

    pub(crate) fn remove(&mut self, id: TrackId) -> Option<Track> {
        let track = self.tracks.remove(&id)?;
        if self.by_entity.get(&track.entity_id) == Some(&id) {
            self.by_entity.remove(&track.entity_id);
        }
        self.unindex_bucket((track.class, track.position), id);
        Some(track)
    }

    /// Least-certain track not observed at `tick` and not named in the
    /// batch being applied, if any.
    pub fn reclaim_candidate(&self, tick: Tick, protected: &HashSet<&str>) -> Option<TrackId> {
        self.tracks
            .values()
            .filter(|t| t.last_seen_tick < tick)
            .filter(|t| !protected.contains(t.entity_id.as_str()))
            .min_by_key(|t| t.reclaim_rank())
            .map(|t| t.track_id)
    }

    /// Live tracks in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Track> + '_ {
        self.tracks.values()
    }

    pub(crate) fn ids(&self) -> Vec<TrackId> {
        self.tracks.keys().copied().collect()
    }

    fn unindex_bucket(&mut self, key: BucketKey, id: TrackId) {
        if let Some(set) = self.by_bucket.get_mut(&key) {
            set.remove(&id);
            if set.is_empty() {
                self.by_bucket.remove(&key);
            }
        }
    }
}
