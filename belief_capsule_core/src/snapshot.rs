use serde::{Deserialize, Serialize};

use crate::codec;
use crate::track::{Tick, Track};

/// Full canonical state at one tick: every live track, ascending `track_id`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: Tick,
    pub tracks: Vec<Track>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Canonical bytes; equal state means equal bytes.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        codec::encode_snapshot(self)
    }

    pub fn digest(&self) -> u64 {
        codec::digest(&self.to_canonical_bytes())
    }
}

/// Builds snapshots in canonical order from whatever order the backing
/// store yields.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    pub fn build<'a, I>(tick: Tick, tracks: I) -> Snapshot
    where
        I: IntoIterator<Item = &'a Track>,
    {
        let mut tracks: Vec<Track> = tracks.into_iter().cloned().collect();
        tracks.sort_by_key(|t| t.track_id);
        Snapshot { tick, tracks }
    }
}
