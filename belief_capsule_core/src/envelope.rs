use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec;
use crate::delta::Delta;
use crate::error::{CapsuleError, CapsuleResult};
use crate::snapshot::Snapshot;
use crate::track::Tick;

/// Bounded outgoing package of deltas, with a periodic snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: u64,
    /// Capsule tick at packaging time.
    pub tick: Tick,
    /// Oldest pending deltas, at most `delta_cap` of them.
    pub saliency_events: Vec<Delta>,
    /// Deltas still queued after this envelope.
    pub deferred: usize,
    pub snapshot: Option<Snapshot>,
}

impl Envelope {
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        codec::encode_envelope(self)
    }
}

/// FIFO delta queue drained into capped envelopes.
///
/// Overflow policy: deltas beyond `delta_cap` stay queued and lead the next
/// envelope, in original order. Only deltas that break producer
/// obligations are ever removed without being sent.
#[derive(Clone, Debug)]
pub struct EnvelopePackager {
    delta_cap: usize,
    snapshot_interval: u32,
    pending: VecDeque<Delta>,
    /// Envelopes built since the last one carrying a snapshot; `None`
    /// until the first envelope.
    since_snapshot: Option<u32>,
    snapshot_requested: bool,
    last_sequence: Option<u64>,
    rejected: u64,
}

impl EnvelopePackager {
    pub fn new(delta_cap: usize, snapshot_interval: u32) -> Self {
        Self {
            delta_cap: delta_cap.max(1),
            snapshot_interval: snapshot_interval.max(1),
            pending: VecDeque::new(),
            since_snapshot: None,
            snapshot_requested: false,
            last_sequence: None,
            rejected: 0,
        }
    }

    pub fn enqueue<I: IntoIterator<Item = Delta>>(&mut self, deltas: I) {
        self.pending.extend(deltas);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Deltas quarantined so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Force a snapshot into the next envelope (consumer resync).
    pub fn request_snapshot(&mut self) {
        self.snapshot_requested = true;
    }

    /// Whether the next envelope will carry a snapshot.
    pub fn snapshot_due(&self) -> bool {
        self.snapshot_requested
            || match self.since_snapshot {
                None => true,
                Some(n) => n + 1 >= self.snapshot_interval,
            }
    }

    /// Build envelope `sequence`. `snapshot` is only invoked when one is due.
    ///
    /// Every delta is validated before anything is taken off the queue. A
    /// delta that fails is quarantined (dropped from the queue and counted)
    /// and the call returns the error; the valid deltas stay queued for the
    /// next call.
    pub fn package<F>(&mut self, sequence: u64, tick: Tick, snapshot: F) -> CapsuleResult<Envelope>
    where
        F: FnOnce() -> Snapshot,
    {
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                return Err(CapsuleError::SequenceRegression {
                    received: sequence,
                    last,
                });
            }
        }

        let take = self.pending.len().min(self.delta_cap);
        let invalid = self
            .pending
            .iter()
            .take(take)
            .enumerate()
            .find_map(|(i, d)| d.validate().err().map(|e| (i, e)));
        if let Some((index, err)) = invalid {
            if let Some(bad) = self.pending.remove(index) {
                self.rejected += 1;
                warn!(
                    sequence,
                    track = %bad.track_id(),
                    kind = bad.kind(),
                    error = %err,
                    "quarantined delta that breaks producer obligations"
                );
            }
            return Err(err);
        }
        let saliency_events: Vec<Delta> = self.pending.drain(..take).collect();

        let snapshot = if self.snapshot_due() {
            self.since_snapshot = Some(0);
            self.snapshot_requested = false;
            Some(snapshot())
        } else {
            self.since_snapshot = self.since_snapshot.map(|n| n + 1);
            None
        };

        self.last_sequence = Some(sequence);
        debug!(
            sequence,
            tick,
            events = saliency_events.len(),
            deferred = self.pending.len(),
            snapshot = snapshot.is_some(),
            "envelope built"
        );

        Ok(Envelope {
            sequence,
            tick,
            saliency_events,
            deferred: self.pending.len(),
            snapshot,
        })
    }
}
