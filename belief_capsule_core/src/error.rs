use thiserror::Error;

use crate::cfg::Extension;
use crate::track::{Tick, TrackId};

/// Root error type for capsule failures.
///
/// Capacity-driven eviction is deliberately absent: it is a normal outcome
/// reported through an `evicted` delta.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapsuleError {
    /// Invalid construction-time configuration.
    #[error("config error: {0}")]
    Config(String),

    /// An evidence item failed structural validation.
    #[error("malformed evidence at index {index}: {reason}")]
    MalformedEvidence { index: usize, reason: String },

    /// The same external entity appeared twice in one batch.
    #[error("entity `{entity_id}` appears more than once in batch for tick {tick}")]
    DuplicateEntity { entity_id: String, tick: Tick },

    /// Mutating calls must arrive in non-decreasing tick order.
    #[error("tick regression: received tick {received}, current tick is {current}")]
    TickRegression { received: Tick, current: Tick },

    /// Snapshots are only answerable for the current tick.
    #[error("snapshot requested for tick {requested}, current tick is {current}")]
    SnapshotTick { requested: Tick, current: Tick },

    /// An extension (or mode) was declared without the capability it needs.
    #[error("`{extension}` declared without a {capability}")]
    MissingCapability {
        extension: Extension,
        capability: &'static str,
    },

    /// Predictive mode declared without a risk extrapolator.
    #[error("predictive mode configured without a risk extrapolator")]
    MissingExtrapolator,

    /// A classifier returned components that break the combiner contract.
    #[error("risk contract violated for track {track_id}: {reason}")]
    RiskContract { track_id: TrackId, reason: String },

    /// A delta failed the packager's own validation.
    #[error("producer obligation violated: {0}")]
    ProducerObligation(String),

    /// Envelope sequence numbers must strictly increase.
    #[error("envelope sequence {received} does not follow {last}")]
    SequenceRegression { received: u64, last: u64 },

    /// Canonical encoding could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

pub type CapsuleResult<T> = Result<T, CapsuleError>;
