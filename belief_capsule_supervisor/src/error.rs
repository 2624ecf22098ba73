use belief_capsule_core::{CapsuleError, Tick};
use thiserror::Error;

/// Errors raised by the orchestration layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SupervisorError {
    #[error(transparent)]
    Capsule(#[from] CapsuleError),

    /// Primary and replica disagreed on a step's outcome.
    #[error("shadow replica diverged from primary at tick {tick} ({stage})")]
    Divergence { tick: Tick, stage: &'static str },

    /// A detection could not be turned into evidence.
    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("unknown agent `{0}`")]
    UnknownAgent(String),

    #[error("shard lock poisoned")]
    Poisoned,

    #[error("replica worker panicked")]
    WorkerPanicked,
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
