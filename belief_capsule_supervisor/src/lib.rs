//! belief_capsule_supervisor
//!
//! Outside-world facing orchestration around `belief_capsule_core`.
//!
//! Responsibilities:
//! - quantize host detections into evidence batches
//! - run a primary channel against a verification replica
//! - keep one capsule per agent, sharded by agent id
//!
//! Non-goals:
//! - no IO
//! - no async
//! - no track policy (lives in core)

pub mod adapter;
pub mod error;
pub mod fleet;
pub mod supervisor;

pub use adapter::{
    build_evidence_batch,
    BasicEvidenceBuilder,
    BucketQuantizer,
    Detection,
    EvidenceBuilder,
};
pub use error::{SupervisorError, SupervisorResult};
pub use fleet::{CapsuleFleet, FleetSnapshot};
pub use supervisor::{ShadowStats, ShadowSupervisor};
