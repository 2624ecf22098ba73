pub mod error;
pub mod cfg;
pub mod evidence;
pub mod track;

pub mod associate;
pub mod store;
pub mod uncertainty;
pub mod risk;
pub mod hysteresis;
pub mod delta;
pub mod snapshot;
pub mod envelope;
pub mod extensions;
pub mod codec;

pub mod capsule;
pub mod channel;

pub use error::{CapsuleError, CapsuleResult};
pub use cfg::{CapsuleCfg, Extension, Mode};
pub use evidence::{
    EntityClass, EvidenceBatch, EvidenceItem, Features, Los, Observation, PositionBucket,
    ProximityBucket, MAX_PROXIMITY, POSITION_LIMIT,
};
pub use track::{Tick, Track, TrackId, TrackPhase};

pub use associate::{Association, AssociationResolver, ExactBucketRecovery, IdentityRecovery};
pub use store::TrackStore;
pub use uncertainty::UncertaintyModel;
pub use risk::{
    presence_risk, suppress, DecomposedRiskClassifier, HoldLastRisk, RiskAssessment,
    RiskClassifier, RiskComponents, RiskExtrapolator, RiskLevel, TableRiskClassifier,
};
pub use hysteresis::{HysteresisGate, HysteresisState};
pub use delta::{Delta, EvictionReason, SparsityMonitor};
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use envelope::{Envelope, EnvelopePackager};
pub use extensions::{Capabilities, ExtensionRegistry, ExtensionStatus};

pub use capsule::{Capsule, CapsuleBuilder, CapsuleStats};
pub use channel::{EmissionChannel, StepDigest};
