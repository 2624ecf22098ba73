//! Shadow supervisor.
//!
//! Runs a primary emission channel next to an independently built replica
//! capsule and checks, step by step, that both produced the same delta
//! stream. Any disagreement is a hard error: a consumer that rebuilds
//! state from deltas would otherwise drift silently.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use belief_capsule_core::{
    Capsule, CapsuleCfg, CapsuleResult, EmissionChannel, Envelope, EvidenceBatch, StepDigest, Tick,
};

use crate::adapter::{build_evidence_batch, Detection, EvidenceBuilder};
use crate::error::{SupervisorError, SupervisorResult};

/// Counters for the verification loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowStats {
    pub steps: u64,
    /// Steps where both sides agreed (including agreeing on an error).
    pub verified_steps: u64,
    pub snapshot_checks: u64,
    pub divergences: u64,
}

#[derive(Debug)]
pub struct ShadowSupervisor {
    primary: EmissionChannel,
    replica: Capsule,
    parallel: bool,
    stats: ShadowStats,
}

impl ShadowSupervisor {
    /// Primary and replica from the same config.
    pub fn new(cfg: CapsuleCfg) -> SupervisorResult<Self> {
        let primary = EmissionChannel::new(cfg.clone())?;
        let replica = Capsule::new(cfg)?;
        Ok(Self::from_parts(primary, replica))
    }

    /// Pair a primary with a replica built elsewhere (custom capabilities).
    pub fn from_parts(primary: EmissionChannel, replica: Capsule) -> Self {
        Self {
            primary,
            replica,
            parallel: false,
            stats: ShadowStats::default(),
        }
    }

    /// Step the replica on a scoped worker thread.
    pub fn parallel(mut self, on: bool) -> Self {
        self.parallel = on;
        self
    }

    pub fn ingest_and_tick(&mut self, batch: &EvidenceBatch) -> SupervisorResult<StepDigest> {
        let (primary, replica) = if self.parallel {
            let (p, r) = (&mut self.primary, &mut self.replica);
            std::thread::scope(|s| {
                let worker = s.spawn(move || step_replica(r, batch));
                let primary = step_primary(p, batch);
                (primary, worker.join())
            })
        } else {
            let primary = step_primary(&mut self.primary, batch);
            (primary, Ok(step_replica(&mut self.replica, batch)))
        };
        let replica = replica.map_err(|_| SupervisorError::WorkerPanicked)?;
        self.reconcile(batch.tick, "ingest_and_tick", primary, replica)
    }

    /// Quantize detections, then step both sides.
    pub fn ingest_detections<B: EvidenceBuilder>(
        &mut self,
        builder: &B,
        tick: Tick,
        detections: &[Detection<'_>],
    ) -> SupervisorResult<StepDigest> {
        let batch = build_evidence_batch(builder, tick, detections)?;
        self.ingest_and_tick(&batch)
    }

    pub fn advance(&mut self, tick: Tick) -> SupervisorResult<StepDigest> {
        let primary = self
            .primary
            .advance(tick)
            .map(|()| self.primary.last_step());
        let replica = self
            .replica
            .tick(tick)
            .map(|deltas| StepDigest::of(tick, &deltas));
        self.reconcile(tick, "advance", primary, replica)
    }

    pub fn build_envelope(&mut self, sequence: u64) -> SupervisorResult<Envelope> {
        Ok(self.primary.build_envelope(sequence)?)
    }

    pub fn request_snapshot(&mut self) {
        self.primary.request_snapshot();
    }

    /// Compare canonical snapshot bytes of both sides. Returns the shared digest.
    pub fn verify_snapshots(&mut self) -> SupervisorResult<u64> {
        self.stats.snapshot_checks += 1;
        let tick = self.primary.capsule().current_tick();
        let primary = self.primary.capsule().snapshot();
        let replica = self.replica.snapshot();
        if primary.to_canonical_bytes() != replica.to_canonical_bytes() {
            self.stats.divergences += 1;
            warn!(
                tick,
                primary_tracks = primary.len(),
                replica_tracks = replica.len(),
                "snapshot mismatch between primary and replica"
            );
            return Err(SupervisorError::Divergence {
                tick,
                stage: "snapshot",
            });
        }
        Ok(primary.digest())
    }

    pub fn primary(&self) -> &EmissionChannel {
        &self.primary
    }

    pub fn replica(&self) -> &Capsule {
        &self.replica
    }

    pub fn stats(&self) -> ShadowStats {
        self.stats
    }

    fn reconcile(
        &mut self,
        tick: Tick,
        stage: &'static str,
        primary: CapsuleResult<StepDigest>,
        replica: CapsuleResult<StepDigest>,
    ) -> SupervisorResult<StepDigest> {
        self.stats.steps += 1;
        match (primary, replica) {
            (Ok(p), Ok(r)) if p == r => {
                self.stats.verified_steps += 1;
                debug!(tick, deltas = p.deltas, digest = p.digest, "step verified");
                Ok(p)
            }
            (Err(pe), Err(re)) if pe == re => {
                self.stats.verified_steps += 1;
                Err(pe.into())
            }
            (p, r) => {
                self.stats.divergences += 1;
                warn!(tick, stage, primary = ?p, replica = ?r, "shadow replica diverged");
                Err(SupervisorError::Divergence { tick, stage })
            }
        }
    }
}

fn step_primary(primary: &mut EmissionChannel, batch: &EvidenceBatch) -> CapsuleResult<StepDigest> {
    primary.ingest_and_tick(batch)?;
    Ok(primary.last_step())
}

fn step_replica(replica: &mut Capsule, batch: &EvidenceBatch) -> CapsuleResult<StepDigest> {
    let deltas = replica.step(batch)?;
    Ok(StepDigest::of(batch.tick, &deltas))
}
