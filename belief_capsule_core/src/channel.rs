use crate::capsule::Capsule;
use crate::cfg::CapsuleCfg;
use crate::codec;
use crate::delta::Delta;
use crate::envelope::{Envelope, EnvelopePackager};
use crate::error::CapsuleResult;
use crate::evidence::EvidenceBatch;
use crate::track::Tick;

/// Digest of the deltas one step produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepDigest {
    pub tick: Tick,
    pub deltas: usize,
    pub digest: u64,
}

impl StepDigest {
    pub fn of(tick: Tick, deltas: &[Delta]) -> Self {
        Self {
            tick,
            deltas: deltas.len(),
            digest: codec::digest(&codec::encode_deltas(deltas)),
        }
    }
}

/// Emission layer: a capsule plus its envelope packager.
#[derive(Debug)]
pub struct EmissionChannel {
    capsule: Capsule,
    packager: EnvelopePackager,
    last_step: StepDigest,
}

impl EmissionChannel {
    pub fn new(cfg: CapsuleCfg) -> CapsuleResult<Self> {
        Ok(Self::from_capsule(Capsule::new(cfg)?))
    }

    /// Wrap a capsule built with custom capabilities.
    pub fn from_capsule(capsule: Capsule) -> Self {
        let packager = EnvelopePackager::new(
            capsule.cfg().delta_cap,
            capsule.cfg().snapshot_interval_ticks,
        );
        Self {
            capsule,
            packager,
            last_step: StepDigest::default(),
        }
    }

    /// `ingest(batch)` then `tick(batch.tick)` as one atomic step; all
    /// deltas are queued for the next envelopes. On error nothing is queued
    /// and the capsule is unchanged.
    pub fn ingest_and_tick(&mut self, batch: &EvidenceBatch) -> CapsuleResult<()> {
        let deltas = self.capsule.step(batch)?;
        self.queue(batch.tick, deltas);
        Ok(())
    }

    /// Advance time with no evidence at all.
    pub fn advance(&mut self, tick: Tick) -> CapsuleResult<()> {
        let deltas = self.capsule.tick(tick)?;
        self.queue(tick, deltas);
        Ok(())
    }

    pub fn build_envelope(&mut self, sequence: u64) -> CapsuleResult<Envelope> {
        let capsule = &self.capsule;
        self.packager
            .package(sequence, capsule.current_tick(), || capsule.snapshot())
    }

    pub fn request_snapshot(&mut self) {
        self.packager.request_snapshot();
    }

    pub fn pending(&self) -> usize {
        self.packager.pending()
    }

    /// Deltas quarantined for failing producer obligations.
    pub fn rejected(&self) -> u64 {
        self.packager.rejected()
    }

    pub fn capsule(&self) -> &Capsule {
        &self.capsule
    }

    /// Digest of the most recent `ingest_and_tick` / `advance`.
    pub fn last_step(&self) -> StepDigest {
        self.last_step
    }

    fn queue(&mut self, tick: Tick, deltas: Vec<Delta>) {
        self.last_step = StepDigest::of(tick, &deltas);
        self.packager.enqueue(deltas);
    }
}
