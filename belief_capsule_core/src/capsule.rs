//! The capsule instance: ingest, aging, snapshots.
//!
//! Single-threaded by contract. `ingest`, `tick` and `step` are the only
//! mutators and must be called in non-decreasing tick order. Each one
//! either applies fully or leaves the capsule untouched. Hosts sharing one
//! instance across threads serialize access themselves. Independent
//! instances share nothing and may run on separate threads.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::associate::{Association, AssociationResolver, ExactBucketRecovery, IdentityRecovery};
use crate::cfg::{CapsuleCfg, Extension, Mode};
use crate::delta::{Delta, EvictionReason, SparsityMonitor};
use crate::error::{CapsuleError, CapsuleResult};
use crate::evidence::{EvidenceBatch, Observation};
use crate::extensions::{Capabilities, ExtensionRegistry};
use crate::hysteresis::HysteresisGate;
use crate::risk::{
    HoldLastRisk, RiskAssessment, RiskClassifier, RiskEngine, RiskExtrapolator,
    TableRiskClassifier,
};
use crate::snapshot::{Snapshot, SnapshotBuilder};
use crate::store::TrackStore;
use crate::track::{Tick, Track, TrackId, TrackPhase};
use crate::uncertainty::UncertaintyModel;

/// Running counters. Observability only; never feeds back into decisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleStats {
    pub created: u64,
    pub reassociated: u64,
    pub reclassified: u64,
    /// Risk changes held back by the hysteresis gate (counted per tick).
    pub held_reclassifications: u64,
    pub expired: u64,
    /// Tracks reclaimed under capacity pressure.
    pub reclaimed: u64,
    /// Newcomers turned away because every live track was seen this tick.
    pub refused: u64,
    pub sparsity_violations: u64,
}

/// Assembles a capsule from explicit capabilities.
///
/// Every declared extension must have its capability supplied here;
/// `build` fails otherwise. Nothing is looked up later.
pub struct CapsuleBuilder {
    cfg: CapsuleCfg,
    classifier: Option<Box<dyn RiskClassifier>>,
    recovery: Option<Box<dyn IdentityRecovery>>,
    extrapolator: Option<Box<dyn RiskExtrapolator>>,
}

impl CapsuleBuilder {
    pub fn new(cfg: CapsuleCfg) -> Self {
        Self {
            cfg,
            classifier: None,
            recovery: None,
            extrapolator: None,
        }
    }

    /// Replace the default `TableRiskClassifier`.
    pub fn classifier(mut self, classifier: impl RiskClassifier + 'static) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    pub fn identity_recovery(mut self, recovery: impl IdentityRecovery + 'static) -> Self {
        self.recovery = Some(Box::new(recovery));
        self
    }

    pub fn extrapolator(mut self, extrapolator: impl RiskExtrapolator + 'static) -> Self {
        self.extrapolator = Some(Box::new(extrapolator));
        self
    }

    pub fn build(self) -> CapsuleResult<Capsule> {
        let cfg = self.cfg;
        cfg.validate()?;

        let classifier = self
            .classifier
            .unwrap_or_else(|| Box::new(TableRiskClassifier::new(cfg.uncertainty_threshold)));
        let capabilities = Capabilities {
            decomposed_risk: classifier.decomposed().is_some(),
            identity_recovery: self.recovery.is_some(),
            risk_extrapolation: self.extrapolator.is_some(),
        };
        let registry = ExtensionRegistry::verify(&cfg.declared_extensions, cfg.mode, capabilities)?;

        // Bound but undeclared capabilities stay dormant.
        let recovery = if registry.is_active(Extension::IdRobustness) {
            self.recovery
        } else {
            None
        };
        let risk = RiskEngine::new(
            classifier,
            self.extrapolator,
            registry.is_active(Extension::RiskComponentsV1),
            cfg.uncertainty_threshold,
            cfg.mode,
        );

        debug!(
            track_cap = cfg.track_cap,
            mode = ?cfg.mode,
            extensions = ?cfg.declared_extensions,
            "capsule constructed"
        );

        Ok(Capsule {
            store: TrackStore::new(cfg.track_cap),
            resolver: AssociationResolver::new(recovery),
            uncertainty: UncertaintyModel::new(cfg.uncertainty_growth, cfg.eviction_threshold),
            gate: HysteresisGate::new(
                cfg.reclassify_cooldown_ticks,
                cfg.hysteresis_budget,
                cfg.hysteresis_settle_ticks,
            ),
            sparsity: SparsityMonitor::new(cfg.sparsity_budget),
            risk,
            registry,
            current_tick: 0,
            stats: CapsuleStats::default(),
            cfg,
        })
    }
}

/// Mutable state captured before a call so a failure can be undone.
struct Checkpoint {
    store: TrackStore,
    sparsity: SparsityMonitor,
    current_tick: Tick,
    stats: CapsuleStats,
}

/// One belief/track maintenance instance.
pub struct Capsule {
    cfg: CapsuleCfg,
    registry: ExtensionRegistry,
    store: TrackStore,
    resolver: AssociationResolver,
    uncertainty: UncertaintyModel,
    risk: RiskEngine,
    gate: HysteresisGate,
    sparsity: SparsityMonitor,
    current_tick: Tick,
    stats: CapsuleStats,
}

impl Capsule {
    /// Construct with the standard component for every declared extension.
    pub fn new(cfg: CapsuleCfg) -> CapsuleResult<Self> {
        let mut builder = CapsuleBuilder::new(cfg.clone());
        if cfg.declares(Extension::IdRobustness) {
            builder = builder.identity_recovery(ExactBucketRecovery {
                horizon_ticks: cfg.id_recovery_horizon_ticks,
            });
        }
        if cfg.mode == Mode::Predictive || cfg.declares(Extension::PredictiveModel) {
            builder = builder.extrapolator(HoldLastRisk {
                hold_ticks: cfg.predictive_hold_ticks,
            });
        }
        builder.build()
    }

    pub fn builder(cfg: CapsuleCfg) -> CapsuleBuilder {
        CapsuleBuilder::new(cfg)
    }

    /// Apply one tick's observations. Returns deltas from association,
    /// creation, reclassification and capacity reclamation.
    ///
    /// Atomic: on any error the capsule is left exactly as it was.
    pub fn ingest(&mut self, batch: &EvidenceBatch) -> CapsuleResult<Vec<Delta>> {
        self.atomically(|c| {
            let (deltas, fingerprint) = c.apply_batch(batch)?;
            c.record_sparsity(batch.tick, fingerprint, deltas.len());
            Ok(deltas)
        })
    }

    /// Advance time to `tick` without evidence. Every track not seen at
    /// `tick` ages; expired tracks are evicted. Atomic like `ingest`.
    pub fn tick(&mut self, tick: Tick) -> CapsuleResult<Vec<Delta>> {
        self.atomically(|c| c.age(tick))
    }

    /// `ingest(batch)` then `tick(batch.tick)` as one unit. The sparsity
    /// monitor sees the combined deltas.
    pub fn step(&mut self, batch: &EvidenceBatch) -> CapsuleResult<Vec<Delta>> {
        self.atomically(|c| {
            let (mut deltas, fingerprint) = c.apply_batch(batch)?;
            deltas.extend(c.age(batch.tick)?);
            c.record_sparsity(batch.tick, fingerprint, deltas.len());
            Ok(deltas)
        })
    }

    /// Canonical full state. Only the current tick is answerable; no
    /// history is kept.
    pub fn get_snapshot(&self, tick: Tick) -> CapsuleResult<Snapshot> {
        if tick != self.current_tick {
            return Err(CapsuleError::SnapshotTick {
                requested: tick,
                current: self.current_tick,
            });
        }
        Ok(self.snapshot())
    }

    /// Snapshot at the current tick.
    pub fn snapshot(&self) -> Snapshot {
        SnapshotBuilder::build(self.current_tick, self.store.iter())
    }

    /// Live track count; never exceeds `track_cap`.
    #[inline]
    pub fn size(&self) -> usize {
        self.store.len()
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.store.get(id)
    }

    pub fn track_for_entity(&self, entity_id: &str) -> Option<&Track> {
        self.store
            .lookup_entity(entity_id)
            .and_then(|id| self.store.get(id))
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> + '_ {
        self.store.iter()
    }

    pub fn cfg(&self) -> &CapsuleCfg {
        &self.cfg
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> CapsuleStats {
        self.stats
    }

    /// Run `f`, restoring every mutable part of the capsule if it fails.
    fn atomically<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> CapsuleResult<T>,
    ) -> CapsuleResult<T> {
        let checkpoint = Checkpoint {
            store: self.store.clone(),
            sparsity: self.sparsity.clone(),
            current_tick: self.current_tick,
            stats: self.stats,
        };
        let result = f(self);
        if let Err(err) = &result {
            debug!(error = %err, tick = checkpoint.current_tick, "rolled back failed call");
            self.store = checkpoint.store;
            self.sparsity = checkpoint.sparsity;
            self.current_tick = checkpoint.current_tick;
            self.stats = checkpoint.stats;
        }
        result
    }

    fn apply_batch(&mut self, batch: &EvidenceBatch) -> CapsuleResult<(Vec<Delta>, u64)> {
        self.check_tick(batch.tick)?;
        let observations = batch.validate()?;
        let tick = batch.tick;
        self.current_tick = tick;

        let batch_entities: HashSet<&str> =
            observations.iter().map(|o| o.entity_id.as_str()).collect();
        let mut deltas = Vec::new();

        for obs in &observations {
            match self.resolver.resolve(obs, &self.store, tick, &batch_entities) {
                Association::Existing(id) => self.update(id, obs, tick, &mut deltas)?,
                Association::Recovered {
                    track_id,
                    previous_entity,
                } => {
                    debug!(
                        track = %track_id,
                        from = %previous_entity,
                        to = %obs.entity_id,
                        tick,
                        "re-associated entity to existing track"
                    );
                    self.stats.reassociated += 1;
                    deltas.push(Delta::Reassociated {
                        tick,
                        track_id,
                        previous_entity,
                        entity: obs.entity_id.clone(),
                    });
                    self.update(track_id, obs, tick, &mut deltas)?;
                }
                Association::Unmatched => self.admit(obs, tick, &batch_entities, &mut deltas)?,
            }
        }

        Ok((deltas, SparsityMonitor::fingerprint(&observations)))
    }

    fn age(&mut self, tick: Tick) -> CapsuleResult<Vec<Delta>> {
        self.check_tick(tick)?;
        self.current_tick = tick;

        let allow_raise = self.cfg.mode == Mode::Predictive;
        let mut deltas = Vec::new();

        for id in self.store.ids() {
            let expired = {
                let Some(track) = self.store.get_mut(id) else {
                    continue;
                };
                if track.last_seen_tick >= tick || track.aged_through_tick >= tick {
                    continue;
                }
                let steps = tick - track.aged_through_tick;
                track.p_unknown = self.uncertainty.advance(track.p_unknown, steps);
                track.aged_through_tick = tick;
                track.phase = TrackPhase::Aging;

                if self.uncertainty.expired(track.p_unknown) {
                    true
                } else {
                    let assessment = self.risk.evaluate_unobserved(track)?;
                    if let Some(d) = apply_assessment(
                        &self.gate,
                        track,
                        assessment,
                        tick,
                        allow_raise,
                        &mut self.stats,
                    ) {
                        deltas.push(d);
                    }
                    false
                }
            };
            if expired {
                self.evict(id, tick, EvictionReason::UncertaintyExpired, &mut deltas);
            }
        }

        Ok(deltas)
    }

    fn record_sparsity(&mut self, tick: Tick, fingerprint: u64, deltas: usize) {
        if self.sparsity.record(fingerprint, deltas) {
            warn!(
                tick,
                steady_deltas = self.sparsity.steady_deltas(),
                budget = self.cfg.sparsity_budget,
                "identical evidence produced deltas beyond sparsity budget"
            );
        }
        self.stats.sparsity_violations = self.sparsity.violations();
    }

    fn check_tick(&self, tick: Tick) -> CapsuleResult<()> {
        if tick < self.current_tick {
            return Err(CapsuleError::TickRegression {
                received: tick,
                current: self.current_tick,
            });
        }
        Ok(())
    }

    fn update(
        &mut self,
        id: TrackId,
        obs: &Observation,
        tick: Tick,
        deltas: &mut Vec<Delta>,
    ) -> CapsuleResult<()> {
        let assessment = self.risk.evaluate(id, obs.class, obs.proximity, self.uncertainty.reset())?;
        let Some(track) = self.store.observe(id, obs, tick) else {
            return Ok(());
        };
        track.observed_risk = assessment.level;
        if let Some(d) = apply_assessment(&self.gate, track, assessment, tick, true, &mut self.stats) {
            deltas.push(d);
        }
        Ok(())
    }

    fn admit(
        &mut self,
        obs: &Observation,
        tick: Tick,
        batch_entities: &HashSet<&str>,
        deltas: &mut Vec<Delta>,
    ) -> CapsuleResult<()> {
        if self.store.is_full() {
            match self.store.reclaim_candidate(tick, batch_entities) {
                Some(victim) => self.evict(victim, tick, EvictionReason::CapacityPressure, deltas),
                None => {
                    self.stats.refused += 1;
                    debug!(
                        entity = %obs.entity_id,
                        tick,
                        cap = self.store.cap(),
                        "store saturated with current-tick tracks; newcomer refused"
                    );
                    return Ok(());
                }
            }
        }

        let id = self.store.allocate_id();
        let assessment = self.risk.evaluate(id, obs.class, obs.proximity, self.uncertainty.reset())?;
        let track = Track::create(id, obs, tick, assessment);
        debug!(
            track = %id,
            entity = %obs.entity_id,
            class = %obs.class,
            risk = %assessment.level,
            tick,
            "track created"
        );
        deltas.push(Delta::NewThreat {
            tick,
            track_id: id,
            track: Box::new(track.clone()),
        });
        self.store.insert(track);
        self.stats.created += 1;
        Ok(())
    }

    fn evict(&mut self, id: TrackId, tick: Tick, reason: EvictionReason, deltas: &mut Vec<Delta>) {
        let Some(mut track) = self.store.remove(id) else {
            return;
        };
        track.phase = TrackPhase::Evicted;
        match reason {
            EvictionReason::UncertaintyExpired => self.stats.expired += 1,
            EvictionReason::CapacityPressure => self.stats.reclaimed += 1,
        }
        debug!(
            track = %id,
            reason = ?reason,
            p_unknown = track.p_unknown,
            tick,
            "track evicted"
        );
        deltas.push(Delta::Evicted {
            tick,
            track_id: id,
            reason,
            track: Box::new(track),
        });
    }
}

/// Record a fresh assessment and emit `reclassified` if the exposed level
/// changes and the hysteresis gate lets it through. With `allow_raise`
/// false the exposed level may only fall.
fn apply_assessment(
    gate: &HysteresisGate,
    track: &mut Track,
    assessment: RiskAssessment,
    tick: Tick,
    allow_raise: bool,
    stats: &mut CapsuleStats,
) -> Option<Delta> {
    if assessment.level != track.assessed_risk {
        gate.record_flip(&mut track.hysteresis, tick);
    }
    track.assessed_risk = assessment.level;
    track.components = assessment.components;

    let from = track.risk_level;
    let to = assessment.level;
    if to == from || (!allow_raise && to > from) {
        return None;
    }
    if !gate.try_pass(&mut track.hysteresis, tick) {
        stats.held_reclassifications += 1;
        return None;
    }
    track.risk_level = to;
    stats.reclassified += 1;
    Some(Delta::Reclassified {
        tick,
        track_id: track.track_id,
        from,
        to,
    })
}

impl fmt::Debug for Capsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capsule")
            .field("current_tick", &self.current_tick)
            .field("size", &self.store.len())
            .field("registry", &self.registry)
            .field("resolver", &self.resolver)
            .field("risk", &self.risk)
            .finish()
    }
}
