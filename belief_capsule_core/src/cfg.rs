use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CapsuleError, CapsuleResult};

/// How risk is allowed to evolve for tracks that are not being observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Stale danger assessments only ever decay while unobserved.
    #[default]
    Conservative,
    /// Risk may be held elevated by extrapolation. Requires an accountability
    /// extension (`risk_components_v1` or `predictive_model`).
    Predictive,
}

/// Optional capabilities an instance may declare.
///
/// Ordering is fixed so declared sets iterate identically everywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extension {
    RiskComponentsV1,
    IdRobustness,
    PredictiveModel,
}

impl Extension {
    pub const ALL: [Extension; 3] = [
        Extension::RiskComponentsV1,
        Extension::IdRobustness,
        Extension::PredictiveModel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Extension::RiskComponentsV1 => "risk_components_v1",
            Extension::IdRobustness => "id_robustness",
            Extension::PredictiveModel => "predictive_model",
        }
    }

    /// Stable bit used by the canonical codec and the C ABI.
    pub fn bit(self) -> u32 {
        match self {
            Extension::RiskComponentsV1 => 1 << 0,
            Extension::IdRobustness => 1 << 1,
            Extension::PredictiveModel => 1 << 2,
        }
    }

    pub fn set_from_bits(bits: u32) -> BTreeSet<Extension> {
        Extension::ALL
            .iter()
            .copied()
            .filter(|e| bits & e.bit() != 0)
            .collect()
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction-time configuration. Immutable for the instance lifetime;
/// reconfiguring means building a new capsule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleCfg {
    /// Hard upper bound on live tracks.
    pub track_cap: usize,
    /// Deltas tolerated across a run of identical batches.
    /// Default: 0 (strict quiescence).
    pub sparsity_budget: u32,
    /// `p_unknown` above this caps classification-derived risk at `low`.
    pub uncertainty_threshold: f64,
    pub mode: Mode,
    /// Max `reclassified` emissions per track inside one hysteresis window.
    pub hysteresis_budget: u32,
    pub declared_extensions: BTreeSet<Extension>,
    /// Max deltas per envelope.
    pub delta_cap: usize,
    /// A snapshot rides along at least once per this many envelopes.
    pub snapshot_interval_ticks: u32,

    /// Per-tick growth rate `g` of the uncertainty curve, in (0, 1).
    pub uncertainty_growth: f64,
    /// Tracks whose `p_unknown` reaches this are evicted.
    pub eviction_threshold: f64,
    /// Ticks a track stays closed to reclassification after an emission.
    pub reclassify_cooldown_ticks: u64,
    /// Ticks the computed risk level must hold still before a spent
    /// `hysteresis_budget` refills.
    pub hysteresis_settle_ticks: u64,
    /// Max silent ticks for `id_robustness` secondary matching.
    pub id_recovery_horizon_ticks: u64,
    /// Silent ticks the default extrapolator holds observed risk in predictive mode.
    pub predictive_hold_ticks: u64,
}

impl Default for CapsuleCfg {
    fn default() -> Self {
        Self {
            track_cap: 64,
            sparsity_budget: 0,
            uncertainty_threshold: 0.5,
            mode: Mode::Conservative,
            hysteresis_budget: 4,
            declared_extensions: BTreeSet::new(),
            delta_cap: 32,
            snapshot_interval_ticks: 10,
            uncertainty_growth: 0.15,
            eviction_threshold: 0.95,
            reclassify_cooldown_ticks: 5,
            hysteresis_settle_ticks: 64,
            id_recovery_horizon_ticks: 10,
            predictive_hold_ticks: 5,
        }
    }
}

impl CapsuleCfg {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(s: &str) -> CapsuleResult<Self> {
        let cfg: CapsuleCfg = serde_json::from_str(s)
            .map_err(|e| CapsuleError::Config(format!("invalid config json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn declares(&self, ext: Extension) -> bool {
        self.declared_extensions.contains(&ext)
    }

    /// Builder-style helper.
    pub fn with_extension(mut self, ext: Extension) -> Self {
        self.declared_extensions.insert(ext);
        self
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> CapsuleResult<()> {
        if self.track_cap == 0 {
            return Err(CapsuleError::Config("track_cap must be >= 1".into()));
        }
        if self.delta_cap == 0 {
            return Err(CapsuleError::Config("delta_cap must be >= 1".into()));
        }
        if self.snapshot_interval_ticks == 0 {
            return Err(CapsuleError::Config(
                "snapshot_interval_ticks must be >= 1".into(),
            ));
        }
        if self.hysteresis_settle_ticks == 0 {
            return Err(CapsuleError::Config(
                "hysteresis_settle_ticks must be >= 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.uncertainty_threshold) {
            return Err(CapsuleError::Config(format!(
                "uncertainty_threshold must be in [0, 1), got {}",
                self.uncertainty_threshold
            )));
        }
        if !(self.eviction_threshold > self.uncertainty_threshold && self.eviction_threshold <= 1.0)
        {
            return Err(CapsuleError::Config(format!(
                "eviction_threshold must be in (uncertainty_threshold, 1], got {} (uncertainty_threshold = {})",
                self.eviction_threshold, self.uncertainty_threshold
            )));
        }
        if !(self.uncertainty_growth > 0.0 && self.uncertainty_growth < 1.0) {
            return Err(CapsuleError::Config(format!(
                "uncertainty_growth must be in (0, 1), got {}",
                self.uncertainty_growth
            )));
        }
        if self.mode == Mode::Predictive
            && !self.declares(Extension::RiskComponentsV1)
            && !self.declares(Extension::PredictiveModel)
        {
            return Err(CapsuleError::Config(
                "predictive mode requires risk_components_v1 or predictive_model to be declared"
                    .into(),
            ));
        }
        Ok(())
    }
}
