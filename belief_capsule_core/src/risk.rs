use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cfg::Mode;
use crate::error::{CapsuleError, CapsuleResult};
use crate::evidence::{EntityClass, ProximityBucket};
use crate::track::{Track, TrackId};

/// Ordered risk scale: `None < Low < Moderate < High < Critical`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(v: u8) -> Option<Self> {
        match v {
            0 => Some(RiskLevel::None),
            1 => Some(RiskLevel::Low),
            2 => Some(RiskLevel::Moderate),
            3 => Some(RiskLevel::High),
            4 => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Decomposed risk exposed under `risk_components_v1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskComponents {
    /// What the entity is, suppressed by uncertainty.
    pub classification_risk: RiskLevel,
    /// How close it is. Never suppressed: a nearby unknown is still nearby.
    pub presence_risk: RiskLevel,
    pub risk_level: RiskLevel,
}

/// Base classifier capability: a pure `(class, proximity) -> risk` map.
pub trait RiskClassifier: Send + Sync {
    fn classify(&self, class: EntityClass, proximity: ProximityBucket) -> RiskLevel;

    /// The decomposed capability, if this classifier implements it.
    fn decomposed(&self) -> Option<&dyn DecomposedRiskClassifier> {
        None
    }
}

/// `risk_components_v1` capability.
pub trait DecomposedRiskClassifier: Send + Sync {
    fn classify_detailed(
        &self,
        class: EntityClass,
        proximity: ProximityBucket,
        p_unknown: f64,
    ) -> RiskComponents;
}

/// Predictive-mode capability: decides risk for a track that was not seen
/// this tick, given the level recomputed from its stale evidence.
pub trait RiskExtrapolator: Send + Sync {
    fn extrapolate(&self, track: &Track, recomputed: RiskLevel) -> RiskLevel;
}

/// Cap classification-derived risk at `Low` once uncertainty passes `threshold`.
#[inline]
pub fn suppress(level: RiskLevel, p_unknown: f64, threshold: f64) -> RiskLevel {
    if p_unknown > threshold {
        level.min(RiskLevel::Low)
    } else {
        level
    }
}

/// Risk from proximity alone.
pub fn presence_risk(proximity: ProximityBucket) -> RiskLevel {
    match proximity.get() {
        0 => RiskLevel::High,
        1 | 2 => RiskLevel::Moderate,
        3 | 4 => RiskLevel::Low,
        _ => RiskLevel::None,
    }
}

mod table {
    use super::RiskLevel::{self, Critical as C, High as H, Low as L, Moderate as M, None as N};

    pub(super) const HOSTILE: [RiskLevel; 8] = [C, C, H, H, M, M, L, L];
    pub(super) const PROJECTILE: [RiskLevel; 8] = [C, H, H, M, L, L, N, N];
    pub(super) const PLAYER: [RiskLevel; 8] = [H, M, M, L, L, L, N, N];
    pub(super) const NEUTRAL: [RiskLevel; 8] = [M, L, L, L, N, N, N, N];
    pub(super) const PASSIVE: [RiskLevel; 8] = [L, N, N, N, N, N, N, N];
    pub(super) const ITEM: [RiskLevel; 8] = [N; 8];
}

/// Default table-driven classifier. Implements both capabilities.
#[derive(Clone, Copy, Debug)]
pub struct TableRiskClassifier {
    uncertainty_threshold: f64,
}

impl TableRiskClassifier {
    pub fn new(uncertainty_threshold: f64) -> Self {
        Self {
            uncertainty_threshold,
        }
    }
}

impl RiskClassifier for TableRiskClassifier {
    fn classify(&self, class: EntityClass, proximity: ProximityBucket) -> RiskLevel {
        let row = match class {
            EntityClass::Hostile => &table::HOSTILE,
            EntityClass::Projectile => &table::PROJECTILE,
            EntityClass::Player => &table::PLAYER,
            EntityClass::Neutral => &table::NEUTRAL,
            EntityClass::Passive => &table::PASSIVE,
            EntityClass::Item => &table::ITEM,
        };
        row[proximity.get() as usize]
    }

    fn decomposed(&self) -> Option<&dyn DecomposedRiskClassifier> {
        Some(self)
    }
}

impl DecomposedRiskClassifier for TableRiskClassifier {
    fn classify_detailed(
        &self,
        class: EntityClass,
        proximity: ProximityBucket,
        p_unknown: f64,
    ) -> RiskComponents {
        let classification_risk = suppress(
            self.classify(class, proximity),
            p_unknown,
            self.uncertainty_threshold,
        );
        let presence_risk = presence_risk(proximity);
        RiskComponents {
            classification_risk,
            presence_risk,
            risk_level: classification_risk.max(presence_risk),
        }
    }
}

/// Default extrapolator: hold the last observed level for a bounded number
/// of silent ticks, then defer to the recomputed level.
#[derive(Clone, Copy, Debug)]
pub struct HoldLastRisk {
    pub hold_ticks: u64,
}

impl RiskExtrapolator for HoldLastRisk {
    fn extrapolate(&self, track: &Track, recomputed: RiskLevel) -> RiskLevel {
        if track.unseen_ticks() <= self.hold_ticks {
            recomputed.max(track.observed_risk)
        } else {
            recomputed
        }
    }
}

/// Outcome of one risk evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub components: Option<RiskComponents>,
}

/// Applies classifier, suppression and mode rules. The decomposed path is
/// taken only when `risk_components_v1` is active.
pub struct RiskEngine {
    classifier: Box<dyn RiskClassifier>,
    extrapolator: Option<Box<dyn RiskExtrapolator>>,
    decomposed: bool,
    threshold: f64,
    mode: Mode,
}

impl RiskEngine {
    pub(crate) fn new(
        classifier: Box<dyn RiskClassifier>,
        extrapolator: Option<Box<dyn RiskExtrapolator>>,
        decomposed: bool,
        threshold: f64,
        mode: Mode,
    ) -> Self {
        Self {
            classifier,
            extrapolator,
            decomposed,
            threshold,
            mode,
        }
    }

    /// Evaluate class/proximity at a given uncertainty.
    pub fn evaluate(
        &self,
        track_id: TrackId,
        class: EntityClass,
        proximity: ProximityBucket,
        p_unknown: f64,
    ) -> CapsuleResult<RiskAssessment> {
        if !self.decomposed {
            let level = suppress(
                self.classifier.classify(class, proximity),
                p_unknown,
                self.threshold,
            );
            return Ok(RiskAssessment {
                level,
                components: None,
            });
        }

        let detailed = self.classifier.decomposed().ok_or_else(|| CapsuleError::RiskContract {
            track_id,
            reason: "decomposed classifier disappeared after construction".into(),
        })?;
        let c = detailed.classify_detailed(class, proximity, p_unknown);
        self.check_components(track_id, &c, p_unknown)?;
        Ok(RiskAssessment {
            level: c.risk_level,
            components: Some(c),
        })
    }

    /// Assessment for a track that received no evidence this tick.
    /// `track.p_unknown` must already be advanced.
    pub fn evaluate_unobserved(&self, track: &Track) -> CapsuleResult<RiskAssessment> {
        let mut a = self.evaluate(track.track_id, track.class, track.proximity, track.p_unknown)?;
        a.level = match self.mode {
            Mode::Conservative => a.level.min(track.assessed_risk),
            Mode::Predictive => match &self.extrapolator {
                Some(x) => x.extrapolate(track, a.level),
                None => a.level.min(track.assessed_risk),
            },
        };
        if let Some(c) = &a.components {
            if a.level < c.classification_risk.max(c.presence_risk) {
                return Err(CapsuleError::RiskContract {
                    track_id: track.track_id,
                    reason: format!(
                        "aged level {} below components ({}, {})",
                        a.level, c.classification_risk, c.presence_risk
                    ),
                });
            }
        }
        Ok(a)
    }

    fn check_components(
        &self,
        track_id: TrackId,
        c: &RiskComponents,
        p_unknown: f64,
    ) -> CapsuleResult<()> {
        if p_unknown > self.threshold && c.classification_risk > RiskLevel::Low {
            return Err(CapsuleError::RiskContract {
                track_id,
                reason: format!(
                    "classification risk {} not suppressed at p_unknown {p_unknown}",
                    c.classification_risk
                ),
            });
        }
        if c.risk_level < c.classification_risk.max(c.presence_risk) {
            return Err(CapsuleError::RiskContract {
                track_id,
                reason: format!(
                    "risk level {} below max({}, {})",
                    c.risk_level, c.classification_risk, c.presence_risk
                ),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RiskEngine")
            .field("decomposed", &self.decomposed)
            .field("extrapolating", &self.extrapolator.is_some())
            .field("threshold", &self.threshold)
            .field("mode", &self.mode)
            .finish()
    }
}
