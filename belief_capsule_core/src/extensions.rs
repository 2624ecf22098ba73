use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::cfg::{Extension, Mode};
use crate::error::{CapsuleError, CapsuleResult};

/// Capabilities actually bound into an instance at construction time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The classifier implements `classify_detailed`.
    pub decomposed_risk: bool,
    /// An identity-recovery strategy is installed.
    pub identity_recovery: bool,
    /// A risk extrapolator is installed.
    pub risk_extrapolation: bool,
}

impl Capabilities {
    fn provides(&self, ext: Extension) -> (bool, &'static str) {
        match ext {
            Extension::RiskComponentsV1 => (self.decomposed_risk, "decomposed risk classifier"),
            Extension::IdRobustness => (self.identity_recovery, "identity recovery strategy"),
            Extension::PredictiveModel => (self.risk_extrapolation, "risk extrapolator"),
        }
    }
}

/// One line of a certification record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionStatus {
    pub extension: Extension,
    pub declared: bool,
    pub implemented: bool,
}

/// Declared extensions of one instance, verified against its capabilities.
///
/// A registry only exists once verification passed, so holding one is proof
/// that every declared extension has its capability bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionRegistry {
    declared: BTreeSet<Extension>,
    capabilities: Capabilities,
}

impl ExtensionRegistry {
    pub fn verify(
        declared: &BTreeSet<Extension>,
        mode: Mode,
        capabilities: Capabilities,
    ) -> CapsuleResult<Self> {
        for &ext in declared {
            let (ok, capability) = capabilities.provides(ext);
            if !ok {
                return Err(CapsuleError::MissingCapability {
                    extension: ext,
                    capability,
                });
            }
        }
        if mode == Mode::Predictive && !capabilities.risk_extrapolation {
            return Err(CapsuleError::MissingExtrapolator);
        }
        Ok(Self {
            declared: declared.clone(),
            capabilities,
        })
    }

    #[inline]
    pub fn is_active(&self, ext: Extension) -> bool {
        self.declared.contains(&ext)
    }

    pub fn declared(&self) -> impl Iterator<Item = Extension> + '_ {
        self.declared.iter().copied()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Per-extension status in fixed order, for certification records.
    pub fn report(&self) -> Vec<ExtensionStatus> {
        Extension::ALL
            .iter()
            .map(|&extension| ExtensionStatus {
                extension,
                declared: self.is_active(extension),
                implemented: self.capabilities.provides(extension).0,
            })
            .collect()
    }
}
