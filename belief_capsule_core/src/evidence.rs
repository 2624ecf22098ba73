use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CapsuleError, CapsuleResult};
use crate::track::Tick;

/// Nearest proximity band is 0, farthest is `MAX_PROXIMITY`.
pub const MAX_PROXIMITY: u8 = 7;

/// Position bucket coordinates must satisfy `|c| <= POSITION_LIMIT`.
pub const POSITION_LIMIT: i32 = 1 << 20;

/// What kind of entity the perception layer resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Hostile,
    Projectile,
    Player,
    Neutral,
    Passive,
    Item,
}

impl EntityClass {
    pub const ALL: [EntityClass; 6] = [
        EntityClass::Hostile,
        EntityClass::Projectile,
        EntityClass::Player,
        EntityClass::Neutral,
        EntityClass::Passive,
        EntityClass::Item,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityClass::Hostile => "hostile",
            EntityClass::Projectile => "projectile",
            EntityClass::Player => "player",
            EntityClass::Neutral => "neutral",
            EntityClass::Passive => "passive",
            EntityClass::Item => "item",
        }
    }

    /// Stable wire code.
    pub fn code(self) -> u8 {
        match self {
            EntityClass::Hostile => 0,
            EntityClass::Projectile => 1,
            EntityClass::Player => 2,
            EntityClass::Neutral => 3,
            EntityClass::Passive => 4,
            EntityClass::Item => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        EntityClass::ALL.get(code as usize).copied()
    }
}

impl FromStr for EntityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityClass::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unrecognized class label `{s}`"))
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line of sight at observation time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Los {
    #[default]
    Visible,
    Occluded,
}

impl Los {
    pub fn code(self) -> u8 {
        match self {
            Los::Visible => 0,
            Los::Occluded => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Los::Visible),
            1 => Some(Los::Occluded),
            _ => None,
        }
    }
}

/// Quantized position. Never exact coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionBucket {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl PositionBucket {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    fn in_range(&self) -> bool {
        [self.x, self.y, self.z]
            .iter()
            .all(|c| c.unsigned_abs() <= POSITION_LIMIT as u32)
    }
}

/// Quantized distance band, validated to `0..=MAX_PROXIMITY`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ProximityBucket(u8);

impl ProximityBucket {
    pub fn new(band: u8) -> Option<Self> {
        (band <= MAX_PROXIMITY).then_some(Self(band))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ProximityBucket {
    type Error = String;

    fn try_from(band: u8) -> Result<Self, Self::Error> {
        ProximityBucket::new(band)
            .ok_or_else(|| format!("proximity bucket {band} exceeds {MAX_PROXIMITY}"))
    }
}

impl From<ProximityBucket> for u8 {
    fn from(p: ProximityBucket) -> u8 {
        p.0
    }
}

/// Opaque auxiliary metadata carried alongside evidence.
///
/// Ingest drops it when building `Observation`s, so nothing downstream of
/// validation can read it. It has no `PartialEq` or `Hash`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(pub serde_json::Map<String, serde_json::Value>);

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One raw evidence item as handed over by the perception layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub entity_id: String,
    pub class_label: String,
    pub position: PositionBucket,
    /// Raw band; validated against `MAX_PROXIMITY` at ingest.
    pub proximity: u8,
    #[serde(default)]
    pub los: Los,
    #[serde(default)]
    pub features: Features,
}

impl EvidenceItem {
    pub fn new(
        entity_id: impl Into<String>,
        class_label: impl Into<String>,
        position: PositionBucket,
        proximity: u8,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            class_label: class_label.into(),
            position,
            proximity,
            los: Los::Visible,
            features: Features::default(),
        }
    }

    pub fn with_los(mut self, los: Los) -> Self {
        self.los = los;
        self
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }
}

/// One tick's ordered observation batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvidenceBatch {
    pub tick: Tick,
    pub items: Vec<EvidenceItem>,
}

impl EvidenceBatch {
    pub fn new(tick: Tick) -> Self {
        Self {
            tick,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, item: EvidenceItem) {
        self.items.push(item);
    }

    pub fn with(mut self, item: EvidenceItem) -> Self {
        self.items.push(item);
        self
    }

    /// Validate every item and structure them into observations.
    ///
    /// Fails on the first malformed item; the caller's state is untouched.
    pub fn validate(&self) -> CapsuleResult<Vec<Observation>> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.items.len());
        let mut out = Vec::with_capacity(self.items.len());

        for (index, item) in self.items.iter().enumerate() {
            let malformed = |reason: String| CapsuleError::MalformedEvidence { index, reason };

            if item.entity_id.trim().is_empty() {
                return Err(malformed("missing entity_id".into()));
            }
            let class = item.class_label.parse::<EntityClass>().map_err(malformed)?;
            let proximity = ProximityBucket::try_from(item.proximity).map_err(malformed)?;
            if !item.position.in_range() {
                return Err(malformed(format!(
                    "position bucket {:?} outside +/-{POSITION_LIMIT}",
                    item.position
                )));
            }
            if !seen.insert(item.entity_id.as_str()) {
                return Err(CapsuleError::DuplicateEntity {
                    entity_id: item.entity_id.clone(),
                    tick: self.tick,
                });
            }

            out.push(Observation {
                entity_id: item.entity_id.clone(),
                class,
                position: item.position,
                proximity,
                los: item.los,
            });
        }

        Ok(out)
    }
}

/// Validated evidence. Carries no `features`, by construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Observation {
    pub entity_id: String,
    pub class: EntityClass,
    pub position: PositionBucket,
    pub proximity: ProximityBucket,
    pub los: Los,
}
