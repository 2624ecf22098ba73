//! Perception adapter: turn host detections into `EvidenceBatch`es.
//!
//! Quantization happens here so the capsule only ever sees buckets. The
//! adapter never interprets features; they ride along untouched.

use std::borrow::Cow;
use std::collections::BTreeMap;

use belief_capsule_core::{
    EntityClass, EvidenceBatch, EvidenceItem, Features, Los, PositionBucket, Tick, MAX_PROXIMITY,
    POSITION_LIMIT,
};

use crate::error::{SupervisorError, SupervisorResult};

/// One raw sighting from the host's perception layer.
#[derive(Clone, Debug)]
pub struct Detection<'a> {
    pub entity_id: Cow<'a, str>,
    /// Host label; may be a canonical class or an alias.
    pub class_label: Cow<'a, str>,
    /// World coordinates.
    pub world: [f64; 3],
    /// Distance from the observer.
    pub distance: f64,
    pub visible: bool,
    pub features: Features,
}

impl<'a> Detection<'a> {
    pub fn new(
        entity_id: impl Into<Cow<'a, str>>,
        class_label: impl Into<Cow<'a, str>>,
        world: [f64; 3],
        distance: f64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            class_label: class_label.into(),
            world,
            distance,
            visible: true,
            features: Features::default(),
        }
    }

    pub fn occluded(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn with_feature(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.features = self.features.with(key, value);
        self
    }
}

/// Floors world coordinates into cells and distances into proximity bands.
#[derive(Clone, Copy, Debug)]
pub struct BucketQuantizer {
    /// Edge length of one position cell.
    pub cell_size: f64,
    /// Width of one proximity band; band 7 is open-ended.
    pub band_width: f64,
}

impl Default for BucketQuantizer {
    fn default() -> Self {
        Self {
            cell_size: 4.0,
            band_width: 4.0,
        }
    }
}

impl BucketQuantizer {
    pub fn position(&self, world: [f64; 3]) -> SupervisorResult<PositionBucket> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(SupervisorError::Adapter(format!(
                "cell_size must be positive, got {}",
                self.cell_size
            )));
        }
        let mut cells = [0i32; 3];
        for (cell, &v) in cells.iter_mut().zip(world.iter()) {
            if !v.is_finite() {
                return Err(SupervisorError::Adapter(format!("non-finite coordinate {v}")));
            }
            let c = (v / self.cell_size).floor();
            if c.abs() > f64::from(POSITION_LIMIT) {
                return Err(SupervisorError::Adapter(format!(
                    "coordinate {v} outside representable range"
                )));
            }
            *cell = c as i32;
        }
        Ok(PositionBucket::new(cells[0], cells[1], cells[2]))
    }

    pub fn band(&self, distance: f64) -> SupervisorResult<u8> {
        if !(self.band_width.is_finite() && self.band_width > 0.0) {
            return Err(SupervisorError::Adapter(format!(
                "band_width must be positive, got {}",
                self.band_width
            )));
        }
        if !distance.is_finite() || distance < 0.0 {
            return Err(SupervisorError::Adapter(format!("invalid distance {distance}")));
        }
        let band = (distance / self.band_width).floor();
        Ok(if band >= f64::from(MAX_PROXIMITY) {
            MAX_PROXIMITY
        } else {
            band as u8
        })
    }
}

/// Map one detection into zero or more evidence items.
pub trait EvidenceBuilder {
    fn build(&self, detection: &Detection<'_>) -> SupervisorResult<Vec<EvidenceItem>>;
}

/// Quantizes and resolves label aliases (`"zombie"` -> hostile and so on).
/// Labels without an alias pass through; the capsule rejects unknown ones.
#[derive(Clone, Debug, Default)]
pub struct BasicEvidenceBuilder {
    pub quantizer: BucketQuantizer,
    pub aliases: BTreeMap<String, EntityClass>,
}

impl BasicEvidenceBuilder {
    pub fn with_alias(mut self, label: impl Into<String>, class: EntityClass) -> Self {
        self.aliases.insert(label.into(), class);
        self
    }
}

impl EvidenceBuilder for BasicEvidenceBuilder {
    fn build(&self, d: &Detection<'_>) -> SupervisorResult<Vec<EvidenceItem>> {
        let class_label = match self.aliases.get(d.class_label.as_ref()) {
            Some(class) => class.as_str().to_string(),
            None => d.class_label.to_string(),
        };
        let item = EvidenceItem::new(
            d.entity_id.to_string(),
            class_label,
            self.quantizer.position(d.world)?,
            self.quantizer.band(d.distance)?,
        )
        .with_los(if d.visible { Los::Visible } else { Los::Occluded })
        .with_features(d.features.clone());
        Ok(vec![item])
    }
}

/// Build one tick's batch, preserving detection order.
pub fn build_evidence_batch<B: EvidenceBuilder>(
    builder: &B,
    tick: Tick,
    detections: &[Detection<'_>],
) -> SupervisorResult<EvidenceBatch> {
    let mut batch = EvidenceBatch::new(tick);
    for d in detections {
        for item in builder.build(d)? {
            batch.push(item);
        }
    }
    Ok(batch)
}
