//! Canonical binary encoding.
//!
//! Every field is written in schema order, little-endian, with `f64` as raw
//! IEEE bits, so two implementations that agree on state agree on bytes.
//! Nothing here depends on map iteration or insertion order.
//!
//! Snapshot:  `[u32 magic "BCS1"][u32 version][u64 tick][u32 count] track*`
//! Envelope:  `[u32 magic "BCE1"][u32 version][u64 sequence][u64 tick]
//!             [u32 deferred][u32 count] delta* [u8 has_snapshot] snapshot?`

use crate::delta::Delta;
use crate::envelope::Envelope;
use crate::error::{CapsuleError, CapsuleResult};
use crate::evidence::{EntityClass, Los, PositionBucket, ProximityBucket};
use crate::hysteresis::HysteresisState;
use crate::risk::{RiskComponents, RiskLevel};
use crate::snapshot::Snapshot;
use crate::track::{Track, TrackId, TrackPhase};

pub const SNAPSHOT_MAGIC: u32 = 0x3153_4342; // "BCS1" little-endian
pub const ENVELOPE_MAGIC: u32 = 0x3145_4342; // "BCE1" little-endian
pub const CODEC_VERSION: u32 = 1;

const DELTA_NEW_THREAT: u8 = 0;
const DELTA_RECLASSIFIED: u8 = 1;
const DELTA_EVICTED: u8 = 2;
const DELTA_REASSOCIATED: u8 = 3;

/// Deterministic FNV-1a hash (stable across runs and platforms).
#[derive(Clone, Copy, Debug)]
pub struct Fnv1a(u64);

impl Fnv1a {
    pub fn new() -> Self {
        Fnv1a(0xcbf2_9ce4_8422_2325)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a over a byte string.
pub fn digest(bytes: &[u8]) -> u64 {
    let mut h = Fnv1a::new();
    h.write(bytes);
    h.finish()
}

pub fn encode_snapshot(snap: &Snapshot) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24 + snap.tracks.len() * 96);
    write_snapshot(&mut buf, snap);
    buf
}

pub fn encode_deltas(deltas: &[Delta]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + deltas.len() * 32);
    put_u32(&mut buf, deltas.len() as u32);
    for d in deltas {
        write_delta(&mut buf, d);
    }
    buf
}

pub fn encode_envelope(env: &Envelope) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, ENVELOPE_MAGIC);
    put_u32(&mut buf, CODEC_VERSION);
    put_u64(&mut buf, env.sequence);
    put_u64(&mut buf, env.tick);
    put_u32(&mut buf, env.deferred as u32);
    put_u32(&mut buf, env.saliency_events.len() as u32);
    for d in &env.saliency_events {
        write_delta(&mut buf, d);
    }
    match &env.snapshot {
        Some(s) => {
            buf.push(1);
            write_snapshot(&mut buf, s);
        }
        None => buf.push(0),
    }
    buf
}

/// Decode a snapshot produced by `encode_snapshot` (consumer resync path).
pub fn decode_snapshot(bytes: &[u8]) -> CapsuleResult<Snapshot> {
    let mut r = Reader { data: bytes, pos: 0 };
    let snap = r.snapshot()?;
    if r.pos != bytes.len() {
        return Err(CapsuleError::Codec(format!(
            "{} trailing bytes after snapshot",
            bytes.len() - r.pos
        )));
    }
    Ok(snap)
}

fn write_snapshot(buf: &mut Vec<u8>, snap: &Snapshot) {
    put_u32(buf, SNAPSHOT_MAGIC);
    put_u32(buf, CODEC_VERSION);
    put_u64(buf, snap.tick);
    put_u32(buf, snap.tracks.len() as u32);
    for t in &snap.tracks {
        write_track(buf, t);
    }
}

fn write_delta(buf: &mut Vec<u8>, d: &Delta) {
    match d {
        Delta::NewThreat { tick, track_id, track } => {
            buf.push(DELTA_NEW_THREAT);
            put_u64(buf, *tick);
            put_u64(buf, track_id.0);
            write_track(buf, track);
        }
        Delta::Reclassified { tick, track_id, from, to } => {
            buf.push(DELTA_RECLASSIFIED);
            put_u64(buf, *tick);
            put_u64(buf, track_id.0);
            buf.push(from.ordinal());
            buf.push(to.ordinal());
        }
        Delta::Evicted { tick, track_id, reason, track } => {
            buf.push(DELTA_EVICTED);
            put_u64(buf, *tick);
            put_u64(buf, track_id.0);
            buf.push(reason.code());
            write_track(buf, track);
        }
        Delta::Reassociated { tick, track_id, previous_entity, entity } => {
            buf.push(DELTA_REASSOCIATED);
            put_u64(buf, *tick);
            put_u64(buf, track_id.0);
            put_str(buf, previous_entity);
            put_str(buf, entity);
        }
    }
}

fn write_track(buf: &mut Vec<u8>, t: &Track) {
    put_u64(buf, t.track_id.0);
    put_str(buf, &t.entity_id);
    buf.push(t.class.code());
    put_i32(buf, t.position.x);
    put_i32(buf, t.position.y);
    put_i32(buf, t.position.z);
    buf.push(t.proximity.get());
    buf.push(t.los.code());
    put_u64(buf, t.p_unknown.to_bits());
    buf.push(t.risk_level.ordinal());
    buf.push(t.assessed_risk.ordinal());
    buf.push(t.observed_risk.ordinal());
    match &t.components {
        Some(c) => {
            buf.push(1);
            buf.push(c.classification_risk.ordinal());
            buf.push(c.presence_risk.ordinal());
            buf.push(c.risk_level.ordinal());
        }
        None => buf.push(0),
    }
    buf.push(t.phase.code());
    put_u64(buf, t.created_tick);
    put_u64(buf, t.last_seen_tick);
    put_u64(buf, t.aged_through_tick);
    put_u64(buf, t.hysteresis.cooldown_until);
    put_u32(buf, t.hysteresis.spent);
    put_u64(buf, t.hysteresis.last_flip);
}

#[inline]
fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> CapsuleResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                CapsuleError::Codec(format!("truncated input at byte {} (wanted {n})", self.pos))
            })?;
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> CapsuleResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> CapsuleResult<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> CapsuleResult<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn i32(&mut self) -> CapsuleResult<i32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(b))
    }

    fn string(&mut self) -> CapsuleResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| CapsuleError::Codec(format!("invalid utf-8 entity id: {e}")))
    }

    fn risk(&mut self) -> CapsuleResult<RiskLevel> {
        let v = self.u8()?;
        RiskLevel::from_ordinal(v).ok_or_else(|| bad("risk level", v))
    }

    fn snapshot(&mut self) -> CapsuleResult<Snapshot> {
        let magic = self.u32()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(CapsuleError::Codec(format!("bad snapshot magic {magic:#010x}")));
        }
        let version = self.u32()?;
        if version != CODEC_VERSION {
            return Err(CapsuleError::Codec(format!("unsupported version {version}")));
        }
        let tick = self.u64()?;
        let count = self.u32()? as usize;
        // Cap the preallocation by what the input could possibly hold.
        let mut tracks = Vec::with_capacity(count.min(self.data.len() / 64));
        for _ in 0..count {
            tracks.push(self.track()?);
        }
        Ok(Snapshot { tick, tracks })
    }

    fn track(&mut self) -> CapsuleResult<Track> {
        let track_id = TrackId(self.u64()?);
        let entity_id = self.string()?;
        let class_code = self.u8()?;
        let class = EntityClass::from_code(class_code).ok_or_else(|| bad("class", class_code))?;
        let position = PositionBucket::new(self.i32()?, self.i32()?, self.i32()?);
        let band = self.u8()?;
        let proximity = ProximityBucket::new(band).ok_or_else(|| bad("proximity", band))?;
        let los_code = self.u8()?;
        let los = Los::from_code(los_code).ok_or_else(|| bad("los", los_code))?;
        let p_unknown = f64::from_bits(self.u64()?);
        let risk_level = self.risk()?;
        let assessed_risk = self.risk()?;
        let observed_risk = self.risk()?;
        let components = match self.u8()? {
            0 => None,
            1 => Some(RiskComponents {
                classification_risk: self.risk()?,
                presence_risk: self.risk()?,
                risk_level: self.risk()?,
            }),
            v => return Err(bad("components flag", v)),
        };
        let phase_code = self.u8()?;
        let phase = TrackPhase::from_code(phase_code).ok_or_else(|| bad("phase", phase_code))?;
        let created_tick = self.u64()?;
        let last_seen_tick = self.u64()?;
        let aged_through_tick = self.u64()?;
        let hysteresis = HysteresisState {
            cooldown_until: self.u64()?,
            spent: self.u32()?,
            last_flip: self.u64()?,
        };
        Ok(Track {
            track_id,
            entity_id,
            class,
            position,
            proximity,
            los,
            p_unknown,
            risk_level,
            assessed_risk,
            observed_risk,
            components,
            phase,
            created_tick,
            last_seen_tick,
            aged_through_tick,
            hysteresis,
        })
    }
}

fn bad(what: &str, v: u8) -> CapsuleError {
    CapsuleError::Codec(format!("invalid {what} code {v}"))
}
