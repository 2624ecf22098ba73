#![allow(clippy::missing_safety_doc)]

use std::ptr;

use tracing::debug;

use belief_capsule_core::{
    CapsuleCfg, CapsuleError, EmissionChannel, EvidenceBatch, EvidenceItem, Extension, Los, Mode,
    PositionBucket,
};

/// FFI ABI version for belief_capsule_ffi.
///
/// Bump this when any `#[repr(C)]` struct layout or exported function signature changes.
pub const BCAP_FFI_VERSION: u32 = 1;

pub const BCAP_OK: i32 = 0;
pub const BCAP_ERR_NULL: i32 = -1;
pub const BCAP_ERR_UTF8: i32 = -2;
pub const BCAP_ERR_CONFIG: i32 = -10;
pub const BCAP_ERR_MALFORMED: i32 = -11;
pub const BCAP_ERR_DUPLICATE: i32 = -12;
pub const BCAP_ERR_TICK_REGRESSION: i32 = -13;
pub const BCAP_ERR_SNAPSHOT_TICK: i32 = -14;
pub const BCAP_ERR_MISSING_CAPABILITY: i32 = -15;
pub const BCAP_ERR_RISK_CONTRACT: i32 = -16;
pub const BCAP_ERR_PRODUCER: i32 = -17;
pub const BCAP_ERR_SEQUENCE: i32 = -18;
pub const BCAP_ERR_CODEC: i32 = -19;

pub const BCAP_MODE_CONSERVATIVE: u8 = 0;
pub const BCAP_MODE_PREDICTIVE: u8 = 1;

#[no_mangle]
pub extern "C" fn bcap_ffi_version() -> u32 {
    BCAP_FFI_VERSION
}

/// Opaque handle exposed over FFI.
pub struct BcapChannel {
    inner: EmissionChannel,
}

/// FFI string view (UTF-8 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BcapStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl BcapStr {
    unsafe fn to_str<'a>(self) -> Option<&'a str> {
        if self.ptr.is_null() {
            return None;
        }
        let bytes = std::slice::from_raw_parts(self.ptr, self.len);
        std::str::from_utf8(bytes).ok()
    }
}

/// One evidence item. Features never cross the ABI.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BcapEvidence {
    pub entity_id: BcapStr,
    /// Canonical class label ("hostile", "projectile", ...).
    pub class_label: BcapStr,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub proximity: u8,
    /// Non-zero means line of sight is occluded.
    pub occluded: u8,
}

/// Owned byte buffer; release with `bcap_bytes_free`.
#[repr(C)]
pub struct BcapBytes {
    pub ptr: *mut u8,
    pub len: usize,
}

impl BcapBytes {
    fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
        }
    }

    fn from_vec(buf: Vec<u8>) -> Self {
        let mut boxed = buf.into_boxed_slice();
        let ptr = boxed.as_mut_ptr();
        let len = boxed.len();
        std::mem::forget(boxed);
        Self { ptr, len }
    }
}

/// Channel cfg for FFI. Tuning constants keep their defaults.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BcapCfg {
    pub track_cap: u32,
    pub sparsity_budget: u32,
    pub uncertainty_threshold: f64,
    /// `BCAP_MODE_CONSERVATIVE` or `BCAP_MODE_PREDICTIVE`.
    pub mode: u8,
    pub hysteresis_budget: u32,
    /// Bit 0: risk_components_v1, bit 1: id_robustness, bit 2: predictive_model.
    pub extensions: u32,
    pub delta_cap: u32,
    pub snapshot_interval_ticks: u32,
}

#[no_mangle]
pub extern "C" fn bcap_cfg_default() -> BcapCfg {
    let d = CapsuleCfg::default();
    BcapCfg {
        track_cap: d.track_cap as u32,
        sparsity_budget: d.sparsity_budget,
        uncertainty_threshold: d.uncertainty_threshold,
        mode: match d.mode {
            Mode::Conservative => BCAP_MODE_CONSERVATIVE,
            Mode::Predictive => BCAP_MODE_PREDICTIVE,
        },
        hysteresis_budget: d.hysteresis_budget,
        extensions: d.declared_extensions.iter().fold(0, |bits, e| bits | e.bit()),
        delta_cap: d.delta_cap as u32,
        snapshot_interval_ticks: d.snapshot_interval_ticks,
    }
}

fn cfg_from_ffi(c: BcapCfg) -> Result<CapsuleCfg, i32> {
    let mode = match c.mode {
        BCAP_MODE_CONSERVATIVE => Mode::Conservative,
        BCAP_MODE_PREDICTIVE => Mode::Predictive,
        _ => return Err(BCAP_ERR_CONFIG),
    };
    Ok(CapsuleCfg {
        track_cap: c.track_cap as usize,
        sparsity_budget: c.sparsity_budget,
        uncertainty_threshold: c.uncertainty_threshold,
        mode,
        hysteresis_budget: c.hysteresis_budget,
        declared_extensions: Extension::set_from_bits(c.extensions),
        delta_cap: c.delta_cap as usize,
        snapshot_interval_ticks: c.snapshot_interval_ticks,
        ..CapsuleCfg::default()
    })
}

fn error_code(err: &CapsuleError) -> i32 {
    let rc = match err {
        CapsuleError::Config(_) => BCAP_ERR_CONFIG,
        CapsuleError::MalformedEvidence { .. } => BCAP_ERR_MALFORMED,
        CapsuleError::DuplicateEntity { .. } => BCAP_ERR_DUPLICATE,
        CapsuleError::TickRegression { .. } => BCAP_ERR_TICK_REGRESSION,
        CapsuleError::SnapshotTick { .. } => BCAP_ERR_SNAPSHOT_TICK,
        CapsuleError::MissingCapability { .. } | CapsuleError::MissingExtrapolator => {
            BCAP_ERR_MISSING_CAPABILITY
        }
        CapsuleError::RiskContract { .. } => BCAP_ERR_RISK_CONTRACT,
        CapsuleError::ProducerObligation(_) => BCAP_ERR_PRODUCER,
        CapsuleError::SequenceRegression { .. } => BCAP_ERR_SEQUENCE,
        CapsuleError::Codec(_) => BCAP_ERR_CODEC,
    };
    debug!(rc, error = %err, "bcap call failed");
    rc
}

unsafe fn set_rc(out: *mut i32, rc: i32) {
    if !out.is_null() {
        *out = rc;
    }
}

/// Create a channel. Returns null on failure and writes the reason to
/// `out_rc` when it is non-null.
#[no_mangle]
pub unsafe extern "C" fn bcap_channel_new(cfg: BcapCfg, out_rc: *mut i32) -> *mut BcapChannel {
    let cfg = match cfg_from_ffi(cfg) {
        Ok(c) => c,
        Err(rc) => {
            set_rc(out_rc, rc);
            return ptr::null_mut();
        }
    };
    match EmissionChannel::new(cfg) {
        Ok(inner) => {
            set_rc(out_rc, BCAP_OK);
            Box::into_raw(Box::new(BcapChannel { inner }))
        }
        Err(e) => {
            set_rc(out_rc, error_code(&e));
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn bcap_channel_free(h: *mut BcapChannel) {
    if !h.is_null() {
        drop(Box::from_raw(h));
    }
}

/// Ingest one tick's evidence, then advance to `tick`. Deltas are queued
/// for `bcap_build_envelope`. `items_ptr` may be null when `items_len` is 0.
#[no_mangle]
pub unsafe extern "C" fn bcap_ingest_and_tick(
    h: *mut BcapChannel,
    tick: u64,
    items_ptr: *const BcapEvidence,
    items_len: usize,
) -> i32 {
    if h.is_null() || (items_ptr.is_null() && items_len > 0) {
        return BCAP_ERR_NULL;
    }
    let handle = &mut *h;
    let items: &[BcapEvidence] = if items_len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(items_ptr, items_len)
    };

    let mut batch = EvidenceBatch::new(tick);
    for e in items {
        let (Some(entity_id), Some(class_label)) = (e.entity_id.to_str(), e.class_label.to_str())
        else {
            return BCAP_ERR_UTF8;
        };
        let item = EvidenceItem::new(
            entity_id,
            class_label,
            PositionBucket::new(e.x, e.y, e.z),
            e.proximity,
        )
        .with_los(if e.occluded != 0 { Los::Occluded } else { Los::Visible });
        batch.push(item);
    }

    match handle.inner.ingest_and_tick(&batch) {
        Ok(()) => BCAP_OK,
        Err(e) => error_code(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn bcap_advance(h: *mut BcapChannel, tick: u64) -> i32 {
    if h.is_null() {
        return BCAP_ERR_NULL;
    }
    match (*h).inner.advance(tick) {
        Ok(()) => BCAP_OK,
        Err(e) => error_code(&e),
    }
}

/// Live track count, or -1 for a null handle.
#[no_mangle]
pub unsafe extern "C" fn bcap_size(h: *const BcapChannel) -> i64 {
    if h.is_null() {
        return -1;
    }
    (*h).inner.capsule().size() as i64
}

/// Deltas still waiting for an envelope, or -1 for a null handle.
#[no_mangle]
pub unsafe extern "C" fn bcap_pending(h: *const BcapChannel) -> i64 {
    if h.is_null() {
        return -1;
    }
    (*h).inner.pending() as i64
}

#[no_mangle]
pub unsafe extern "C" fn bcap_request_snapshot(h: *mut BcapChannel) -> i32 {
    if h.is_null() {
        return BCAP_ERR_NULL;
    }
    (*h).inner.request_snapshot();
    BCAP_OK
}

/// Build envelope `sequence` into `out` as canonical bytes ("BCE1").
#[no_mangle]
pub unsafe extern "C" fn bcap_build_envelope(
    h: *mut BcapChannel,
    sequence: u64,
    out: *mut BcapBytes,
) -> i32 {
    if h.is_null() || out.is_null() {
        return BCAP_ERR_NULL;
    }
    *out = BcapBytes::empty();
    match (*h).inner.build_envelope(sequence) {
        Ok(env) => {
            *out = BcapBytes::from_vec(env.to_canonical_bytes());
            BCAP_OK
        }
        Err(e) => error_code(&e),
    }
}

/// Snapshot at `tick` into `out` as canonical bytes ("BCS1"). Only the
/// current tick is answerable.
#[no_mangle]
pub unsafe extern "C" fn bcap_snapshot(h: *const BcapChannel, tick: u64, out: *mut BcapBytes) -> i32 {
    if h.is_null() || out.is_null() {
        return BCAP_ERR_NULL;
    }
    *out = BcapBytes::empty();
    match (*h).inner.capsule().get_snapshot(tick) {
        Ok(snap) => {
            *out = BcapBytes::from_vec(snap.to_canonical_bytes());
            BCAP_OK
        }
        Err(e) => error_code(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn bcap_bytes_free(b: BcapBytes) {
    if !b.ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(b.ptr, b.len);
        drop(Box::from_raw(slice_ptr));
    }
}
