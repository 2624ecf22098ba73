//! FFI smoke tests.
//!
//! These call the exported `extern "C"` functions directly, as an external
//! consumer would, to validate:
//! - ABI surface compiles and links
//! - allocation/free symmetry for returned buffers
//! - error codes for misuse

use std::ptr;

use belief_capsule_core::codec;
use belief_capsule_ffi::*;

fn s(s: &str) -> BcapStr {
    BcapStr {
        ptr: s.as_ptr(),
        len: s.len(),
    }
}

fn ev(entity: &'static str, class: &'static str, x: i32, proximity: u8) -> BcapEvidence {
    BcapEvidence {
        entity_id: s(entity),
        class_label: s(class),
        x,
        y: 64,
        z: 0,
        proximity,
        occluded: 0,
    }
}

fn new_channel(cfg: BcapCfg) -> *mut BcapChannel {
    let mut rc = 1;
    let h = unsafe { bcap_channel_new(cfg, &mut rc) };
    assert_eq!(rc, BCAP_OK);
    assert!(!h.is_null());
    h
}

#[test]
fn ffi_version_and_default_cfg() {
    assert_eq!(bcap_ffi_version(), BCAP_FFI_VERSION);

    let cfg = bcap_cfg_default();
    assert_eq!(cfg.track_cap, 64);
    assert_eq!(cfg.mode, BCAP_MODE_CONSERVATIVE);
    assert_eq!(cfg.extensions, 0);
    assert!(cfg.uncertainty_threshold > 0.0 && cfg.uncertainty_threshold < 1.0);
}

#[test]
fn ffi_ingest_envelope_and_free() {
    let h = new_channel(bcap_cfg_default());
    let items = [ev("z1", "hostile", 0, 2), ev("c1", "passive", 4, 6)];

    let rc = unsafe { bcap_ingest_and_tick(h, 1, items.as_ptr(), items.len()) };
    assert_eq!(rc, BCAP_OK);
    assert_eq!(unsafe { bcap_size(h) }, 2);
    assert_eq!(unsafe { bcap_pending(h) }, 2);

    let mut env = BcapBytes {
        ptr: ptr::null_mut(),
        len: 0,
    };
    assert_eq!(unsafe { bcap_build_envelope(h, 1, &mut env) }, BCAP_OK);
    assert!(!env.ptr.is_null());
    let bytes = unsafe { std::slice::from_raw_parts(env.ptr, env.len) };
    assert_eq!(&bytes[..4], b"BCE1");
    assert_eq!(unsafe { bcap_pending(h) }, 0);

    unsafe { bcap_bytes_free(env) };
    unsafe { bcap_channel_free(h) };
}

#[test]
fn ffi_snapshot_decodes() {
    let h = new_channel(bcap_cfg_default());
    let items = [ev("z1", "hostile", 0, 2)];
    assert_eq!(unsafe { bcap_ingest_and_tick(h, 3, items.as_ptr(), 1) }, BCAP_OK);
    assert_eq!(unsafe { bcap_advance(h, 4) }, BCAP_OK);

    let mut snap = BcapBytes {
        ptr: ptr::null_mut(),
        len: 0,
    };
    assert_eq!(unsafe { bcap_snapshot(h, 3, &mut snap) }, BCAP_ERR_SNAPSHOT_TICK);
    assert!(snap.ptr.is_null());

    assert_eq!(unsafe { bcap_snapshot(h, 4, &mut snap) }, BCAP_OK);
    let bytes = unsafe { std::slice::from_raw_parts(snap.ptr, snap.len) };
    let decoded = codec::decode_snapshot(bytes).unwrap();
    assert_eq!(decoded.tick, 4);
    assert_eq!(decoded.tracks.len(), 1);
    assert_eq!(decoded.tracks[0].entity_id, "z1");

    unsafe { bcap_bytes_free(snap) };
    unsafe { bcap_channel_free(h) };
}

#[test]
fn ffi_error_codes() {
    let h = new_channel(bcap_cfg_default());

    let bad = [ev("x", "dragon", 0, 1)];
    assert_eq!(
        unsafe { bcap_ingest_and_tick(h, 1, bad.as_ptr(), 1) },
        BCAP_ERR_MALFORMED
    );
    let dup = [ev("x", "hostile", 0, 1), ev("x", "hostile", 1, 1)];
    assert_eq!(
        unsafe { bcap_ingest_and_tick(h, 1, dup.as_ptr(), 2) },
        BCAP_ERR_DUPLICATE
    );
    assert_eq!(unsafe { bcap_advance(h, 5) }, BCAP_OK);
    assert_eq!(unsafe { bcap_advance(h, 4) }, BCAP_ERR_TICK_REGRESSION);
    assert_eq!(
        unsafe { bcap_ingest_and_tick(h, 6, ptr::null(), 3) },
        BCAP_ERR_NULL
    );
    // An empty batch is a silent tick.
    assert_eq!(unsafe { bcap_ingest_and_tick(h, 6, ptr::null(), 0) }, BCAP_OK);

    let mut out = BcapBytes {
        ptr: ptr::null_mut(),
        len: 0,
    };
    assert_eq!(unsafe { bcap_build_envelope(h, 2, &mut out) }, BCAP_OK);
    unsafe { bcap_bytes_free(out) };
    let mut again = BcapBytes {
        ptr: ptr::null_mut(),
        len: 0,
    };
    assert_eq!(unsafe { bcap_build_envelope(h, 2, &mut again) }, BCAP_ERR_SEQUENCE);

    assert_eq!(unsafe { bcap_advance(ptr::null_mut(), 1) }, BCAP_ERR_NULL);
    assert_eq!(unsafe { bcap_size(ptr::null()) }, -1);
    unsafe { bcap_channel_free(h) };
}

#[test]
fn ffi_rejects_undeliverable_cfg() {
    let mut rc = 0;

    let mut cfg = bcap_cfg_default();
    cfg.track_cap = 0;
    assert!(unsafe { bcap_channel_new(cfg, &mut rc) }.is_null());
    assert_eq!(rc, BCAP_ERR_CONFIG);

    let mut cfg = bcap_cfg_default();
    cfg.mode = 9;
    assert!(unsafe { bcap_channel_new(cfg, &mut rc) }.is_null());
    assert_eq!(rc, BCAP_ERR_CONFIG);

    // All extensions: every standard capability is installed.
    let mut cfg = bcap_cfg_default();
    cfg.extensions = 0b111;
    cfg.mode = BCAP_MODE_PREDICTIVE;
    let h = new_channel(cfg);
    unsafe { bcap_channel_free(h) };
}
