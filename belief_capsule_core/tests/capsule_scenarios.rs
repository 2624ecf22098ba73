use belief_capsule_core::*;

fn item(entity: &str, class: &str, x: i32, prox: u8) -> EvidenceItem {
    EvidenceItem::new(entity, class, PositionBucket::new(x, 64, 0), prox)
}

fn step(capsule: &mut Capsule, batch: &EvidenceBatch) -> Vec<Delta> {
    let mut out = capsule.ingest(batch).expect("ingest");
    out.extend(capsule.tick(batch.tick).expect("tick"));
    out
}

fn count(deltas: &[Delta], pred: fn(&Delta) -> bool) -> usize {
    deltas.iter().filter(|d| pred(d)).count()
}

#[test]
fn single_entity_then_silence() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    let mut all = Vec::new();

    for t in 1..=2 {
        all.extend(step(&mut capsule, &EvidenceBatch::new(t).with(item("z1", "hostile", 3, 2))));
    }
    assert_eq!(count(&all, Delta::is_new_threat), 1);
    let id = capsule.track_for_entity("z1").unwrap().track_id;

    let mut prev_p = 0.0;
    let mut prev_risk = capsule.track(id).unwrap().risk_level;
    let mut evicted_at = None;
    for t in 3..=22 {
        let deltas = capsule.tick(t).unwrap();
        if deltas.iter().any(|d| d.is_evicted()) {
            evicted_at = Some(t);
        }
        all.extend(deltas);
        let Some(track) = capsule.track(id) else { continue };
        assert!(track.p_unknown >= prev_p, "p_unknown fell at tick {t}");
        assert!(track.risk_level <= prev_risk, "risk rose at tick {t}");
        assert!(track.assessed_risk <= prev_risk);
        prev_p = track.p_unknown;
        prev_risk = track.risk_level;
    }

    assert_eq!(count(&all, Delta::is_new_threat), 1);
    // 0.85^19 is the first power under 0.05.
    assert_eq!(evicted_at, Some(21));
    assert_eq!(capsule.size(), 0);
}

#[test]
fn batch_larger_than_cap_is_bounded() {
    let cfg = CapsuleCfg {
        track_cap: 50,
        ..CapsuleCfg::default()
    };
    let mut capsule = Capsule::new(cfg).unwrap();
    let mut batch = EvidenceBatch::new(1);
    for i in 0..70 {
        batch.push(item(&format!("e{i}"), "neutral", i, 5));
    }
    let deltas = step(&mut capsule, &batch);

    assert_eq!(capsule.size(), 50);
    assert_eq!(count(&deltas, Delta::is_new_threat), 50);
    assert_eq!(capsule.stats().refused, 20);
    // First 50 in batch order are the ones admitted.
    assert!(capsule.track_for_entity("e49").is_some());
    assert!(capsule.track_for_entity("e50").is_none());
}

#[test]
fn capacity_pressure_reclaims_least_certain() {
    let cfg = CapsuleCfg {
        track_cap: 2,
        ..CapsuleCfg::default()
    };
    let mut capsule = Capsule::new(cfg).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("old", "passive", 0, 7)));
    step(&mut capsule, &EvidenceBatch::new(3).with(item("mid", "passive", 1, 7)));
    // At tick 4 "old" is the less certain of the two.
    let deltas = step(&mut capsule, &EvidenceBatch::new(4).with(item("new", "passive", 2, 7)));

    let evicted: Vec<_> = deltas
        .iter()
        .filter_map(|d| match d {
            Delta::Evicted { reason, track, .. } => Some((*reason, track.entity_id.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(evicted, vec![(EvictionReason::CapacityPressure, "old".to_string())]);
    assert_eq!(capsule.size(), 2);
    assert!(capsule.track_for_entity("mid").is_some());
    assert!(capsule.track_for_entity("new").is_some());
}

#[test]
fn steady_input_is_quiet_after_warmup() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    let batch = |t| EvidenceBatch::new(t).with(item("cow", "passive", 5, 1));

    for t in 1..=2 {
        step(&mut capsule, &batch(t));
    }
    let mut after = Vec::new();
    for t in 3..=22 {
        after.extend(step(&mut capsule, &batch(t)));
    }
    assert!(after.len() as u32 <= capsule.cfg().sparsity_budget);
    assert!(after.is_empty());
    assert_eq!(capsule.stats().sparsity_violations, 0);
}

#[test]
fn oscillating_proximity_respects_hysteresis_budget() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("sk", "hostile", 0, 3)));

    let mut reclassified = 0;
    for t in 2..=21 {
        let prox = if t % 2 == 0 { 4 } else { 3 };
        let deltas = step(&mut capsule, &EvidenceBatch::new(t).with(item("sk", "hostile", 0, prox)));
        reclassified += count(&deltas, Delta::is_reclassified);
    }
    assert!(reclassified <= 4, "got {reclassified}");
    assert!(reclassified as u32 <= capsule.cfg().hysteresis_budget);
    assert!(capsule.stats().held_reclassifications > 0);
}

#[test]
fn hysteresis_bound_holds_over_long_runs() {
    let cfg = CapsuleCfg::default();
    let budget = cfg.hysteresis_budget as usize;
    let last = 10 * cfg.hysteresis_settle_ticks;
    let mut capsule = Capsule::new(cfg).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("sk", "hostile", 0, 3)));

    let mut reclassified = 0;
    for t in 2..=last {
        let prox = if t % 2 == 0 { 4 } else { 3 };
        let deltas = step(&mut capsule, &EvidenceBatch::new(t).with(item("sk", "hostile", 0, prox)));
        reclassified += count(&deltas, Delta::is_reclassified);
    }
    assert!(reclassified <= budget, "{reclassified} reclassifications over {last} ticks");
}

#[test]
fn sustained_change_goes_out_once_settled() {
    let cfg = CapsuleCfg::default();
    let settle = cfg.hysteresis_settle_ticks;
    let mut capsule = Capsule::new(cfg).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("sk", "hostile", 0, 3)));
    // Emissions at 2, 7, 12 and 17 spend the budget and end on High.
    for t in 2..=40 {
        let prox = if t % 2 == 0 { 4 } else { 3 };
        step(&mut capsule, &EvidenceBatch::new(t).with(item("sk", "hostile", 0, prox)));
    }
    assert_eq!(capsule.track_for_entity("sk").unwrap().risk_level, RiskLevel::High);

    let mut late = Vec::new();
    for t in 41..=40 + settle + 5 {
        for d in step(&mut capsule, &EvidenceBatch::new(t).with(item("sk", "hostile", 0, 4))) {
            if d.is_reclassified() {
                late.push(d);
            }
        }
    }
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].tick(), 40 + settle);
    assert_eq!(capsule.track_for_entity("sk").unwrap().risk_level, RiskLevel::Moderate);
}

#[test]
fn extreme_settle_period_does_not_overflow() {
    let cfg =
        CapsuleCfg::from_json(r#"{"hysteresis_settle_ticks": 18446744073709551615}"#).unwrap();
    assert_eq!(cfg.hysteresis_settle_ticks, u64::MAX);
    let mut capsule = Capsule::new(cfg).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("sk", "hostile", 0, 3)));

    let mut reclassified = 0;
    for t in 2..=200 {
        let prox = if t % 2 == 0 { 4 } else { 3 };
        let deltas = step(&mut capsule, &EvidenceBatch::new(t).with(item("sk", "hostile", 0, prox)));
        reclassified += count(&deltas, Delta::is_reclassified);
    }
    assert!(reclassified <= 4, "got {reclassified}");
}

#[test]
fn aging_deltas_count_against_sparsity_budget() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    capsule
        .step(
            &EvidenceBatch::new(1)
                .with(item("a", "hostile", 0, 3))
                .with(item("b", "hostile", 5, 2)),
        )
        .unwrap();

    // "a" repeats identically while "b" ages out.
    let mut emitted = 0;
    for t in 2..=25 {
        emitted += capsule
            .step(&EvidenceBatch::new(t).with(item("a", "hostile", 0, 3)))
            .unwrap()
            .len();
    }
    assert!(emitted > 0);
    assert!(capsule.track_for_entity("b").is_none());
    assert_eq!(capsule.stats().sparsity_violations, 1);
}

#[test]
fn occluded_track_keeps_identity() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    for t in 1..=2 {
        step(&mut capsule, &EvidenceBatch::new(t).with(item("sp", "hostile", 9, 3)));
    }
    let id = capsule.track_for_entity("sp").unwrap().track_id;

    for t in 3..=7 {
        capsule.tick(t).unwrap();
    }
    assert_eq!(capsule.track(id).unwrap().phase, TrackPhase::Aging);

    let deltas = step(&mut capsule, &EvidenceBatch::new(8).with(item("sp", "hostile", 9, 3)));
    assert_eq!(count(&deltas, Delta::is_new_threat), 0);
    let track = capsule.track_for_entity("sp").unwrap();
    assert_eq!(track.track_id, id);
    assert_eq!(track.phase, TrackPhase::Active);
    assert_eq!(track.p_unknown, 0.0);
    assert_eq!(track.last_seen_tick, 8);
}

#[test]
fn occluded_evidence_counts_as_observation() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("sp", "hostile", 9, 3)));
    let occluded = item("sp", "hostile", 9, 3).with_los(Los::Occluded);
    for t in 2..=6 {
        step(&mut capsule, &EvidenceBatch::new(t).with(occluded.clone()));
    }
    let track = capsule.track_for_entity("sp").unwrap();
    assert_eq!(track.los, Los::Occluded);
    assert_eq!(track.p_unknown, 0.0);
}

#[test]
fn churned_entity_id_recovers_track_under_id_robustness() {
    let cfg = CapsuleCfg::default().with_extension(Extension::IdRobustness);
    let mut capsule = Capsule::new(cfg).unwrap();
    for t in 1..=2 {
        step(&mut capsule, &EvidenceBatch::new(t).with(item("uuid-a", "hostile", 4, 2)));
    }
    let id = capsule.track_for_entity("uuid-a").unwrap().track_id;
    for t in 3..=7 {
        capsule.tick(t).unwrap();
    }

    let deltas = step(&mut capsule, &EvidenceBatch::new(8).with(item("uuid-b", "hostile", 4, 2)));
    assert_eq!(count(&deltas, Delta::is_new_threat), 0);
    assert!(matches!(
        &deltas[0],
        Delta::Reassociated { track_id, previous_entity, entity, .. }
            if *track_id == id && previous_entity == "uuid-a" && entity == "uuid-b"
    ));
    assert_eq!(capsule.track_for_entity("uuid-b").unwrap().track_id, id);
    assert!(capsule.track_for_entity("uuid-a").is_none());
    assert_eq!(capsule.size(), 1);
}

#[test]
fn churned_entity_id_without_extension_creates_new_track() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("uuid-a", "hostile", 4, 2)));
    capsule.tick(2).unwrap();
    let deltas = step(&mut capsule, &EvidenceBatch::new(3).with(item("uuid-b", "hostile", 4, 2)));
    assert_eq!(count(&deltas, Delta::is_new_threat), 1);
    assert_eq!(capsule.size(), 2);
}

#[test]
fn recovery_respects_horizon() {
    let cfg = CapsuleCfg {
        id_recovery_horizon_ticks: 3,
        ..CapsuleCfg::default()
    }
    .with_extension(Extension::IdRobustness);
    let mut capsule = Capsule::new(cfg).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("a", "player", 0, 4)));
    capsule.tick(5).unwrap();
    let deltas = step(&mut capsule, &EvidenceBatch::new(5).with(item("b", "player", 0, 4)));
    assert_eq!(count(&deltas, Delta::is_new_threat), 1);
}

#[test]
fn features_never_affect_identity() {
    let plain = EvidenceBatch::new(1).with(item("x", "projectile", 2, 1));
    let decorated = EvidenceBatch::new(1).with(
        item("x", "projectile", 2, 1)
            .with_features(Features::new().with("texture", "arrow_lit").with("nbt", 42)),
    );

    let mut a = Capsule::new(CapsuleCfg::default()).unwrap();
    let mut b = Capsule::new(CapsuleCfg::default()).unwrap();
    let da = step(&mut a, &plain);
    let db = step(&mut b, &decorated);
    assert_eq!(da, db);
    assert_eq!(
        a.snapshot().to_canonical_bytes(),
        b.snapshot().to_canonical_bytes()
    );

    // Same entity, new features: still the same track, and no deltas.
    let again = EvidenceBatch::new(2).with(
        item("x", "projectile", 2, 1).with_features(Features::new().with("texture", "other")),
    );
    step(&mut a, &EvidenceBatch::new(2).with(item("x", "projectile", 2, 1)));
    assert!(step(&mut b, &again).is_empty());
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn every_new_threat_carries_its_track() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    let mut batch = EvidenceBatch::new(1);
    for i in 0..5 {
        batch.push(item(&format!("m{i}"), "hostile", i, (i % 8) as u8));
    }
    for d in step(&mut capsule, &batch) {
        if let Delta::NewThreat { track_id, track, tick } = &d {
            assert_eq!(track.track_id, *track_id);
            assert_eq!(track.created_tick, *tick);
        }
        d.validate().unwrap();
    }
}

#[test]
fn track_ids_are_never_reused() {
    let cfg = CapsuleCfg {
        track_cap: 1,
        ..CapsuleCfg::default()
    };
    let mut capsule = Capsule::new(cfg).unwrap();
    let mut seen = Vec::new();
    for t in 1..=6 {
        let deltas = step(&mut capsule, &EvidenceBatch::new(t).with(item(&format!("e{t}"), "item", 0, 0)));
        for d in deltas {
            if let Delta::NewThreat { track_id, .. } = d {
                assert!(!seen.contains(&track_id));
                seen.push(track_id);
            }
        }
        assert!(capsule.size() <= 1);
    }
    // Re-sighting an evicted entity yields a fresh id.
    let deltas = step(&mut capsule, &EvidenceBatch::new(7).with(item("e1", "item", 0, 0)));
    let fresh = deltas.iter().find(|d| d.is_new_threat()).unwrap().track_id();
    assert!(!seen.contains(&fresh));
}

#[test]
fn malformed_batches_fail_without_side_effects() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    step(&mut capsule, &EvidenceBatch::new(1).with(item("ok", "hostile", 0, 2)));
    let before = capsule.snapshot();

    let cases = vec![
        item("", "hostile", 0, 2),
        item("a", "dragon", 0, 2),
        item("a", "hostile", 0, MAX_PROXIMITY + 1),
        EvidenceItem::new("a", "hostile", PositionBucket::new(POSITION_LIMIT + 1, 0, 0), 2),
    ];
    for bad in cases {
        let batch = EvidenceBatch::new(2).with(item("new", "player", 1, 1)).with(bad);
        let err = capsule.ingest(&batch).unwrap_err();
        assert!(
            matches!(err, CapsuleError::MalformedEvidence { index: 1, .. }),
            "{err}"
        );
    }

    let dup = EvidenceBatch::new(2)
        .with(item("twin", "player", 1, 1))
        .with(item("twin", "player", 2, 1));
    assert!(matches!(
        capsule.ingest(&dup),
        Err(CapsuleError::DuplicateEntity { .. })
    ));

    assert_eq!(capsule.snapshot(), before);
    assert_eq!(capsule.current_tick(), 1);
}

#[test]
fn tick_order_is_enforced() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    step(&mut capsule, &EvidenceBatch::new(5).with(item("a", "hostile", 0, 2)));
    assert_eq!(
        capsule.tick(4).unwrap_err(),
        CapsuleError::TickRegression {
            received: 4,
            current: 5
        }
    );
    assert!(capsule.ingest(&EvidenceBatch::new(3)).is_err());
    // Repeating the current tick is fine and ages nothing twice.
    assert!(capsule.tick(5).unwrap().is_empty());
}

#[test]
fn snapshot_only_answers_current_tick() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    step(&mut capsule, &EvidenceBatch::new(3).with(item("a", "hostile", 0, 2)));
    assert_eq!(capsule.get_snapshot(3).unwrap().tracks.len(), 1);
    assert!(matches!(
        capsule.get_snapshot(2),
        Err(CapsuleError::SnapshotTick { requested: 2, current: 3 })
    ));
}

#[test]
fn snapshot_order_is_canonical() {
    let mut capsule = Capsule::new(CapsuleCfg::default()).unwrap();
    let mut batch = EvidenceBatch::new(1);
    for name in ["zeta", "alpha", "mu", "beta"] {
        batch.push(item(name, "neutral", 0, 3));
    }
    step(&mut capsule, &batch);
    let snap = capsule.get_snapshot(1).unwrap();
    let ids: Vec<u64> = snap.tracks.iter().map(|t| t.track_id.0).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(snap.tracks[0].entity_id, "zeta");
}
