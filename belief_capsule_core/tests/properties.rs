use std::collections::BTreeMap;

use belief_capsule_core::*;
use proptest::prelude::*;

/// (entity, class, x, proximity)
type Sighting = (u8, usize, i32, u8);

fn sighting() -> impl Strategy<Value = Sighting> {
    (0u8..12, 0usize..EntityClass::ALL.len(), -3i32..3, 0u8..=MAX_PROXIMITY)
}

/// Per-tick sightings; an empty vector is a silent tick.
fn schedule() -> impl Strategy<Value = Vec<Vec<Sighting>>> {
    prop::collection::vec(prop::collection::vec(sighting(), 0..8), 1..40)
}

fn batch(tick: Tick, sightings: &[Sighting]) -> EvidenceBatch {
    // One entry per entity, last sighting wins.
    let unique: BTreeMap<u8, &Sighting> = sightings.iter().map(|s| (s.0, s)).collect();
    let mut batch = EvidenceBatch::new(tick);
    for (entity, &(_, class, x, prox)) in unique {
        batch.push(EvidenceItem::new(
            format!("ent-{entity}"),
            EntityClass::ALL[class].as_str(),
            PositionBucket::new(x, 0, 0),
            prox,
        ));
    }
    batch
}

fn run(capsule: &mut Capsule, tick: Tick, sightings: &[Sighting]) -> Vec<Delta> {
    let mut out = capsule.ingest(&batch(tick, sightings)).unwrap();
    out.extend(capsule.tick(tick).unwrap());
    out
}

fn full_cfg(track_cap: usize) -> CapsuleCfg {
    CapsuleCfg {
        track_cap,
        ..CapsuleCfg::default()
            .with_extension(Extension::RiskComponentsV1)
            .with_extension(Extension::IdRobustness)
    }
}

proptest! {
    #[test]
    fn replicas_agree_byte_for_byte(ticks in schedule(), cap in 1usize..16) {
        let mut a = Capsule::new(full_cfg(cap)).unwrap();
        let mut b = Capsule::new(full_cfg(cap)).unwrap();
        for (i, sightings) in ticks.iter().enumerate() {
            let t = i as Tick + 1;
            let da = run(&mut a, t, sightings);
            let db = run(&mut b, t, sightings);
            prop_assert_eq!(codec::encode_deltas(&da), codec::encode_deltas(&db));
            prop_assert_eq!(
                a.get_snapshot(t).unwrap().to_canonical_bytes(),
                b.get_snapshot(t).unwrap().to_canonical_bytes()
            );
        }
    }

    #[test]
    fn size_never_exceeds_cap(ticks in schedule(), cap in 1usize..10) {
        let mut capsule = Capsule::new(full_cfg(cap)).unwrap();
        for (i, sightings) in ticks.iter().enumerate() {
            let t = i as Tick + 1;
            for d in run(&mut capsule, t, sightings) {
                prop_assert!(d.validate().is_ok());
            }
            prop_assert!(capsule.size() <= cap);
            prop_assert!(capsule.snapshot().len() <= cap);
        }
    }

    #[test]
    fn silence_only_raises_uncertainty_and_lowers_risk(
        first in sighting(),
        silent in 1u64..30,
    ) {
        let mut capsule = Capsule::new(full_cfg(4)).unwrap();
        run(&mut capsule, 1, &[first]);
        let id = capsule.tracks().next().unwrap().track_id;
        let mut p = 0.0;
        let mut risk = capsule.track(id).unwrap().risk_level;
        for t in 2..=1 + silent {
            capsule.tick(t).unwrap();
            let Some(track) = capsule.track(id) else { break };
            prop_assert!(track.p_unknown >= p);
            prop_assert!(track.p_unknown <= 1.0);
            prop_assert!(track.risk_level <= risk);
            p = track.p_unknown;
            risk = track.risk_level;
        }
    }

    #[test]
    fn features_do_not_change_outcomes(ticks in schedule(), tag in "[a-z]{1,8}") {
        let mut plain = Capsule::new(CapsuleCfg::default()).unwrap();
        let mut tagged = Capsule::new(CapsuleCfg::default()).unwrap();
        for (i, sightings) in ticks.iter().enumerate() {
            let t = i as Tick + 1;
            let b = batch(t, sightings);
            let mut decorated = EvidenceBatch::new(t);
            for item in &b.items {
                decorated.push(
                    item.clone()
                        .with_features(Features::new().with("tag", tag.clone()).with("tick", t)),
                );
            }
            let mut da = plain.ingest(&b).unwrap();
            da.extend(plain.tick(t).unwrap());
            let mut db = tagged.ingest(&decorated).unwrap();
            db.extend(tagged.tick(t).unwrap());
            prop_assert_eq!(da, db);
        }
        prop_assert_eq!(plain.snapshot(), tagged.snapshot());
    }

    #[test]
    fn oscillation_never_outruns_budget(
        near in 0u8..=MAX_PROXIMITY,
        far in 0u8..=MAX_PROXIMITY,
        class in 0usize..EntityClass::ALL.len(),
        len in 65usize..400,
    ) {
        let cfg = CapsuleCfg::default();
        let budget = cfg.hysteresis_budget as usize;
        let mut capsule = Capsule::new(cfg).unwrap();
        let mut reclassified = 0;
        for i in 0..len {
            let band = if i % 2 == 0 { near } else { far };
            reclassified += run(&mut capsule, i as Tick + 1, &[(0, class, 0, band)])
                .iter()
                .filter(|d| d.is_reclassified())
                .count();
        }
        prop_assert!(reclassified <= budget, "{} reclassifications over {} ticks", reclassified, len);
    }
}
