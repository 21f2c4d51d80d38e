//! Property tests for the engine's core invariants.
//!
//! - Last-writer-wins by sequence across memtable and segments, under
//!   arbitrary seal/compaction interleavings
//! - Seal and compaction preserve the visible id set and payloads
//! - Search over a small population returns exactly the live set
//! - Metric laws: identity, symmetry, non-negativity

use std::collections::BTreeMap;

use proptest::prelude::*;
use svdb::{Engine, EngineOptions, Metric, SvdbError};

// ---------------------------------------------------------------------------
// Model-based engine interleavings
// ---------------------------------------------------------------------------

const POOL: usize = 16;

#[derive(Debug, Clone)]
enum Op {
    Store(u8, i8),
    Delete(u8),
    Seal,
    Compact,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..POOL as u8, any::<i8>()).prop_map(|(k, v)| Op::Store(k, v)),
        2 => (0..POOL as u8).prop_map(Op::Delete),
        1 => Just(Op::Seal),
        1 => Just(Op::Compact),
    ]
}

fn key(k: u8) -> Vec<u8> {
    format!("key_{:02}", k).into_bytes()
}

fn value(k: u8, v: i8) -> Vec<f32> {
    vec![v as f32, k as f32]
}

fn engine_for_model() -> Engine {
    let mut opts = EngineOptions::new(2);
    // Seals happen only when the script says so, and connectivity
    // caps sit far above the population so pruning never fires and
    // search exhaustiveness is exact.
    opts.memtable_max_records = usize::MAX / 2;
    opts.memtable_max_bytes = usize::MAX / 2;
    opts.hnsw.m = 48;
    opts.hnsw.ef_construction = 96;
    opts.hnsw.ef_search = 128;
    Engine::ephemeral(opts).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn last_writer_wins_under_interleavings(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let engine = engine_for_model();
        let mut model: BTreeMap<Vec<u8>, Option<Vec<f32>>> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Store(k, v) => {
                    engine.store(&key(*k), value(*k, *v)).unwrap();
                    model.insert(key(*k), Some(value(*k, *v)));
                }
                Op::Delete(k) => {
                    engine.delete(&key(*k)).unwrap();
                    model.insert(key(*k), None);
                }
                Op::Seal => {
                    engine.flush().unwrap();
                }
                Op::Compact => {
                    engine.flush().unwrap();
                    engine.maybe_compact(Some(1)).unwrap();
                }
            }

            // The engine agrees with the model after every step.
            for k in 0..POOL as u8 {
                let id = key(k);
                match model.get(&id) {
                    Some(Some(expected)) => {
                        prop_assert_eq!(&engine.get(&id).unwrap(), expected);
                    }
                    Some(None) | None => {
                        prop_assert!(matches!(engine.get(&id), Err(SvdbError::NotFound)));
                    }
                }
            }
        }

        // With a population this small nothing is ever pruned, so
        // search must return exactly the live set.
        let live: Vec<&Vec<u8>> = model
            .iter()
            .filter_map(|(id, v)| v.as_ref().map(|_| id))
            .collect();
        let hits = engine.search(&[0.0, 0.0], POOL, Some(128)).unwrap();
        prop_assert_eq!(hits.len(), live.len());
        for (id, _) in &hits {
            prop_assert!(live.contains(&id));
        }
    }

    #[test]
    fn seal_point_is_invisible(
        records in prop::collection::btree_map(0..POOL as u8, any::<i8>(), 1..POOL),
        seal_twice in any::<bool>(),
    ) {
        let engine = engine_for_model();
        for (k, v) in &records {
            engine.store(&key(*k), value(*k, *v)).unwrap();
        }

        let before: Vec<(Vec<u8>, Vec<f32>)> = records
            .iter()
            .map(|(k, _)| (key(*k), engine.get(&key(*k)).unwrap()))
            .collect();

        engine.flush().unwrap();
        if seal_twice {
            engine.flush().unwrap();
        }

        for (id, expected) in &before {
            prop_assert_eq!(&engine.get(id).unwrap(), expected);
        }
    }

    #[test]
    fn compaction_preserves_live_map(
        keep in prop::collection::btree_set(0..POOL as u8, 1..POOL),
        drop in prop::collection::btree_set(0..POOL as u8, 0..POOL),
    ) {
        let engine = engine_for_model();
        // Spread writes across several segments.
        for (i, k) in keep.iter().chain(drop.iter()).enumerate() {
            engine.store(&key(*k), value(*k, 1)).unwrap();
            if i % 3 == 2 {
                engine.flush().unwrap();
            }
        }
        for k in &drop {
            engine.delete(&key(*k)).unwrap();
        }
        engine.flush().unwrap();
        engine.maybe_compact(Some(1)).unwrap();

        for k in 0..POOL as u8 {
            let alive = keep.contains(&k) && !drop.contains(&k);
            if alive {
                prop_assert_eq!(engine.get(&key(k)).unwrap(), value(k, 1));
            } else {
                prop_assert!(matches!(engine.get(&key(k)), Err(SvdbError::NotFound)));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Metric laws
// ---------------------------------------------------------------------------

fn bounded_vector() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-100.0f32..100.0, 8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn metric_symmetry(u in bounded_vector(), v in bounded_vector()) {
        for m in [
            Metric::Euclidean,
            Metric::Cosine,
            Metric::Manhattan,
            Metric::Dot,
            Metric::Angular,
        ] {
            let uv = m.distance(&u, &v);
            let vu = m.distance(&v, &u);
            prop_assert!((uv - vu).abs() <= 1e-5_f32.max(uv.abs() * 1e-5));
        }
    }

    #[test]
    fn metric_identity(u in bounded_vector()) {
        prop_assert!(Metric::Euclidean.distance(&u, &u) == 0.0);
        prop_assert!(Metric::Manhattan.distance(&u, &u) == 0.0);
        // Cosine and angular are defined over directions; the zero
        // vector has none, so identity applies to nonzero input.
        if u.iter().any(|x| x.abs() > 1e-3) {
            prop_assert!(Metric::Cosine.distance(&u, &u).abs() < 1e-4);
            prop_assert!(Metric::Angular.distance(&u, &u).abs() < 1e-2);
        }
    }

    #[test]
    fn metric_non_negative_except_dot(u in bounded_vector(), v in bounded_vector()) {
        for m in [
            Metric::Euclidean,
            Metric::Cosine,
            Metric::Manhattan,
            Metric::Angular,
        ] {
            prop_assert!(m.distance(&u, &v) >= 0.0, "{:?}", m);
        }
    }
}
