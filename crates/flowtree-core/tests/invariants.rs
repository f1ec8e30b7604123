//! Randomized checks for a handful of the testable properties in `spec.md`
//! §8 — batch equivalence, order stability, inverse-operation round-trips,
//! and filter isolation — run over seeded `rand` sequences (the teacher's
//! own data-structure crates favor targeted, seeded sequences over a broad
//! property-testing framework for this kind of invariant).

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use flowtree_core::path::{Key, PropName, SegPath};
use flowtree_core::pipeline::{InMemoryStateContainer, Pipeline};
use flowtree_core::steps::aggregate::CommutativeAggregateStep;
use flowtree_core::steps::{FilterStep, GroupByStep};
use flowtree_core::tree::{MaterializedTree, Row};
use flowtree_core::value::{Props, Value};
use flowtree_core::InputStep;

fn props(amount: i64) -> Props {
    [("amount".to_string(), Value::from(amount))].into_iter().collect()
}

/// Flattens a materialized tree into a `serde_json::Value` so tests can
/// compare whole trees with `assert_eq!` — `Row`/`KeyedArray` have no
/// `PartialEq` of their own, and array order (a `Vec`'s `PartialEq`) is
/// exactly what order-stability assertions need to be sensitive to, while
/// object-field order (child array names) should not matter.
fn row_to_json(key: &Key, row: &Row) -> Value {
    let mut obj = Props::new();
    obj.insert("__key".to_string(), Value::String(key.to_string()));
    for (k, v) in &row.props {
        obj.insert(k.clone(), v.clone());
    }
    for (name, array) in &row.children {
        obj.insert(name.to_string(), Value::Array(array.iter().map(|(k, r)| row_to_json(k, r)).collect()));
    }
    Value::Object(obj)
}

fn tree_to_json(tree: &MaterializedTree) -> Value {
    Value::Array(tree.iter().map(|(k, r)| row_to_json(k, r)).collect())
}

/// Wires `InputStep -> GroupByStep(all rows into one "items" group) ->
/// CommutativeAggregateStep(sum amount -> total)`, bound through a real
/// [`Pipeline`] and [`InMemoryStateContainer`] — exactly the shape `spec.md`
/// §8's scenarios use, parameterized on the batch threshold/time slice so
/// the same sequence can be replayed at different flush granularities.
fn build_summed_group(threshold: usize, slice_ms: u64) -> (Arc<InputStep>, Pipeline, Arc<InMemoryStateContainer>) {
    let input = InputStep::new();
    let grouped = GroupByStep::new(input.clone(), SegPath::root(), vec![], "items");
    let total = CommutativeAggregateStep::new(
        grouped,
        SegPath::root().child("items"),
        "amount",
        "total",
        0.0,
        |acc, p| acc + p.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
        |acc, p| acc - p.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
    );
    let sink = InMemoryStateContainer::new();
    let pipeline = Pipeline::with_batch_params(input.clone(), total, sink.clone(), threshold, Duration::from_millis(slice_ms));
    (input, pipeline, sink)
}

enum Op {
    Add(Key, i64),
    Remove(Key, i64),
}

fn random_add_remove_sequence(seed: u64, steps: usize) -> (Vec<Op>, Vec<(Key, i64)>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut present: Vec<(Key, i64)> = Vec::new();
    let mut ops = Vec::new();
    let mut next_id = 0u32;

    for _ in 0..steps {
        let do_add = present.is_empty() || rng.gen_bool(0.6);
        if do_add {
            let amount = rng.gen_range(-50..=50);
            let key: Key = format!("k{next_id}").into();
            next_id += 1;
            present.push((key.clone(), amount));
            ops.push(Op::Add(key, amount));
        } else {
            let idx = rng.gen_range(0..present.len());
            let (key, amount) = present.remove(idx);
            ops.push(Op::Remove(key, amount));
        }
    }
    (ops, present)
}

fn replay(pipeline: &Pipeline, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Add(key, amount) => pipeline.add(key.clone(), props(*amount)),
            Op::Remove(key, amount) => pipeline.remove(key.clone(), props(*amount)),
        }
    }
}

/// Property #1, "batch equivalence": the materialized tree after a random
/// add/remove sequence is identical whether the updater coalesces
/// everything into one flush (large threshold, long time slice) or flushes
/// after nearly every single operation (threshold of 1) — batching only
/// changes delivery cadence, never the final state, because operations are
/// always applied in the order they were enqueued.
#[test]
fn batch_equivalence_is_independent_of_flush_granularity() {
    flowtree_log::setup_native_logging();
    let (ops, _present) = random_add_remove_sequence(42, 200);

    let (_input_a, pipeline_a, sink_a) = build_summed_group(1, 1);
    replay(&pipeline_a, &ops);
    pipeline_a.force_flush();

    let (_input_b, pipeline_b, sink_b) = build_summed_group(10_000, 60_000);
    replay(&pipeline_b, &ops);
    pipeline_b.force_flush();

    similar_asserts::assert_eq!(tree_to_json(&sink_a.snapshot()), tree_to_json(&sink_b.snapshot()));
}

/// Property #2, "order stability": a keyed array's iteration order always
/// matches the order rows were (re-)inserted — a removed row's slot
/// collapses, it does not leave a gap or get resurrected mid-sequence.
#[test]
fn order_stability_survives_interleaved_add_remove() {
    flowtree_log::setup_native_logging();
    let (_input, pipeline, sink) = build_summed_group(DEFAULT_THRESHOLD, DEFAULT_SLICE_MS);

    pipeline.add("a", props(1));
    pipeline.add("b", props(2));
    pipeline.add("c", props(3));
    pipeline.remove("b", props(2));
    pipeline.add("d", props(4));
    pipeline.force_flush();

    let tree = sink.snapshot();
    let (_, group_row) = tree.iter().next().expect("one synthetic group row");
    let items = group_row.children.get(&PropName::from("items")).expect("items child array present");
    let order: Vec<String> = items.iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(order, vec!["a", "c", "d"]);
}

const DEFAULT_THRESHOLD: usize = 256;
const DEFAULT_SLICE_MS: u64 = 16;

/// Property #4: for any sequence where every `add` is eventually matched by
/// a `remove` carrying the same props, the materialized tree returns to
/// exactly its starting (empty) state — removal is the true inverse of
/// insertion, not just a decrement that happens to look empty.
#[test]
fn round_trip_on_inverse_operations_returns_to_starting_state() {
    flowtree_log::setup_native_logging();
    for seed in [1u64, 2, 3, 7, 99] {
        let (mut ops, present) = random_add_remove_sequence(seed, 60);
        // Close out anything still present at the end of the random prefix
        // so every add has a matching remove by the time replay finishes.
        for (key, amount) in present {
            ops.push(Op::Remove(key, amount));
        }

        let (_input, pipeline, sink) = build_summed_group(DEFAULT_THRESHOLD, DEFAULT_SLICE_MS);
        replay(&pipeline, &ops);
        pipeline.force_flush();

        let tree = sink.snapshot();
        similar_asserts::assert_eq!(tree_to_json(&tree), Value::Array(vec![]), "seed {seed}: tree should be empty after every add is undone");
    }
}

/// Property #6, "filter isolation": rows that never satisfy the predicate
/// never reach anything downstream of the filter, regardless of how they're
/// interleaved with rows that do — a failing row's churn (even repeated
/// add/remove) must not leak into the filtered view.
#[test]
fn filter_isolation_only_ever_exposes_passing_rows() {
    flowtree_log::setup_native_logging();
    let input = InputStep::new();
    let filtered = FilterStep::new(input.clone(), SegPath::root(), |p: &Props| p.get("active").and_then(Value::as_bool).unwrap_or(false), vec!["active".into()]);
    let sink = InMemoryStateContainer::new();
    let pipeline = Pipeline::new(input.clone(), filtered, sink.clone());

    let mut rng = StdRng::seed_from_u64(7);
    let mut expected_active: Vec<Key> = Vec::new();
    let mut all_present: Vec<(Key, bool)> = Vec::new();

    for i in 0..80 {
        let key: Key = format!("r{i}").into();
        let active = rng.gen_bool(0.5);
        let row_props: Props = [("active".to_string(), Value::Bool(active))].into_iter().collect();
        pipeline.add(key.clone(), row_props);
        if active {
            expected_active.push(key.clone());
        }
        all_present.push((key, active));
    }
    pipeline.force_flush();

    let tree = sink.snapshot();
    let visible: Vec<String> = tree.iter().map(|(k, _)| k.to_string()).collect();
    let expected: Vec<String> = expected_active.iter().map(|k| k.to_string()).collect();
    assert_eq!(visible, expected, "only rows passing the predicate ever reach the state sink");

    for (key, active) in &all_present {
        if !active {
            assert!(tree.get(key).is_none(), "row {key} never passed the filter and must never be visible");
        }
    }
}
