//! Property tests for the operation merge algebra.
//!
//! For the merge pairs that are exact, performing two operations one after
//! the other must give the same value as performing their merge once.

use mooring_engine::{FieldOperation, ObjectState, OperationSet};
use proptest::prelude::*;
use serde_json::{json, Value};

fn int_list(max_len: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(0i64..8, 0..max_len).prop_map(|v| v.into_iter().map(Value::from).collect())
}

fn unique_int_list() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::btree_set(0i64..8, 0..5)
        .prop_map(|set| set.into_iter().map(Value::from).collect())
}

fn start_list() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![Just(None), int_list(6).prop_map(|v| Some(Value::Array(v)))]
}

fn start_number() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![Just(None), (-1000i64..1000).prop_map(|n| Some(json!(n)))]
}

/// Apply `previous` then `next`, and their merge, to `start`.
fn sequential_and_merged(
    start: Option<&Value>,
    previous: &FieldOperation,
    next: &FieldOperation,
) -> (Option<Value>, Option<Value>) {
    let middle = previous.apply("k", start).unwrap();
    let sequential = next.apply("k", middle.as_ref()).unwrap();
    let merged = next.merge_with_previous("k", Some(previous)).unwrap();
    (sequential, merged.apply("k", start).unwrap())
}

proptest! {
    #[test]
    fn prop_increments_sum(start in start_number(), a in -500i64..500, b in -500i64..500) {
        let (sequential, merged) = sequential_and_merged(
            start.as_ref(),
            &FieldOperation::increment(a),
            &FieldOperation::increment(b),
        );
        prop_assert_eq!(sequential, merged);
    }

    #[test]
    fn prop_adds_concatenate(start in start_list(), a in int_list(4), b in int_list(4)) {
        let (sequential, merged) = sequential_and_merged(
            start.as_ref(),
            &FieldOperation::add(a),
            &FieldOperation::add(b),
        );
        prop_assert_eq!(sequential, merged);
    }

    #[test]
    fn prop_add_uniques_union(start in start_list(), a in unique_int_list(), b in unique_int_list()) {
        let (sequential, merged) = sequential_and_merged(
            start.as_ref(),
            &FieldOperation::add_unique(a),
            &FieldOperation::add_unique(b),
        );
        prop_assert_eq!(sequential, merged);
    }

    #[test]
    fn prop_removes_union(start in start_list(), a in int_list(4), b in int_list(4)) {
        let (sequential, merged) = sequential_and_merged(
            start.as_ref(),
            &FieldOperation::remove(a),
            &FieldOperation::remove(b),
        );
        prop_assert_eq!(sequential, merged);
    }

    #[test]
    fn prop_set_absorbs_list_operations(base in int_list(5), list in int_list(4), kind in 0u8..3) {
        let next = match kind {
            0 => FieldOperation::add(list),
            1 => FieldOperation::add_unique(list),
            _ => FieldOperation::remove(list),
        };
        let (sequential, merged) = sequential_and_merged(
            None,
            &FieldOperation::set(Value::Array(base)),
            &next,
        );
        prop_assert_eq!(sequential, merged);
    }

    #[test]
    fn prop_delete_then_increment(start in start_number(), n in -500i64..500) {
        let (sequential, merged) = sequential_and_merged(
            start.as_ref(),
            &FieldOperation::Delete,
            &FieldOperation::increment(n),
        );
        prop_assert_eq!(sequential, merged);
    }

    #[test]
    fn prop_estimate_matches_flattened_sets(
        start in start_number(),
        first in prop::collection::vec(-50i64..50, 1..4),
        second in prop::collection::vec(-50i64..50, 1..4),
    ) {
        // Estimating through two pending sets equals estimating through their merge.
        let mut state = ObjectState::new("Counter");
        if let Some(value) = &start {
            let data = json!({"k": value});
            state.merge_from_server(data.as_object().unwrap()).unwrap();
        }
        for n in &first {
            state.perform_operation("k", FieldOperation::increment(*n)).unwrap();
        }
        let frozen = state.begin_save(false).unwrap();
        let mut later = OperationSet::new();
        for n in &second {
            state.perform_operation("k", FieldOperation::increment(*n)).unwrap();
            later.apply_operation("k", FieldOperation::increment(*n)).unwrap();
        }

        let mut flattened = frozen.clone();
        flattened.merge_operation_set(&later).unwrap();
        let mut fields = state.server_data.clone();
        flattened.apply_to(&mut fields).unwrap();

        prop_assert_eq!(state.estimated_value("k"), fields.get("k").cloned());
    }

    #[test]
    fn prop_merge_is_deterministic(a in -100i64..100, b in -100i64..100) {
        let previous = FieldOperation::increment(a);
        let next = FieldOperation::increment(b);
        let first = next.merge_with_previous("k", Some(&previous)).unwrap();
        let second = next.merge_with_previous("k", Some(&previous)).unwrap();
        prop_assert_eq!(first, second);
    }
}
