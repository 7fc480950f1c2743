//! Edge case tests for mooring-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use mooring_engine::value::{map_pointers, visit_pointers};
use mooring_engine::{
    apply_window, sort_candidates, Candidate, ClassRegistry, ClassSchema, Error, FieldDef,
    FieldOperation, FieldType, LocalObjectRecord, Matcher, ObjectState, OperationSet, Pointer,
    QueryState,
};
use chrono::Utc;
use serde_json::{json, Value};

fn candidate(id: &str, data: Value) -> Candidate {
    Candidate::new(id, data.as_object().unwrap().clone())
}

// ============================================================================
// Value Edge Cases
// ============================================================================

#[test]
fn unicode_strings_match_and_sort() {
    let names = ["日本語テスト", "Привет мир", "🎉🚀💯", "Hello\nWorld\tTab", ""];
    let mut items: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| candidate(&i.to_string(), json!({ "name": name })))
        .collect();

    for (i, name) in names.iter().enumerate() {
        let query = QueryState::builder("Item").equal_to("name", json!(name)).build();
        let matcher = Matcher::compile(&query, Vec::new()).unwrap();
        let hits: Vec<_> = items.iter().filter(|c| matcher.matches(c, None)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].local_id, i.to_string());
    }

    sort_candidates(&mut items, &["name".into()], |c| c).unwrap();
    assert_eq!(items[0].data["name"], "");
}

#[test]
fn increment_overflow_falls_back_to_float() {
    let op = FieldOperation::increment(1);
    let value = op.apply("n", Some(&json!(i64::MAX))).unwrap().unwrap();
    assert!(value.is_f64());
}

#[test]
fn null_is_treated_as_absent() {
    let mut state = ObjectState::new("Item");
    state
        .merge_from_server(json!({"n": null, "tags": null}).as_object().unwrap())
        .unwrap();
    state.perform_operation("n", FieldOperation::increment(3)).unwrap();
    state
        .perform_operation("tags", FieldOperation::add(vec![json!("a")]))
        .unwrap();
    assert_eq!(state.estimated_value("n"), Some(json!(3)));
    assert_eq!(state.estimated_value("tags"), Some(json!(["a"])));
}

#[test]
fn deeply_nested_pointers_are_visited() {
    let value = json!({
        "a": [[{"__type": "Pointer", "className": "T", "localId": "1"}]],
        "b": {"c": {"d": {"__type": "Pointer", "className": "T", "localId": "2"}}},
        "r": {"__type": "Relation", "className": "T", "objects": ["3"]},
    });
    let mut seen = Vec::new();
    visit_pointers(&value, &mut |p| seen.push(p.local_id.unwrap()));
    seen.sort();
    assert_eq!(seen, ["1", "2"]);

    let rewritten = map_pointers(value, &mut |mut p| {
        p.object_id = Some(format!("srv-{}", p.local_id.clone().unwrap()));
        Ok(p)
    })
    .unwrap();
    assert_eq!(rewritten["a"][0][0]["objectId"], "srv-1");
    assert_eq!(rewritten["r"]["objects"], json!(["3"]));
}

#[test]
fn pointer_without_any_id_is_not_a_pointer() {
    let value = json!({"__type": "Pointer", "className": "T"});
    assert!(Pointer::from_value(&value).is_none());
}

// ============================================================================
// Operation Edge Cases
// ============================================================================

#[test]
fn relation_add_then_remove_cancels() {
    let add = FieldOperation::add_relation("Tag", ["t1".to_string(), "t2".to_string()]);
    let remove = FieldOperation::remove_relation("Tag", ["t1".to_string()]);
    let merged = remove.merge_with_previous("tags", Some(&add)).unwrap();
    assert_eq!(
        merged,
        FieldOperation::Relation {
            target_class: "Tag".into(),
            adds: ["t2".to_string()].into(),
            removes: Default::default(),
        }
    );
}

#[test]
fn relation_class_mismatch_is_merge_error() {
    let a = FieldOperation::add_relation("Tag", ["t1".to_string()]);
    let b = FieldOperation::add_relation("User", ["u1".to_string()]);
    assert!(b.merge_with_previous("rel", Some(&a)).unwrap_err().is_merge_type());
}

#[test]
fn empty_operation_set_has_empty_body() {
    let set = OperationSet::new();
    assert!(set.is_empty());
    assert_eq!(set.to_body(), json!({}));
}

#[test]
fn repeated_begin_save_without_edits() {
    let mut state = ObjectState::new("Item");
    let a = state.begin_save(false).unwrap();
    let b = state.begin_save(false).unwrap();
    assert!(a.is_empty() && b.is_empty());
    assert_ne!(a.uuid, b.uuid);
    assert!(!state.is_dirty());
}

#[test]
fn unknown_set_uuid_on_rollback() {
    let mut state = ObjectState::new("Item");
    let err = state.rollback_failed_save("nope").unwrap_err();
    assert!(matches!(err, Error::OperationSetNotFound(id) if id == "nope"));
}

#[test]
fn save_result_for_unknown_set_still_merges_response() {
    let mut state = ObjectState::new("Item");
    state
        .apply_save_result("gone", json!({"objectId": "x1"}).as_object().unwrap())
        .unwrap();
    assert_eq!(state.object_id.as_deref(), Some("x1"));
}

// ============================================================================
// Query Edge Cases
// ============================================================================

#[test]
fn empty_query_matches_everything() {
    let matcher = Matcher::compile(&QueryState::new("Item"), Vec::new()).unwrap();
    assert!(matcher.matches(&candidate("a", json!({})), None));
}

#[test]
fn limit_zero_and_large_skip() {
    let items = vec![1, 2, 3];
    assert!(apply_window(items.clone(), 0, Some(0)).is_empty());
    assert!(apply_window(items, usize::MAX, None).is_empty());
}

#[test]
fn comparisons_across_kinds_never_match() {
    let c = candidate("a", json!({"n": "10"}));
    let query = QueryState::builder("Item").greater_than("n", json!(5)).build();
    assert!(!Matcher::compile(&query, Vec::new()).unwrap().matches(&c, None));
}

#[test]
fn date_comparison() {
    let c = candidate(
        "a",
        json!({"due": {"__type": "Date", "iso": "2024-03-01T00:00:00.000Z"}}),
    );
    let query = QueryState::builder("Item")
        .less_than("due", json!({"__type": "Date", "iso": "2024-04-01T00:00:00.000Z"}))
        .build();
    assert!(Matcher::compile(&query, Vec::new()).unwrap().matches(&c, None));
}

#[test]
fn malformed_or_clause_is_invalid_query() {
    let mut query = QueryState::new("Item");
    query.conditions.insert("$or".into(), json!({"a": 1}));
    assert!(matches!(
        Matcher::compile(&query, Vec::new()),
        Err(Error::InvalidQuery(_))
    ));
}

// ============================================================================
// Record & Schema Edge Cases
// ============================================================================

#[test]
fn stored_row_must_fit_registered_schema() {
    let registry = ClassRegistry::new().with_class(ClassSchema::new(
        "Item",
        vec![FieldDef::new("count", FieldType::Number)],
    ));
    let record = LocalObjectRecord::from_row(
        "u-1",
        "Item",
        None,
        r#"{"fields": {"count": "many"}, "complete": true}"#,
        false,
        Utc::now(),
    )
    .unwrap();
    assert!(registry
        .validate_fields(&record.class_name, &record.payload.fields)
        .is_err());
}

#[test]
fn large_payload_roundtrip() {
    let mut state = ObjectState::new("Item");
    let big: Vec<Value> = (0..10_000).map(Value::from).collect();
    state
        .perform_operation("big", FieldOperation::set(Value::Array(big)))
        .unwrap();
    let record = LocalObjectRecord::from_state("u-1", &state, false, Utc::now());
    let json = record.payload_json().unwrap();
    let decoded =
        LocalObjectRecord::from_row("u-1", "Item", None, &json, false, Utc::now()).unwrap();
    assert_eq!(decoded.to_state(), state);
}
