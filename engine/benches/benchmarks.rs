//! Performance benchmarks for mooring-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mooring_engine::{
    sort_candidates, Candidate, FieldOperation, Matcher, ObjectState, OperationSet, QueryState,
};
use serde_json::json;

fn candidates(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|i| {
            let data = json!({
                "name": format!("Item {i}"),
                "score": (i * 7919) % 1000,
                "tags": ["a", if i % 2 == 0 { "even" } else { "odd" }],
                "meta": {"rank": i % 10},
            });
            Candidate::new(format!("local-{i}"), data.as_object().unwrap().clone())
        })
        .collect()
}

fn bench_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher");

    let query = QueryState::builder("Item")
        .greater_than("score", json!(500))
        .equal_to("tags", json!("even"))
        .matches_regex("name", "^item 1", "i")
        .build();

    group.bench_function("compile", |b| {
        b.iter(|| Matcher::compile(black_box(&query), Vec::new()))
    });

    for size in [100usize, 1000, 10000].iter() {
        let items = candidates(*size);
        let matcher = Matcher::compile(&query, Vec::new()).unwrap();

        group.bench_with_input(BenchmarkId::new("scan", size), size, |b, _| {
            b.iter(|| {
                items
                    .iter()
                    .filter(|c| matcher.matches(black_box(c), None))
                    .count()
            })
        });

        group.bench_with_input(BenchmarkId::new("sort", size), size, |b, _| {
            let keys = vec!["-score".to_string(), "name".to_string()];
            b.iter(|| {
                let mut sorted = items.clone();
                sort_candidates(&mut sorted, black_box(&keys), |c| c).unwrap();
                sorted
            })
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    group.bench_function("increment_chain", |b| {
        b.iter(|| {
            let mut set = OperationSet::new();
            for i in 0..100 {
                set.apply_operation("n", FieldOperation::increment(black_box(i)))
                    .unwrap();
            }
            set
        })
    });

    group.bench_function("add_unique_chain", |b| {
        b.iter(|| {
            let mut set = OperationSet::new();
            for i in 0..100 {
                set.apply_operation("tags", FieldOperation::add_unique(vec![json!(i % 20)]))
                    .unwrap();
            }
            set
        })
    });

    group.bench_function("estimate_with_pending_sets", |b| {
        let mut state = ObjectState::new("Item");
        for round in 0..10 {
            for key in ["a", "b", "c", "d"] {
                state
                    .perform_operation(key, FieldOperation::increment(round))
                    .unwrap();
            }
            state.begin_save(true).unwrap();
        }
        b.iter(|| black_box(&state).estimated_data())
    });

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    let mut set = OperationSet::new();
    set.apply_operation("title", FieldOperation::set(json!("Hello")))
        .unwrap();
    set.apply_operation("score", FieldOperation::increment(3))
        .unwrap();
    set.apply_operation("tags", FieldOperation::add(vec![json!("x"), json!("y")]))
        .unwrap();

    group.bench_function("operation_set_to_json", |b| {
        b.iter(|| serde_json::to_string(black_box(&set)))
    });

    group.bench_function("operation_set_body", |b| b.iter(|| black_box(&set).to_body()));

    let json = serde_json::to_string(&set).unwrap();
    group.bench_function("operation_set_from_json", |b| {
        b.iter(|| serde_json::from_str::<OperationSet>(black_box(&json)))
    });

    group.finish();
}

criterion_group!(benches, bench_matcher, bench_merge, bench_serialization);
criterion_main!(benches);
