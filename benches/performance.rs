use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use pipelet_core::config::GraphConfig;
use pipelet_core::{Change, Key, Operation, Value};
use pipelet_operators::filter::Filter;
use pipelet_operators::set::Set;
use pipelet_operators::Graph;
use pipelet_query::{compile, Query, QueryTree};
use serde_json::json;

fn make_values(rows: usize) -> Vec<Value> {
    (0..rows)
        .map(|i| {
            Value::from_json(json!({
                "id": i,
                "flow": format!("flow-{}", i % 16),
                "amount": (i % 100) as f64,
            }))
            .unwrap()
        })
        .collect()
}

fn bench_matcher(c: &mut Criterion) {
    let values = make_values(1024);
    let matcher = compile(
        &Query::from_json(json!([
            {"flow": "flow-3", "amount": [">", 10, "&&", "<=", 90]},
            {"flow": ["match", "^flow-1[0-5]$"]}
        ]))
        .unwrap(),
    )
    .unwrap();
    c.bench_function("matcher_1024", |b| {
        b.iter(|| values.iter().filter(|v| matcher.matches(black_box(v))).count())
    });
}

fn bench_query_tree(c: &mut Criterion) {
    let values = make_values(1024);
    let mut tree: QueryTree<usize> = QueryTree::new();
    for dest in 0..256 {
        let q = Query::from_json(json!([{"flow": format!("flow-{}", dest % 16), "amount": [">", dest % 50]}])).unwrap();
        tree.add_terms(dest, q.terms()).unwrap();
    }
    let change = Change::Add { values };
    c.bench_function("query_tree_split_256_dests", |b| {
        b.iter(|| tree.split(black_box(&change)).len())
    });
}

fn bench_push_through_filters(c: &mut Criterion) {
    let mut g = Graph::new(GraphConfig::default());
    let source = g
        .add_node("source", Box::new(Set::new(Key::default(), Query::everything())))
        .unwrap();
    for i in 0..16 {
        let f = Filter::new(Query::from_json(json!([{"flow": format!("flow-{}", i)}])).unwrap()).unwrap();
        let id = g.add_node(format!("f{}", i), Box::new(f)).unwrap();
        let sink = g
            .add_node(format!("sink{}", i), Box::new(Set::new(Key::default(), Query::everything())))
            .unwrap();
        g.connect(source, id).unwrap();
        g.connect(id, sink).unwrap();
    }
    let values = make_values(256);
    c.bench_function("push_256_values_16_filters", |b| {
        b.iter(|| {
            g.submit(source, Operation::add(values.clone())).unwrap();
            g.submit(source, Operation::remove(values.clone())).unwrap();
        })
    });
}

criterion_group!(routing, bench_matcher, bench_query_tree, bench_push_through_filters);
criterion_main!(routing);
