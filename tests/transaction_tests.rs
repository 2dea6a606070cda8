//! Transactions through joins: forks, recombination, timeouts.

mod common;

use std::time::{Duration, Instant};

use common::{q, v, vs};
use pipelet_core::config::GraphConfig;
use pipelet_core::id::NodeId;
use pipelet_core::{Change, Operation};
use pipelet_operators::filter::Filter;
use pipelet_operators::optimize::Optimize;
use pipelet_operators::passthrough::Passthrough;
use pipelet_operators::union::Union;
use pipelet_operators::Graph;
use pipelet_query::Query;
use pipelet_tx::{TxBuilder, TxState};
use serde_json::json;

struct Forked {
    g: Graph,
    src: NodeId,
    orders: NodeId,
    users: NodeId,
    join: NodeId,
}

/// src -> {orders, users} -> join (union tagged "split").
fn forked(join_options: serde_json::Value) -> Forked {
    let config = GraphConfig::default();
    let mut g = Graph::new(config.clone());
    let src = g.add_node("src", Box::new(Passthrough)).unwrap();
    let orders = g
        .add_node("orders", Box::new(Filter::new(q(json!([{"flow": "orders"}]))).unwrap()))
        .unwrap();
    let users = g
        .add_node("users", Box::new(Filter::new(q(json!([{"flow": "users"}]))).unwrap()))
        .unwrap();
    let join = g
        .add_node("join", Box::new(Union::from_options(&join_options, &config).unwrap()))
        .unwrap();
    g.connect(src, orders).unwrap();
    g.connect(src, users).unwrap();
    g.connect(orders, join).unwrap();
    g.connect(users, join).unwrap();
    Forked {
        g,
        src,
        orders,
        users,
        join,
    }
}

#[test]
fn test_forked_transaction_is_released_once_every_branch_closed() {
    let mut f = forked(json!({"tag": "split"}));
    let sub = f.g.subscribe(f.join, Query::everything()).unwrap();

    let tx = TxBuilder::new().fork("split");
    let ops = tx.stamp(vec![
        Operation::add(vs(json!([{"id": 1, "flow": "orders"}]))),
        Operation::add(vs(json!([{"id": 2, "flow": "users"}]))),
    ]);
    let mut ops = ops.into_iter();

    f.g.submit(f.src, ops.next().unwrap()).unwrap();
    assert!(f.g.take_received(sub).is_empty());
    let state = f.g.get::<Union>(f.join).unwrap().coordinator().unwrap().state(tx.id());
    assert_eq!(state, Some(TxState::WaitingForks));

    f.g.submit(f.src, ops.next().unwrap()).unwrap();
    let got = f.g.take_received(sub);
    assert_eq!(got.len(), 1);
    assert_eq!(
        got[0].change,
        Change::Add { values: vs(json!([{"id": 1, "flow": "orders"}, {"id": 2, "flow": "users"}])) }
    );
    let meta = got[0].tx().unwrap();
    assert_eq!(&meta.id, tx.id());
    assert!(!meta.more);
    assert!(meta.forks.is_empty());
}

#[test]
fn test_untagged_operations_pass_a_join_untouched() {
    let mut f = forked(json!({"tag": "split"}));
    let sub = f.g.subscribe(f.join, Query::everything()).unwrap();
    f.g.submit(f.src, Operation::add(vs(json!([{"id": 1, "flow": "users"}]))))
        .unwrap();
    let got = f.g.take_received(sub);
    assert_eq!(got, vec![Operation::add(vs(json!([{"id": 1, "flow": "users"}])))]);
}

#[test]
fn test_leaving_branch_releases_waiting_transaction() {
    let mut f = forked(json!({"tag": "split"}));
    let sub = f.g.subscribe(f.join, Query::everything()).unwrap();

    let tx = TxBuilder::new().fork("split");
    let op = Operation::add(vs(json!([{"id": 1, "flow": "orders"}]))).with_tx(tx.last());
    // straight into one branch: the other one never closes
    f.g.submit(f.orders, op).unwrap();
    assert!(f.g.take_received(sub).is_empty());

    f.g.disconnect(f.users, f.join).unwrap();
    let got = f.g.take_received(sub);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].change, Change::Add { values: vs(json!([{"id": 1, "flow": "orders"}])) });
    assert!(got[0].closes_tx());
}

#[test]
fn test_timeout_cancels_and_forwards_closing_noop() {
    let mut f = forked(json!({"tag": "split", "timeout_ms": 10}));
    let sub = f.g.subscribe(f.join, Query::everything()).unwrap();

    let tx = TxBuilder::new().fork("split");
    let op = Operation::add(vs(json!([{"id": 1, "flow": "orders"}]))).with_tx(tx.more());
    f.g.submit(f.src, op).unwrap();
    assert!(f.g.take_received(sub).is_empty());

    f.g.tick(Instant::now() + Duration::from_secs(1)).unwrap();
    let got = f.g.take_received(sub);
    assert_eq!(got.len(), 1);
    assert!(got[0].is_empty());
    assert!(got[0].closes_tx());
    assert_eq!(&got[0].tx().unwrap().id, tx.id());

    let join = f.g.get::<Union>(f.join).unwrap().coordinator().unwrap();
    assert_eq!(join.state(tx.id()), Some(TxState::Cancelled));
    assert_eq!(join.pending_count(), 0);
}

fn optimized() -> (Graph, NodeId, pipelet_core::id::SubscriptionId) {
    let config = GraphConfig::default();
    let mut g = Graph::new(config.clone());
    let src = g.add_node("src", Box::new(Passthrough)).unwrap();
    let opt = g
        .add_node(
            "opt",
            Box::new(Optimize::from_options(&serde_json::Value::Null, &config).unwrap()),
        )
        .unwrap();
    g.connect(src, opt).unwrap();
    let sub = g.subscribe(opt, Query::everything()).unwrap();
    (g, src, sub)
}

#[test]
fn test_remove_then_add_of_one_identity_is_one_update() {
    let (mut g, src, sub) = optimized();
    let tx = TxBuilder::new();
    for op in tx.stamp(vec![
        Operation::remove(vs(json!([{"id": 1, "v": "a"}]))),
        Operation::add(vs(json!([{"id": 1, "v": "b"}, {"id": 2}]))),
    ]) {
        g.submit(src, op).unwrap();
    }

    let got = g.take_received(sub);
    let changes: Vec<Change> = got.iter().map(|o| o.change.clone()).collect();
    assert_eq!(
        changes,
        vec![
            Change::Update { values: vec![(v(json!({"id": 1, "v": "a"})), v(json!({"id": 1, "v": "b"})))] },
            Change::Add { values: vs(json!([{"id": 2}])) },
        ]
    );
    assert!(got[0].tx().unwrap().more);
    assert!(got[1].closes_tx());
}

#[test]
fn test_equal_remove_and_add_cancel_out() {
    let (mut g, src, sub) = optimized();
    let tx = TxBuilder::new();
    let same = v(json!({"id": 1, "v": "a"}));
    for op in tx.stamp(vec![
        Operation::remove(vec![same.clone()]),
        Operation::add(vec![same]),
    ]) {
        g.submit(src, op).unwrap();
    }

    let got = g.take_received(sub);
    assert_eq!(got.len(), 1);
    assert!(got[0].is_empty());
    assert!(got[0].closes_tx());
}

#[test]
fn test_operations_without_transaction_are_not_held() {
    let (mut g, src, sub) = optimized();
    g.submit(src, Operation::add(vs(json!([{"id": 1}])))).unwrap();
    assert_eq!(g.take_received(sub).len(), 1);
}
