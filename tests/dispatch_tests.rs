//! Dispatcher branches: creation from control values, gathering and teardown.

mod common;

use common::{q, vs};
use pipelet_core::config::GraphConfig;
use pipelet_core::id::NodeId;
use pipelet_core::{Key, Operation, TxId, TxMeta, Value};
use pipelet_dispatch::{Branch, DispatchError, Dispatcher, NodeRef};
use pipelet_operators::map::{Map, MapOptions};
use pipelet_operators::set::Set;
use pipelet_operators::union::Union;
use pipelet_operators::Graph;
use pipelet_query::Query;
use serde_json::json;

struct Setup {
    g: Graph,
    source: NodeId,
    control: NodeId,
    gather: NodeId,
    dispatch: NodeId,
}

fn setup(dispatcher: impl FnOnce(NodeId, NodeId) -> Dispatcher) -> Setup {
    let mut g = Graph::new(GraphConfig::default());
    let source = g
        .add_node("source", Box::new(Set::new(Key::default(), Query::everything())))
        .unwrap();
    let control = g
        .add_node("control", Box::new(Set::new(Key::default(), Query::everything())))
        .unwrap();
    let gather = g.add_node("gather", Box::new(Union::new(None))).unwrap();
    let dispatch = g
        .add_node("dispatch", Box::new(dispatcher(source, gather)))
        .unwrap();
    g.connect(control, dispatch).unwrap();
    Setup {
        g,
        source,
        control,
        gather,
        dispatch,
    }
}

fn views_only(source: NodeId, gather: NodeId) -> Dispatcher {
    let builder = |_: &mut Graph, view: NodeId, _: &Value, _: &str| -> pipelet_dispatch::Result<Branch> {
        Ok(Branch::view_only(view))
    };
    Dispatcher::new(NodeRef::Id(source), Key::default(), Box::new(builder)).gather_into(NodeRef::Id(gather))
}

fn owner_control(id: &str) -> serde_json::Value {
    json!({"id": id, "query": [{"owner": ["$", ".id"]}]})
}

#[test]
fn test_branch_per_control_value_reaches_gatherer() {
    let mut s = setup(views_only);
    let sub = s.g.subscribe(s.gather, Query::everything()).unwrap();

    s.g.submit(s.control, Operation::add(vs(json!([owner_control("ann")]))))
        .unwrap();
    assert_eq!(s.g.get::<Dispatcher>(s.dispatch).unwrap().branch_count(), 1);
    assert!(s.g.node_id("dispatch/0/view").is_some());

    s.g.submit(
        s.source,
        Operation::add(vs(json!([{"id": 1, "owner": "ann"}, {"id": 2, "owner": "bob"}]))),
    )
    .unwrap();
    let got = s.g.take_received(sub);
    assert_eq!(got, vec![Operation::add(vs(json!([{"id": 1, "owner": "ann"}])))]);
}

#[test]
fn test_teardown_restores_subscription_counts() {
    let mut s = setup(views_only);
    s.g.subscribe(s.gather, Query::everything()).unwrap();
    let baseline = s.g.subscription_count(s.source);

    s.g.submit(
        s.control,
        Operation::add(vs(json!([owner_control("ann"), owner_control("bob")]))),
    )
    .unwrap();
    assert_eq!(s.g.subscription_count(s.source), baseline + 2);
    assert_eq!(s.g.upstream_query(s.source).unwrap(), &Query::everything());

    s.g.submit(s.control, Operation::remove(vs(json!([owner_control("ann")]))))
        .unwrap();
    assert_eq!(s.g.subscription_count(s.source), baseline + 1);
    assert!(s.g.node_id("dispatch/0/view").is_none());

    s.g.submit(s.control, Operation::clear()).unwrap();
    assert_eq!(s.g.subscription_count(s.source), baseline);
    assert_eq!(s.g.get::<Dispatcher>(s.dispatch).unwrap().branch_count(), 0);
    assert!(s.g.inputs(s.gather).is_empty());
}

#[test]
fn test_existing_control_values_are_dispatched_on_connect() {
    let mut g = Graph::new(GraphConfig::default());
    let source = g
        .add_node("source", Box::new(Set::new(Key::default(), Query::everything())))
        .unwrap();
    let control = g
        .add_node("control", Box::new(Set::new(Key::default(), Query::everything())))
        .unwrap();
    g.submit(control, Operation::add(vs(json!([{"id": "a"}, {"id": "b"}]))))
        .unwrap();

    let builder = |_: &mut Graph, view: NodeId, _: &Value, _: &str| -> pipelet_dispatch::Result<Branch> {
        Ok(Branch::view_only(view))
    };
    let d = g
        .add_node(
            "dispatch",
            Box::new(Dispatcher::new(NodeRef::Name("source".into()), Key::default(), Box::new(builder))),
        )
        .unwrap();
    g.connect(control, d).unwrap();
    assert_eq!(g.get::<Dispatcher>(d).unwrap().branch_count(), 2);
    assert_eq!(g.outputs(source).len(), 2);
}

#[test]
fn test_repeated_control_add_builds_one_branch() {
    let mut s = setup(views_only);
    assert_eq!(s.g.get::<Dispatcher>(s.dispatch).unwrap().branch_count(), 0);

    s.g.submit(s.dispatch, Operation::add(vs(json!([owner_control("ann")]))))
        .unwrap();
    s.g.submit(s.dispatch, Operation::add(vs(json!([owner_control("ann")]))))
        .unwrap();
    assert_eq!(s.g.get::<Dispatcher>(s.dispatch).unwrap().branch_count(), 1);
    assert_eq!(s.g.outputs(s.source).len(), 1);
}

#[test]
fn test_failed_branch_is_skipped_and_cleaned_up() {
    let failing = |source: NodeId, gather: NodeId| {
        let builder = |g: &mut Graph, view: NodeId, control: &Value, prefix: &str| -> pipelet_dispatch::Result<Branch> {
            let map = Map::new(MapOptions::default());
            let m = g.add_node(format!("{}/map", prefix), Box::new(map))?;
            g.connect(view, m)?;
            if control.get("broken").is_some() {
                return Err(DispatchError::Build("broken control value".into()));
            }
            Ok(Branch {
                output: m,
                nodes: vec![m],
            })
        };
        Dispatcher::new(NodeRef::Id(source), Key::default(), Box::new(builder)).gather_into(NodeRef::Id(gather))
    };
    let mut s = setup(failing);

    s.g.submit(
        s.control,
        Operation::add(vs(json!([{"id": "x", "broken": true}, {"id": "y"}]))),
    )
    .unwrap();

    let d = s.g.get::<Dispatcher>(s.dispatch).unwrap();
    assert_eq!(d.failures(), 1);
    assert_eq!(d.branch_count(), 1);
    assert!(s.g.node_id("dispatch/0/view").is_none());
    assert!(s.g.node_id("dispatch/0/map").is_none());
    assert!(s.g.node_id("dispatch/1/map").is_some());
    assert_eq!(s.g.inputs(s.gather).len(), 1);
}

#[test]
fn test_control_update_rebuilds_the_branch() {
    let mut s = setup(views_only);
    let sub = s.g.subscribe(s.gather, Query::everything()).unwrap();
    let old = json!({"id": "c", "query": [{"owner": "ann"}]});
    let new = json!({"id": "c", "query": [{"owner": "bob"}]});
    s.g.submit(s.control, Operation::add(vs(old.clone()))).unwrap();
    s.g.submit(
        s.control,
        Operation::update(vec![(common::v(old), common::v(new))]),
    )
    .unwrap();

    let d = s.g.get::<Dispatcher>(s.dispatch).unwrap();
    assert_eq!(d.branch_count(), 1);
    assert!(s.g.node_id("dispatch/1/view").is_some());
    assert_eq!(
        s.g.upstream_query(s.g.node_id("dispatch/1/view").unwrap()).unwrap(),
        &q(json!([{"owner": "bob"}]))
    );

    s.g.submit(s.source, Operation::add(vs(json!([{"id": 1, "owner": "ann"}, {"id": 2, "owner": "bob"}]))))
        .unwrap();
    assert_eq!(
        s.g.take_received(sub),
        vec![Operation::add(vs(json!([{"id": 2, "owner": "bob"}])))]
    );
}

#[test]
fn test_closing_transaction_settles_in_loop_mode() {
    let mut s = setup(|source, gather| views_only(source, gather).looping());
    let sub = s.g.subscribe(s.gather, Query::everything()).unwrap();
    s.g.submit(s.control, Operation::add(vs(json!([{"id": "a"}]))))
        .unwrap();

    let tx = TxMeta::new(TxId::new("t"), false);
    s.g.submit(s.source, Operation::add(vs(json!([{"id": 1}]))).with_tx(tx))
        .unwrap();

    assert_eq!(s.g.get::<Set>(s.source).unwrap().len(), 1);
    let got = s.g.take_received(sub);
    assert_eq!(got.len(), 1);
    assert!(got[0].closes_tx());
}

#[test]
fn test_forked_transaction_is_rejoined_once() {
    let mut s = setup(|source, gather| views_only(source, gather).fork_tag("dispatch"));
    let sub = s.g.subscribe(s.gather, Query::everything()).unwrap();
    s.g.submit(s.control, Operation::add(vs(json!([{"id": "a"}, {"id": "b"}]))))
        .unwrap();
    assert_eq!(s.g.inputs(s.gather).len(), 2);
    let join = s.g.get::<Union>(s.gather).unwrap().coordinator().unwrap();
    assert_eq!(join.tag(), Some("dispatch"));

    let tx = TxMeta::new(TxId::new("t"), false);
    s.g.submit(s.source, Operation::add(vs(json!([{"id": 1}]))).with_tx(tx))
        .unwrap();

    let got = s.g.take_received(sub);
    assert_eq!(got.iter().filter(|o| o.closes_tx()).count(), 1);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].change, pipelet_core::Change::Add { values: vs(json!([{"id": 1}])) });
    assert!(got[0].tx().unwrap().forks.is_empty());
}
