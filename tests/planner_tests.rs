//! YAML graph files end to end: parse, check, build and run.

mod common;

use common::vs;
use pipelet_core::config::GraphConfig;
use pipelet_core::{Change, Operation};
use pipelet_exec::{ExecError, Runtime};
use pipelet_planner::{explain, parse_yaml_graph, PlanError};

const ORDERS: &str = r#"
config:
  tx_timeout_ms: 1000
nodes:
  - { name: source, pipelet: set }
  - name: orders
    pipelet: filter
    inputs: [source]
    options: { query: [ { flow: orders } ] }
  - name: renamed
    pipelet: map
    inputs: [orders]
    options: { rename: { amount: total } }
  - { name: store, pipelet: cache, inputs: [renamed] }
subscriptions:
  - { node: store }
"#;

fn build(src: &str) -> Runtime {
    let plan = parse_yaml_graph(src).unwrap();
    let mut rt = Runtime::new(plan.graph_config(GraphConfig::default()));
    rt.build(&plan).unwrap();
    rt
}

#[test]
fn test_yaml_graph_runs() {
    let mut rt = build(ORDERS);
    assert_eq!(rt.config().tx_timeout_ms, Some(1000));

    rt.submit(
        "source",
        Operation::add(vs(json_values())),
    )
    .unwrap();

    let stored = rt.fetch_all("store", &pipelet_query::Query::everything()).unwrap();
    assert_eq!(stored, vs(serde_json::json!([{"id": 1, "flow": "orders", "total": 10}])));

    let sub = rt.plan_subscriptions()[0];
    let got = rt.take_received(sub);
    assert_eq!(
        got.last().map(|o| o.change.clone()),
        Some(Change::Add { values: vs(serde_json::json!([{"id": 1, "flow": "orders", "total": 10}])) })
    );
}

fn json_values() -> serde_json::Value {
    serde_json::json!([
        {"id": 1, "flow": "orders", "amount": 10},
        {"id": 2, "flow": "users", "name": "ann"}
    ])
}

#[test]
fn test_initial_values_reach_consumers_built_later() {
    let rt_src = r#"
nodes:
  - name: seed
    pipelet: set
    options: { values: [ { id: 1, flow: orders }, { id: 2, flow: users } ] }
  - { name: store, pipelet: cache, inputs: [seed], options: { query: [ { flow: users } ] } }
"#;
    let mut rt = build(rt_src);
    let stored = rt.fetch_all("store", &pipelet_query::Query::everything()).unwrap();
    assert_eq!(stored, vs(serde_json::json!([{"id": 2, "flow": "users"}])));
}

#[test]
fn test_dispatch_template_from_yaml() {
    let src = r#"
nodes:
  - { name: source, pipelet: set }
  - { name: users, pipelet: set }
  - { name: gather, pipelet: union }
  - name: per_user
    pipelet: dispatch
    inputs: [users]
    options:
      source: source
      gatherer: gather
      branch:
        - name: mine
          pipelet: filter
          inputs: [$source]
          options: { query: [ { owner: "{{id}}" } ] }
subscriptions:
  - { node: gather }
"#;
    let mut rt = build(src);
    rt.submit("users", Operation::add(vs(serde_json::json!([{"id": "ann"}]))))
        .unwrap();
    assert!(rt.node("per_user/0/mine").is_ok());

    rt.submit(
        "source",
        Operation::add(vs(serde_json::json!([
            {"id": 1, "owner": "ann"},
            {"id": 2, "owner": "bob"}
        ]))),
    )
    .unwrap();
    let sub = rt.plan_subscriptions()[0];
    assert_eq!(
        rt.take_received(sub),
        vec![Operation::add(vs(serde_json::json!([{"id": 1, "owner": "ann"}])))]
    );
}

#[test]
fn test_feedback_loop_can_be_declared() {
    let src = r#"
nodes:
  - { name: a, pipelet: passthrough, inputs: [b] }
  - { name: b, pipelet: passthrough, inputs: [a] }
"#;
    let rt = build(src);
    let a = rt.node("a").unwrap();
    let b = rt.node("b").unwrap();
    assert_eq!(rt.graph().inputs(a), &[b]);
    assert_eq!(rt.graph().inputs(b), &[a]);
}

#[test]
fn test_plan_errors() {
    let dup = "nodes: [ { name: a, pipelet: set }, { name: a, pipelet: set } ]";
    assert!(matches!(parse_yaml_graph(dup), Err(PlanError::DuplicateNode(_))));

    let dangling = "nodes: [ { name: a, pipelet: set, inputs: [nope] } ]";
    assert!(matches!(parse_yaml_graph(dangling), Err(PlanError::UnknownInput { .. })));

    let plan = parse_yaml_graph("nodes: [ { name: a, pipelet: teleport } ]").unwrap();
    let mut rt = Runtime::new(GraphConfig::default());
    assert!(matches!(
        rt.build(&plan),
        Err(ExecError::Plan(PlanError::UnknownPipelet { .. }))
    ));

    let plan = parse_yaml_graph("nodes: [ { name: a, pipelet: filter, options: { query: 3 } } ]").unwrap();
    assert!(matches!(rt.build(&plan), Err(ExecError::Graph(_))));
}

#[test]
fn test_explain_lists_nodes_and_edges() {
    let plan = parse_yaml_graph(ORDERS).unwrap();
    let text = explain(&plan);
    assert!(text.contains("orders"));
    assert!(text.contains("source"));

    let rt = build(ORDERS);
    let text = rt.explain();
    assert!(text.contains("store [cache] greedy <- renamed"));
    assert!(text.contains("orders [filter] <- source"));
}
