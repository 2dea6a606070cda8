//! The async runtime loop: transport pumping and transaction timers.

mod common;

use std::time::Duration;

use common::{q, vs};
use pipelet_core::config::GraphConfig;
use pipelet_core::{Key, Operation, TxId, TxMeta};
use pipelet_crossover::{memory_pair, Role};
use pipelet_exec::Runtime;
use pipelet_operators::cache::Cache;
use pipelet_operators::passthrough::Passthrough;
use pipelet_operators::set::Set;
use pipelet_operators::union::Union;
use pipelet_query::Query;
use pipelet_tx::TxState;
use serde_json::json;
use tokio::sync::oneshot;

const ADDRESS: &str = "memory://loop";

fn config() -> GraphConfig {
    GraphConfig {
        tick_interval_ms: 5,
        ..GraphConfig::default()
    }
}

fn server() -> Runtime {
    let mut rt = Runtime::new(config());
    rt.add_node("source", Box::new(Set::new(Key::default(), Query::everything())))
        .unwrap();
    rt.crossover(ADDRESS, Role::Server).unwrap();
    rt.connect("source", &format!("crossover:{}", ADDRESS)).unwrap();
    rt
}

fn client() -> Runtime {
    let mut rt = Runtime::new(config());
    rt.crossover(ADDRESS, Role::Client).unwrap();
    rt.add_node(
        "orders",
        Box::new(Cache::new(Key::default(), q(json!([{"flow": "orders"}])))),
    )
    .unwrap();
    rt.connect(&format!("crossover:{}", ADDRESS), "orders").unwrap();
    rt
}

/// Run both runtimes side by side for `ms` milliseconds.
async fn run_for(c: &mut Runtime, s: &mut Runtime, ms: u64) {
    let (stop_c, shutdown_c) = oneshot::channel();
    let (stop_s, shutdown_s) = oneshot::channel();
    let timer = async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let _ = stop_c.send(());
        let _ = stop_s.send(());
    };
    let (rc, rs, ()) = tokio::join!(c.run(shutdown_c), s.run(shutdown_s), timer);
    rc.unwrap();
    rs.unwrap();
}

#[tokio::test]
async fn test_run_pumps_remote_pushes() {
    let (mut c, mut s) = (client(), server());
    let (a, b) = memory_pair();
    c.attach_crossover(ADDRESS, Box::new(a)).unwrap();
    s.attach_crossover(ADDRESS, Box::new(b)).unwrap();
    run_for(&mut c, &mut s, 60).await;

    s.submit(
        "source",
        Operation::add(vs(json!([{"id": 1, "flow": "orders"}, {"id": 2, "flow": "users"}]))),
    )
    .unwrap();
    run_for(&mut c, &mut s, 60).await;

    let id = c.node("orders").unwrap();
    let cache = c.graph().get::<Cache>(id).unwrap();
    assert_eq!(cache.values(), vs(json!([{"id": 1, "flow": "orders"}])));
}

#[tokio::test]
async fn test_run_cancels_overdue_transactions() {
    let (mut c, mut s) = (client(), server());
    c.add_node("feed", Box::new(Passthrough)).unwrap();
    let union = Union::from_options(&json!({"tag": "split", "timeout_ms": 10}), c.config()).unwrap();
    c.add_node("join", Box::new(union)).unwrap();
    c.connect("feed", "join").unwrap();
    let sub = c.subscribe("join", Query::everything()).unwrap();

    let open = TxMeta::new(TxId::new("slow"), true).with_fork("split");
    c.submit("feed", Operation::add(vs(json!([{"id": 1}]))).with_tx(open))
        .unwrap();
    assert!(c.take_received(sub).is_empty());

    run_for(&mut c, &mut s, 60).await;

    let id = c.node("join").unwrap();
    let join = c.graph().get::<Union>(id).unwrap().coordinator().unwrap();
    assert_eq!(join.state(&TxId::new("slow")), Some(TxState::Cancelled));
    let got = c.take_received(sub);
    assert_eq!(got.len(), 1);
    assert!(got[0].is_empty() && got[0].closes_tx());
}
