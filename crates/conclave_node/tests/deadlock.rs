//! Cross-node deadlock detection over merged wait-for graphs.

mod common;

use common::{eventually, TestCluster, CONVERGE_TIMEOUT};
use serial_test::serial;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn cross_node_deadlock_aborts_exactly_one_transaction() {
    let cluster = TestCluster::launch(3);
    cluster.create_table_all("t");

    cluster.put(1, "t", b"a", b"base").await.expect("seed a");
    cluster.put(2, "t", b"b", b"base").await.expect("seed b");
    cluster.wait_for_value(1, "t", b"b", Some(b"base")).await;
    cluster.wait_for_value(2, "t", b"a", Some(b"base")).await;

    // T1 on node 1 locks a then touches b; T2 on node 2 locks b then
    // touches a. Their replicated writes collide on each other's held rows
    // at apply time.
    let mut t1 = cluster.node(1).begin().expect("begin t1");
    t1.update("t", b"a", b"t1").await.expect("t1 locks a");
    let mut t2 = cluster.node(2).begin().expect("begin t2");
    t2.update("t", b"b", b"t2").await.expect("t2 locks b");

    t1.update("t", b"b", b"t1").await.expect("t1 touches b locally");
    t2.update("t", b"a", b"t2").await.expect("t2 touches a locally");

    let (r1, r2) = tokio::join!(t1.commit(), t2.commit());

    let aborted = [r1.is_err(), r2.is_err()].iter().filter(|e| **e).count();
    assert_eq!(
        aborted, 1,
        "exactly one of the deadlocked transactions must abort (t1: {r1:?}, t2: {r2:?})"
    );

    // The survivor's writes converge everywhere.
    let winner = if r1.is_ok() { b"t1" } else { b"t2" };
    for node in [1, 2, 3] {
        cluster.wait_for_value(node, "t", b"a", Some(winner)).await;
        cluster.wait_for_value(node, "t", b"b", Some(winner)).await;
    }

    // No transaction is left in doubt.
    for node in [1, 2, 3] {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            cluster.node(node).prepared_gids().is_empty()
        })
        .await;
        assert!(ok, "node {node} left a transaction in doubt");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn lock_graph_dump_shows_cross_node_edges() {
    // Long deadlock timeout: this test wants the wait, not the abort.
    let cluster =
        TestCluster::launch_with(2, |cfg| cfg.deadlock_timeout = std::time::Duration::from_secs(5));
    cluster.create_table_all("t");
    cluster.put(1, "t", b"row", b"base").await.expect("seed");
    cluster.wait_for_value(2, "t", b"row", Some(b"base")).await;

    // A local writer holds the row while a remote transaction tries to
    // apply an update to it.
    let mut holder = cluster.node(1).begin().expect("begin holder");
    holder.update("t", b"row", b"held").await.expect("hold the row");

    let writer = {
        let cluster_node = cluster.node(2);
        tokio::spawn(async move {
            let mut session = cluster_node.begin()?;
            session.update("t", b"row", b"contender").await?;
            session.commit().await?;
            Ok::<(), anyhow::Error>(())
        })
    };

    // The contention must surface in node 1's wait-for graph.
    let ok = eventually(CONVERGE_TIMEOUT, || async {
        !cluster.node(1).dump_lock_graph().edges.is_empty()
    })
    .await;
    assert!(ok, "wait-for edge never appeared");

    holder.rollback();
    writer.await.expect("join").expect("contender commits after release");
    cluster.wait_for_value(1, "t", b"row", Some(b"contender")).await;
}
