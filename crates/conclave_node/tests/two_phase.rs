//! Explicit prepared transactions and crash recovery of in-doubt state.

mod common;

use common::{eventually, TestCluster, CONVERGE_TIMEOUT};
use serial_test::serial;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn prepared_transaction_is_in_doubt_until_committed() {
    let cluster = TestCluster::launch(3);
    cluster.create_table_all("t");

    let mut session = cluster.node(1).begin().expect("begin");
    session.insert("t", b"11", b"110").await.expect("insert");
    session.prepare("g1").await.expect("prepare transaction");

    // Every participant holds exactly one prepared transaction.
    for node in [2, 3] {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            cluster.node(node).prepared_gids() == vec!["g1".to_string()]
        })
        .await;
        assert!(ok, "node {node} never prepared g1");
    }

    cluster
        .node(1)
        .finish_prepared_gid("g1", true)
        .await
        .expect("commit prepared");

    cluster.wait_for_value(2, "t", b"11", Some(b"110")).await;
    cluster.wait_for_value(3, "t", b"11", Some(b"110")).await;
    for node in [2, 3] {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            cluster.node(node).prepared_gids().is_empty()
        })
        .await;
        assert!(ok, "node {node} still shows prepared transactions");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn abort_prepared_leaves_no_row_and_no_doubt() {
    let cluster = TestCluster::launch(3);
    cluster.create_table_all("t");

    let mut session = cluster.node(1).begin().expect("begin");
    session.insert("t", b"12", b"120").await.expect("insert");
    session.prepare("g-abort").await.expect("prepare");

    let ok = eventually(CONVERGE_TIMEOUT, || async {
        !cluster.node(2).prepared_gids().is_empty()
    })
    .await;
    assert!(ok, "node 2 never prepared");

    cluster
        .node(1)
        .finish_prepared_gid("g-abort", false)
        .await
        .expect("abort prepared");

    // P5: nobody is left in doubt after the abort propagates.
    for node in [1, 2, 3] {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            cluster.node(node).prepared_gids().is_empty()
        })
        .await;
        assert!(ok, "node {node} left a transaction in doubt");
        cluster.wait_for_value(node, "t", b"12", None).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn commit_prepared_survives_crash_restart() {
    let cluster = TestCluster::launch(3);
    cluster.create_table_all("t");

    let mut session = cluster.node(1).begin().expect("begin");
    session.insert("t", b"13", b"130").await.expect("insert");
    session.prepare("g2").await.expect("prepare");

    let ok = eventually(CONVERGE_TIMEOUT, || async {
        cluster.node(2).prepared_gids() == vec!["g2".to_string()]
            && cluster.node(3).prepared_gids() == vec!["g2".to_string()]
    })
    .await;
    assert!(ok, "peers never prepared g2");

    // Kill two of three nodes with the transaction still in doubt.
    cluster.node(1).stop();
    cluster.node(2).stop();
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    cluster.node(1).restart();
    cluster.node(2).restart();

    cluster
        .node(1)
        .finish_prepared_gid("g2", true)
        .await
        .expect("commit prepared after restart");

    for node in [1, 2, 3] {
        cluster.wait_for_status(node, "online").await;
        cluster.wait_for_value(node, "t", b"13", Some(b"130")).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn injected_prepare_failure_aborts_cleanly() {
    let cluster = TestCluster::launch(3);
    cluster.create_table_all("t");

    cluster.node(1).inject_2pc_error(1);
    let err = cluster.put(1, "t", b"14", b"140").await;
    assert!(err.is_err(), "injected error must fail the commit");

    // The failed transaction left nothing behind and the next one works.
    cluster.put(1, "t", b"14", b"141").await.expect("retry commit");
    cluster.wait_for_value(3, "t", b"14", Some(b"141")).await;
}
