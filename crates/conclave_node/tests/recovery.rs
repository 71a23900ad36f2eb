//! Minority survival and single-donor recovery.

mod common;

use common::{eventually, TestCluster, CONVERGE_TIMEOUT};
use serial_test::serial;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn cluster_survives_minority_loss_and_recovers_the_node() {
    let cluster = TestCluster::launch(3);
    cluster.create_table_all("t");

    cluster.put(1, "t", b"1", b"10").await.expect("initial insert");
    cluster.wait_for_value(3, "t", b"1", Some(b"10")).await;

    // Stop node 3; the survivors detect it and keep accepting writes.
    cluster.node(3).stop();
    cluster.wait_for_disabled_mask(1, 0b100).await;
    cluster.wait_for_disabled_mask(2, 0b100).await;

    cluster.put(1, "t", b"2", b"20").await.expect("write with node 3 down");
    cluster.wait_for_value(2, "t", b"2", Some(b"20")).await;

    // Node 3 comes back, catches up through one donor and goes online.
    cluster.node(3).restart();
    cluster.wait_for_status(3, "online").await;
    cluster.wait_for_value(3, "t", b"2", Some(b"20")).await;

    // Everyone re-enabled it.
    cluster.wait_for_disabled_mask(1, 0).await;
    cluster.wait_for_disabled_mask(2, 0).await;

    // The recovered node participates in new commits again.
    cluster.put(3, "t", b"3", b"30").await.expect("write on recovered node");
    cluster.wait_for_value(1, "t", b"3", Some(b"30")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn recovery_pulls_from_a_single_donor() {
    let cluster = TestCluster::launch(3);
    cluster.create_table_all("t");

    cluster.node(3).stop();
    cluster.wait_for_disabled_mask(1, 0b100).await;

    for i in 0..20u32 {
        let key = format!("k{i}");
        cluster
            .put(1, "t", key.as_bytes(), b"v")
            .await
            .expect("write while node 3 is down");
    }

    cluster.node(3).restart();
    // While recovering, exactly one donor slot is claimed.
    let saw_single_donor = eventually(CONVERGE_TIMEOUT, || async {
        let state = cluster.node(3).get_cluster_state();
        state.status != "recovery" || state.recovery_slot.is_some()
    })
    .await;
    assert!(saw_single_donor, "recovery never claimed a donor");

    cluster.wait_for_status(3, "online").await;
    for i in 0..20u32 {
        let key = format!("k{i}");
        cluster.wait_for_value(3, "t", key.as_bytes(), Some(b"v")).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn losing_the_majority_refuses_writes() {
    let cluster = TestCluster::launch(3);
    cluster.create_table_all("t");

    cluster.node(2).stop();
    cluster.node(3).stop();
    cluster.wait_for_status(1, "in-minority").await;

    let err = cluster.put(1, "t", b"x", b"1").await;
    let msg = format!("{:#}", err.expect_err("write must be refused"));
    assert!(
        msg.contains("minority"),
        "unexpected refusal message: {msg}"
    );
}
