//! Clique computation under a network split.

mod common;

use common::{eventually, TestCluster, CONVERGE_TIMEOUT};
use serial_test::serial;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn five_node_split_disables_the_minority() {
    let cluster = TestCluster::launch(5);
    cluster.create_table_all("t");

    cluster.put(1, "t", b"seed", b"0").await.expect("seed write");
    for node in 2..=5 {
        cluster.wait_for_value(node, "t", b"seed", Some(b"0")).await;
    }

    // Split {1,2} from {3,4,5}.
    cluster.faults.partition(&[1, 2], &[3, 4, 5]);

    // The majority agrees on a clique that excludes the minority.
    for node in [3, 4, 5] {
        cluster.wait_for_disabled_mask(node, 0b00011).await;
        cluster.wait_for_status(node, "online").await;
    }

    // The minority refuses writes.
    for node in [1, 2] {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            let state = cluster.node(node).get_cluster_state();
            state.status != "online"
        })
        .await;
        assert!(ok, "minority node {node} still accepts writes");
        let err = cluster.put(node, "t", b"minority", b"x").await;
        assert!(err.is_err(), "write on minority node {node} must fail");
    }

    // The majority keeps committing.
    cluster.put(3, "t", b"2", b"20").await.expect("majority write");
    cluster.wait_for_value(4, "t", b"2", Some(b"20")).await;
    cluster.wait_for_value(5, "t", b"2", Some(b"20")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn exactly_half_reachable_means_minority() {
    // A node that can see exactly floor(N/2) peers (itself plus one out of
    // four) is in the minority.
    let cluster = TestCluster::launch(4);
    cluster.create_table_all("t");

    cluster.faults.partition(&[1, 2], &[3, 4]);
    for node in [1, 2, 3, 4] {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            cluster.node(node).get_cluster_state().status != "online"
        })
        .await;
        assert!(ok, "node {node} must lose quorum in an even split");
    }
}
