//! End-to-end: a broadcast crosses two hops and is delivered exactly
//! once at the far end.

mod common;

use std::time::Duration;

use common::{free_port, spin_up, wait_until};
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_crosses_two_hops_exactly_once() {
    let network_id = Uuid::new_v4();
    let port_a = free_port();
    let port_b = free_port();
    let port_c = free_port();

    // A — B — C, a line. A and C never dial each other directly, so the
    // only way a message reaches C is by crossing B.
    let node_a = spin_up("two-hop-a", network_id, port_a, None).await;
    let node_b = spin_up("two-hop-b", network_id, port_b, Some(port_a)).await;

    wait_until(Duration::from_secs(10), || (!node_b.get_peer_list().is_empty()).then_some(())).await;

    let node_c = spin_up("two-hop-c", network_id, port_c, Some(port_b)).await;

    wait_until(Duration::from_secs(10), || (!node_c.get_peer_list().is_empty()).then_some(())).await;
    wait_until(Duration::from_secs(10), || (node_b.get_peer_list().len() == 2).then_some(())).await;

    node_a.broadcast(b"hello mesh".to_vec()).await;

    let delivered = tokio::time::timeout(Duration::from_secs(5), node_c.read_message())
        .await
        .expect("message should cross both hops within the deadline")
        .expect("delivery channel should not close");
    assert_eq!(delivered, b"hello mesh");

    // On this topology there is exactly one path from A to C; a second
    // delivery at C would mean the dedup gate let the same message
    // through twice.
    let second = tokio::time::timeout(Duration::from_millis(300), node_c.read_message()).await;
    assert!(second.is_err(), "the same broadcast must not be delivered twice");
}
