//! Integration tests for broadcast dissemination.
//!
//! These tests validate end-to-end delivery of broadcasts over loopback TCP,
//! including once-per-node delivery in a fully connected mesh.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use meshgate::{Delivery, Identity, InboundMessage, Middleware, Node, NodeConfig};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const MESSAGE_WAIT: Duration = Duration::from_millis(500);

// =============================================================================
// Helper Functions
// =============================================================================

async fn test_node_with(config: NodeConfig) -> Node {
    Node::bind_with_config("127.0.0.1:0", config)
        .await
        .expect("bind failed")
}

async fn test_node() -> Node {
    test_node_with(NodeConfig::default()).await
}

fn addr(node: &Node) -> String {
    node.local_addr().to_string()
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive one broadcast, then check that no further message arrives.
async fn expect_exactly_one(inbox: &mut mpsc::Receiver<InboundMessage>, name: &str) -> InboundMessage {
    let message = timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .unwrap_or_else(|_| panic!("{name} received nothing"))
        .expect("channel closed");
    assert!(
        timeout(MESSAGE_WAIT, inbox.recv()).await.is_err(),
        "{name} received a duplicate"
    );
    message
}

/// Four nodes, every pair directly connected.
async fn full_mesh() -> Vec<Node> {
    let mut nodes = Vec::new();
    for _ in 0..4 {
        nodes.push(test_node().await);
    }
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            nodes[i]
                .connect(&addr(&nodes[j]))
                .await
                .expect("mesh connect failed");
        }
    }
    wait_until("mesh to settle", || nodes.iter().all(|n| n.neighbors().len() == 3)).await;
    nodes
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn full_mesh_delivers_exactly_once_per_node() {
    let nodes = full_mesh().await;
    let mut inboxes = Vec::new();
    for node in &nodes {
        inboxes.push(node.messages().await.expect("messages already taken"));
    }

    let msg_id = nodes[0].broadcast(b"hello mesh".to_vec()).expect("broadcast failed");

    for (i, inbox) in inboxes.iter_mut().enumerate().skip(1) {
        let message = expect_exactly_one(inbox, &format!("node {i}")).await;
        assert_eq!(message.msg_id, msg_id);
        assert_eq!(message.source, nodes[0].identity());
        assert_eq!(message.data, b"hello mesh");
        assert_eq!(message.delivery, Delivery::Broadcast);
    }

    assert!(
        inboxes[0].try_recv().is_err(),
        "originator must not receive its own broadcast"
    );
}

#[tokio::test]
async fn every_node_can_originate() {
    let nodes = full_mesh().await;
    let counts: Vec<Arc<AtomicUsize>> = nodes
        .iter()
        .map(|node| {
            let count = Arc::new(AtomicUsize::new(0));
            let c = count.clone();
            node.apply_middleware(Middleware::MessageReceived(Arc::new(
                move |msg: &InboundMessage| {
                    if msg.delivery == Delivery::Broadcast {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                    true
                },
            )));
            count
        })
        .collect();

    for node in &nodes {
        node.broadcast(node.identity().as_bytes().to_vec())
            .expect("broadcast failed");
    }

    // Each node hears the other three exactly once.
    wait_until("all broadcasts to arrive", || {
        counts.iter().all(|c| c.load(Ordering::SeqCst) >= 3)
    })
    .await;
    tokio::time::sleep(MESSAGE_WAIT).await;
    for count in &counts {
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}

#[tokio::test]
async fn broadcast_crosses_refused_link() {
    let id2 = Identity::random();
    let id3 = Identity::random();
    let n1 = test_node().await;
    let n2 = test_node_with(NodeConfig {
        identity: Some(id2),
        blacklist: vec![id3],
        ..NodeConfig::default()
    })
    .await;
    let n3 = test_node_with(NodeConfig {
        identity: Some(id3),
        blacklist: vec![id2],
        ..NodeConfig::default()
    })
    .await;

    n2.join(&addr(&n1)).await.expect("n2 join failed");
    n3.join(&addr(&n1)).await.expect("n3 join failed");
    wait_until("n1 to admit both", || n1.neighbors().len() == 2).await;

    let mut n1_inbox = n1.messages().await.expect("messages already taken");
    let mut n3_inbox = n3.messages().await.expect("messages already taken");

    n2.broadcast(b"to everyone".to_vec()).expect("broadcast failed");

    let at_n1 = expect_exactly_one(&mut n1_inbox, "n1").await;
    let at_n3 = expect_exactly_one(&mut n3_inbox, "n3").await;
    assert_eq!(at_n1.msg_id, at_n3.msg_id);
    assert_eq!(at_n3.source, id2);
}

#[tokio::test]
async fn broadcast_without_neighbors_is_ok() {
    let node = test_node().await;
    assert!(node.broadcast(b"into the void".to_vec()).is_ok());
}

#[tokio::test]
async fn broadcast_reaches_end_of_long_line() {
    // Twelve nodes in a line: eleven hops, more than the relay budget.
    let mut nodes = Vec::new();
    for _ in 0..12 {
        nodes.push(test_node().await);
    }
    assert!(usize::from(NodeConfig::default().max_hops) < nodes.len() - 1);
    for pair in nodes.windows(2) {
        pair[0].connect(&addr(&pair[1])).await.expect("line connect failed");
    }
    wait_until("line to settle", || {
        nodes[1..nodes.len() - 1].iter().all(|n| n.neighbors().len() == 2)
    })
    .await;

    let mut far_inbox = nodes[11].messages().await.expect("messages already taken");
    let msg_id = nodes[0].broadcast(b"far".to_vec()).expect("broadcast failed");

    let message = expect_exactly_one(&mut far_inbox, "node 11").await;
    assert_eq!(message.msg_id, msg_id);
    assert_eq!(message.source, nodes[0].identity());
    assert_eq!(message.data, b"far");
}
