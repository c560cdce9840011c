//! Integration tests for multi-hop relay between peers that refuse each other.
//!
//! Topologies are built over loopback TCP. The central scenario: N1 is a
//! seed, N2 and N3 blacklist each other and both join through N1, so every
//! message between them has to be relayed by N1.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test relay_bridging -- --nocapture

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use meshgate::{
    AdmissionPolicy, Candidate, Delivery, Identity, InboundMessage, Middleware, NetError, Node,
    NodeConfig, Verdict,
};
use tokio::time::timeout;

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const SETTLE: Duration = Duration::from_millis(300);

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

fn has_neighbor(node: &Node, identity: Identity) -> bool {
    node.neighbors().iter().any(|n| n.identity == identity)
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Counts requests answered by a node's handler.
fn counting_handler(node: &Node, reply: &'static [u8]) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    node.set_request_handler(move |_, _| {
        c.fetch_add(1, Ordering::SeqCst);
        reply.to_vec()
    });
    count
}

struct Bridged {
    n1: Node,
    n2: Node,
    n3: Node,
}

/// N1 seed; N2 and N3 blacklist each other and join through N1.
async fn bridged_triangle() -> Bridged {
    init_tracing();
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
    wait_until("n1 to admit n2", || has_neighbor(&n1, id2)).await;
    n3.join(&addr(&n1)).await.expect("n3 join failed");
    wait_until("n1 to admit n3", || has_neighbor(&n1, id3)).await;

    Bridged { n1, n2, n3 }
}

// ============================================================================
// Admission exclusivity
// ============================================================================

#[tokio::test]
async fn blacklisted_peers_never_link_directly() {
    let net = bridged_triangle().await;
    tokio::time::sleep(SETTLE).await;

    assert!(!has_neighbor(&net.n2, net.n3.identity()));
    assert!(!has_neighbor(&net.n3, net.n2.identity()));
    assert_eq!(net.n1.neighbors().len(), 2);
}

#[tokio::test]
async fn one_sided_blacklist_still_refuses_introduction() {
    init_tracing();
    let id3 = Identity::random();
    let n1 = test_node().await;
    let n2 = test_node_with(NodeConfig {
        blacklist: vec![id3],
        ..NodeConfig::default()
    })
    .await;
    let n3 = test_node_with(NodeConfig {
        identity: Some(id3),
        ..NodeConfig::default()
    })
    .await;

    n2.join(&addr(&n1)).await.expect("n2 join failed");
    wait_until("n1 to admit n2", || has_neighbor(&n1, n2.identity())).await;

    // N1 introduces N2 to N3; N3 dials N2, which refuses.
    n3.join(&addr(&n1)).await.expect("n3 join failed");
    tokio::time::sleep(SETTLE).await;

    assert!(!has_neighbor(&n2, id3));
    assert!(!has_neighbor(&n3, n2.identity()));
}

#[tokio::test]
async fn join_links_introduced_peers_when_permitted() {
    init_tracing();
    let n1 = test_node().await;
    let n2 = test_node().await;
    let n3 = test_node().await;

    n2.join(&addr(&n1)).await.expect("n2 join failed");
    wait_until("n1 to admit n2", || has_neighbor(&n1, n2.identity())).await;
    n3.join(&addr(&n1)).await.expect("n3 join failed");

    assert!(has_neighbor(&n3, n2.identity()), "seed introduction should link n3 to n2");
    wait_until("n2 to admit n3", || has_neighbor(&n2, n3.identity())).await;
}

/// Counts how often the gate is asked about one known identity.
struct CountKnown {
    target: Identity,
    seen: Arc<AtomicUsize>,
}

impl AdmissionPolicy for CountKnown {
    fn evaluate(&self, candidate: &Candidate<'_>) -> Verdict {
        if let Candidate::Known(contact) = candidate
            && contact.identity == self.target
        {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
        Verdict::PERMIT
    }
}

#[tokio::test]
async fn introduced_peer_is_evaluated_once() {
    init_tracing();
    let n1 = test_node().await;
    let n2 = test_node().await;
    let n3 = test_node().await;

    n2.join(&addr(&n1)).await.expect("n2 join failed");
    wait_until("n1 to admit n2", || has_neighbor(&n1, n2.identity())).await;

    let evaluations = Arc::new(AtomicUsize::new(0));
    n3.apply_middleware(Middleware::WillConnect(Arc::new(CountKnown {
        target: n2.identity(),
        seen: evaluations.clone(),
    })));
    n3.join(&addr(&n1)).await.expect("n3 join failed");

    assert!(has_neighbor(&n3, n2.identity()));
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Bridged delivery
// ============================================================================

#[tokio::test]
async fn sync_send_is_answered_by_destination_not_bridge() {
    let net = bridged_triangle().await;
    let bridge_answers = counting_handler(&net.n1, b"wrong node");
    let target_answers = counting_handler(&net.n3, b"Message received");

    let reply = timeout(TEST_TIMEOUT, net.n2.send_sync(net.n3.identity(), b"hello".to_vec()))
        .await
        .expect("send_sync timed out")
        .expect("send_sync failed");

    assert_eq!(reply.replier, net.n3.identity());
    assert_eq!(reply.payload, b"Message received");
    assert_eq!(target_answers.load(Ordering::SeqCst), 1);
    assert_eq!(bridge_answers.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bridge_never_delivers_relayed_payloads_locally() {
    let net = bridged_triangle().await;
    let observed = Arc::new(AtomicUsize::new(0));
    let o = observed.clone();
    net.n1
        .apply_middleware(Middleware::MessageReceived(Arc::new(move |_: &InboundMessage| {
            o.fetch_add(1, Ordering::SeqCst);
            true
        })));
    let mut n3_inbox = net.n3.messages().await.expect("messages already taken");

    net.n2
        .send_sync(net.n3.identity(), b"request".to_vec())
        .await
        .expect("send_sync failed");
    net.n2
        .send_oneway(net.n3.identity(), b"note".to_vec())
        .expect("send_oneway failed");

    let message = timeout(TEST_TIMEOUT, n3_inbox.recv())
        .await
        .expect("no one-way message")
        .expect("channel closed");
    assert_eq!(message.delivery, Delivery::OneWay);
    assert_eq!(message.source, net.n2.identity());

    tokio::time::sleep(SETTLE).await;
    assert_eq!(observed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn replies_flow_in_both_directions() {
    let net = bridged_triangle().await;
    counting_handler(&net.n2, b"from n2");
    counting_handler(&net.n3, b"from n3");

    let to_n3 = net.n2.send_sync(net.n3.identity(), b"hi".to_vec()).await.expect("n2->n3 failed");
    let to_n2 = net.n3.send_sync(net.n2.identity(), b"hi".to_vec()).await.expect("n3->n2 failed");
    assert_eq!(to_n3.payload, b"from n3");
    assert_eq!(to_n2.payload, b"from n2");
}

#[tokio::test]
async fn concurrent_requests_are_correlated_across_relay() {
    let net = bridged_triangle().await;
    net.n3.set_request_handler(|_, request| request);
    let n2 = Arc::new(net.n2);
    let target = net.n3.identity();

    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let sender = n2.clone();
        tasks.push(tokio::spawn(async move {
            let payload = vec![i; 8];
            let reply = sender.send_sync(target, payload.clone()).await;
            (payload, reply)
        }));
    }

    for task in tasks {
        let (payload, reply) = timeout(TEST_TIMEOUT, task)
            .await
            .expect("request timed out")
            .expect("task panicked");
        let reply = reply.expect("send_sync failed");
        assert_eq!(reply.payload, payload, "each caller gets its own reply");
        assert_eq!(reply.replier, target);
    }
    assert_eq!(n2.pending_requests(), 0);
}

// ============================================================================
// Loop freedom and hop budget
// ============================================================================

#[tokio::test]
async fn ring_delivers_each_request_once() {
    init_tracing();
    let a = test_node().await;
    let b = test_node().await;
    let c = test_node().await;
    let d = test_node().await;

    // A - B - C - D - A
    a.connect(&addr(&b)).await.expect("a->b failed");
    b.connect(&addr(&c)).await.expect("b->c failed");
    c.connect(&addr(&d)).await.expect("c->d failed");
    d.connect(&addr(&a)).await.expect("d->a failed");
    wait_until("ring to settle", || {
        [&a, &b, &c, &d].iter().all(|n| n.neighbors().len() == 2)
    })
    .await;

    let answers = counting_handler(&c, b"ok");
    let reply = timeout(TEST_TIMEOUT, a.send_sync(c.identity(), b"around".to_vec()))
        .await
        .expect("send_sync timed out")
        .expect("send_sync failed");
    assert_eq!(reply.replier, c.identity());

    // The request reaches C over both arcs of the ring; only one copy counts.
    tokio::time::sleep(SETTLE).await;
    assert_eq!(answers.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn spent_hop_budget_surfaces_as_timeout() {
    init_tracing();
    let a = test_node_with(NodeConfig {
        max_hops: 1,
        ..NodeConfig::default()
    })
    .await;
    let b = test_node().await;
    let c = test_node().await;

    // A - B - C: reaching C takes two hops.
    a.connect(&addr(&b)).await.expect("a->b failed");
    b.connect(&addr(&c)).await.expect("b->c failed");
    wait_until("line to settle", || b.neighbors().len() == 2).await;
    let answers = counting_handler(&c, b"unreachable");

    let result = a
        .send_sync_with_timeout(c.identity(), b"far".to_vec(), Duration::from_millis(500))
        .await;
    let err = result.expect_err("request should not be answered");
    assert!(err.is_timeout());
    assert_eq!(answers.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_link_is_routed_around() {
    init_tracing();
    let a = test_node().await;
    let b = test_node().await;
    let c = test_node().await;
    let d = test_node().await;

    // Two paths from A to C: through B and through D.
    a.connect(&addr(&b)).await.expect("a->b failed");
    b.connect(&addr(&c)).await.expect("b->c failed");
    a.connect(&addr(&d)).await.expect("a->d failed");
    d.connect(&addr(&c)).await.expect("d->c failed");
    wait_until("paths to settle", || c.neighbors().len() == 2).await;
    counting_handler(&c, b"still here");

    b.shutdown().await;
    wait_until("a to drop b", || !has_neighbor(&a, b.identity())).await;

    let reply = timeout(TEST_TIMEOUT, a.send_sync(c.identity(), b"detour".to_vec()))
        .await
        .expect("send_sync timed out")
        .expect("send_sync failed");
    assert_eq!(reply.payload, b"still here");
}

#[tokio::test]
async fn isolated_originator_fails_fast() {
    let a = test_node().await;
    let result = a.send_sync(Identity::random(), b"hello".to_vec()).await;
    assert_eq!(result, Err(NetError::RouteExhausted));
}
