//! # High-Level Node API
//!
//! A [`Node`] ties the overlay components together behind one handle:
//!
//! - **NeighborTable**: admitted peers and their outbound queues
//! - **AdmissionGate**: blacklist plus operator-registered policies
//! - **Router**: bounded flooding of point-to-point envelopes
//! - **Correlator**: request/reply matching for synchronous sends
//! - **Broadcaster**: once-per-id dissemination to every node
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("127.0.0.1:30001").await?;
//! node.join("127.0.0.1:30000").await?;
//!
//! node.set_request_handler(|from, request| b"Message received".to_vec());
//!
//! let reply = node.send_sync(target, b"hello".to_vec()).await?;
//! println!("{} answered {:?}", reply.replier, reply.payload);
//!
//! let mut rx = node.messages().await?;
//! while let Some(msg) = rx.recv().await {
//!     println!("{:?} from {}", msg.delivery, msg.source);
//! }
//! ```
//!
//! ## Dispatch
//!
//! Frames from a neighbor are handled on that connection's reader task in
//! arrival order. Envelopes addressed to this node are dispatched by kind:
//! requests go to the request handler and a reply is routed back, replies go
//! to the correlator, one-way messages and broadcasts go to the
//! [`messages`](Node::messages) channel. Message hooks observe all three.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::admission::{AdmissionGate, Blacklist, BlacklistPolicy};
use crate::broadcast::{BroadcastOutcome, Broadcaster};
use crate::config::{INBOUND_CHANNEL_CAPACITY, MAINTENANCE_INTERVAL, NodeConfig};
use crate::connection;
use crate::correlator::Correlator;
use crate::error::NetError;
use crate::identity::{Contact, Identity};
use crate::messages::{
    Delivery, Frame, InboundMessage, MessageId, RelayEnvelope, RelayKind, Reply, short_id,
};
use crate::middleware::{Hooks, Middleware};
use crate::neighbors::{NeighborSummary, NeighborTable};
use crate::router::{RouteOutcome, Router};
use crate::transport;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

type RequestHandler = Arc<dyn Fn(Identity, Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Shared state reachable from every connection task.
pub(crate) struct NodeInner {
    pub(crate) contact: Contact,
    pub(crate) config: NodeConfig,
    pub(crate) neighbors: Arc<NeighborTable>,
    pub(crate) blacklist: Arc<Blacklist>,
    pub(crate) gate: AdmissionGate,
    pub(crate) hooks: Hooks,
    router: Router,
    correlator: Arc<Correlator>,
    broadcaster: Broadcaster,
    inbound_tx: mpsc::Sender<InboundMessage>,
    request_handler: RwLock<Option<RequestHandler>>,
    shutdown: watch::Sender<bool>,
}

impl NodeInner {
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Handle a frame received on an established link from `from`.
    pub(crate) fn handle_frame(&self, from: &Identity, frame: Frame) {
        match frame {
            Frame::Relay(envelope) => {
                if let RouteOutcome::Local(envelope) = self.router.relay(envelope, *from) {
                    self.deliver_local(envelope);
                }
            }
            Frame::Broadcast(envelope) => {
                if let BroadcastOutcome::Deliver { envelope, .. } =
                    self.broadcaster.receive(envelope, *from)
                {
                    self.emit(InboundMessage {
                        msg_id: envelope.msg_id,
                        source: envelope.source,
                        data: envelope.payload,
                        delivery: Delivery::Broadcast,
                    });
                }
            }
            other => {
                warn!(
                    peer = %from.short(),
                    frame = other.kind(),
                    "ignoring handshake frame on established link"
                );
            }
        }
    }

    fn deliver_local(&self, envelope: RelayEnvelope) {
        match envelope.kind {
            RelayKind::Request => self.answer(envelope),
            RelayKind::Reply { in_reply_to } => {
                let reply = Reply {
                    payload: envelope.payload,
                    replier: envelope.source,
                };
                if !self.correlator.deliver_reply(&in_reply_to, reply) {
                    debug!(
                        msg_id = %short_id(&in_reply_to),
                        replier = %envelope.source.short(),
                        "discarded late or unknown reply"
                    );
                }
            }
            RelayKind::OneWay => self.emit(InboundMessage {
                msg_id: envelope.msg_id,
                source: envelope.source,
                data: envelope.payload,
                delivery: Delivery::OneWay,
            }),
        }
    }

    fn answer(&self, envelope: RelayEnvelope) {
        let message = InboundMessage {
            msg_id: envelope.msg_id,
            source: envelope.source,
            data: envelope.payload,
            delivery: Delivery::Request,
        };
        self.hooks.message_received(&message);

        let handler = self
            .request_handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let mut response = match handler {
            Some(handler) => handler(message.source, message.data),
            None => Vec::new(),
        };
        if response.len() > self.config.max_payload_size {
            warn!(
                size = response.len(),
                max = self.config.max_payload_size,
                "request handler reply too large, sending empty reply"
            );
            response.clear();
        }

        let reply = RelayEnvelope::new(
            self.contact.identity,
            message.source,
            RelayKind::Reply {
                in_reply_to: message.msg_id,
            },
            response,
            self.config.max_hops,
        );
        let outcome = self.router.originate(reply);
        if !outcome.is_sent() {
            warn!(
                msg_id = %short_id(&message.msg_id),
                to = %message.source.short(),
                "reply could not be routed"
            );
        }
    }

    fn emit(&self, message: InboundMessage) {
        self.hooks.message_received(&message);
        match self.inbound_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!(msg_id = %short_id(&message.msg_id), "inbound channel full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                trace!("inbound receiver dropped");
            }
        }
    }

    fn check_payload(&self, payload: &[u8]) -> Result<(), NetError> {
        if payload.len() > self.config.max_payload_size {
            return Err(NetError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        Ok(())
    }

    /// Originate an envelope. Only a route that left this node counts as
    /// dispatched; anything else fails fast.
    fn dispatch(&self, envelope: RelayEnvelope) -> Result<(), NetError> {
        let msg_id = envelope.msg_id;
        let destination = envelope.destination;
        match self.router.originate(envelope) {
            RouteOutcome::Direct | RouteOutcome::Forwarded(_) => {
                trace!(msg_id = %short_id(&msg_id), to = %destination.short(), "dispatched");
                Ok(())
            }
            RouteOutcome::Local(_) => Err(NetError::InvalidDestination(destination)),
            RouteOutcome::Exhausted | RouteOutcome::NoRoute | RouteOutcome::Duplicate => {
                debug!(to = %destination.short(), "no neighbor can carry the message");
                Err(NetError::RouteExhausted)
            }
        }
    }

    fn prepare(
        &self,
        destination: Identity,
        kind: RelayKind,
        payload: Vec<u8>,
    ) -> Result<RelayEnvelope, NetError> {
        if destination == self.contact.identity {
            return Err(NetError::InvalidDestination(destination));
        }
        self.check_payload(&payload)?;
        Ok(RelayEnvelope::new(
            self.contact.identity,
            destination,
            kind,
            payload,
            self.config.max_hops,
        ))
    }
}

pub struct Node {
    inner: Arc<NodeInner>,
    local_addr: SocketAddr,
    inbound_rx: TakeOnce<InboundMessage>,
    listener: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl Node {
    /// Create a node with a fresh identity and default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, NodeConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, config: NodeConfig) -> Result<Self> {
        let listener = transport::listen(addr).await?;
        let local_addr = listener.local_addr().context("failed to read local address")?;

        let identity = config.identity.unwrap_or_else(Identity::random);
        let contact = Contact::new(identity, local_addr.to_string());

        let neighbors = Arc::new(NeighborTable::new(config.max_neighbors));
        let blacklist = Arc::new(Blacklist::with_entries(config.blacklist.iter().copied()));
        let gate = AdmissionGate::new();
        gate.register(Arc::new(BlacklistPolicy::new(blacklist.clone())));

        let router = Router::new(
            identity,
            neighbors.clone(),
            config.seen_capacity,
            config.seen_ttl,
        );
        let broadcaster = Broadcaster::new(
            identity,
            neighbors.clone(),
            config.broadcast_max_hops,
            config.seen_capacity,
            config.seen_ttl,
        );
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            contact,
            config,
            neighbors,
            blacklist,
            gate,
            hooks: Hooks::new(),
            router,
            correlator: Arc::new(Correlator::new()),
            broadcaster,
            inbound_tx,
            request_handler: RwLock::new(None),
            shutdown,
        });

        let listener = tokio::spawn(connection::serve(inner.clone(), listener));
        let maintenance = tokio::spawn(maintain(inner.clone()));

        info!(
            identity = %identity,
            addr = %local_addr,
            "node listening"
        );

        Ok(Self {
            inner,
            local_addr,
            inbound_rx: tokio::sync::Mutex::new(Some(inbound_rx)),
            listener,
            maintenance,
        })
    }

    pub fn identity(&self) -> Identity {
        self.inner.contact.identity
    }

    pub fn contact(&self) -> &Contact {
        &self.inner.contact
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Open a link to the node listening at `addr`.
    ///
    /// Fails with a downcastable [`NetError::AdmissionDenied`] if either side
    /// refuses the connection.
    pub async fn connect(&self, addr: &str) -> Result<Contact> {
        let dialed = connection::dial(&self.inner, addr, None)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(dialed.contact)
    }

    /// Connect to `seed`, then try a direct link to every neighbor the seed
    /// introduces. Links refused by either side's policy are logged and
    /// skipped.
    pub async fn join(&self, seed: &str) -> Result<Contact> {
        let dialed = connection::dial(&self.inner, seed, None)
            .await
            .with_context(|| format!("failed to join via {seed}"))?;
        info!(
            seed = %dialed.contact.identity.short(),
            introduced = dialed.introduced.len(),
            "joined overlay"
        );

        for contact in &dialed.introduced {
            if contact.identity == self.identity()
                || self.inner.neighbors.contains(&contact.identity)
            {
                continue;
            }
            if self.inner.neighbors.is_full() {
                debug!("neighbor table full, skipping remaining introductions");
                break;
            }
            match connection::dial(&self.inner, &contact.addr, Some(contact)).await {
                Ok(_) => {}
                Err(e) => match e.downcast_ref::<NetError>() {
                    Some(NetError::AdmissionDenied { identity }) => info!(
                        peer = %identity.short(),
                        "direct link refused, traffic will be relayed"
                    ),
                    _ => warn!(
                        peer = %contact.identity.short(),
                        addr = %contact.addr,
                        error = %e,
                        "failed to connect to introduced peer"
                    ),
                },
            }
        }
        Ok(dialed.contact)
    }

    // ========================================================================
    // Operator control surface
    // ========================================================================

    /// Returns `true` if the identity was not already blacklisted.
    pub fn add_blacklist_entry(&self, identity: Identity) -> bool {
        self.inner.blacklist.add(identity)
    }

    pub fn remove_blacklist_entry(&self, identity: &Identity) -> bool {
        self.inner.blacklist.remove(identity)
    }

    /// An unreadable blacklist reports every identity as blacklisted.
    pub fn is_blacklisted(&self, identity: &Identity) -> bool {
        self.inner.blacklist.is_blocked(identity).unwrap_or(true)
    }

    pub fn blacklist(&self) -> Vec<Identity> {
        self.inner.blacklist.entries()
    }

    /// Current neighbors, oldest connection first.
    pub fn neighbors(&self) -> Vec<NeighborSummary> {
        self.inner.neighbors.summaries()
    }

    pub fn apply_middleware(&self, middleware: Middleware) {
        debug!(kind = middleware.kind(), "middleware applied");
        match middleware {
            Middleware::WillConnect(policy) => self.inner.gate.register(policy),
            Middleware::Connected(hook) => self.inner.hooks.add_connected(hook),
            Middleware::MessageReceived(hook) => self.inner.hooks.add_message_received(hook),
        }
    }

    /// Set the function that answers incoming requests, replacing any previous
    /// one. It receives (sender identity, request payload) and returns the
    /// reply payload.
    ///
    /// The handler runs on the reader task of the link the request arrived on,
    /// so it should return quickly. Without a handler requests are answered
    /// with an empty payload.
    pub fn set_request_handler<F>(&self, handler: F)
    where
        F: Fn(Identity, Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        *self
            .inner
            .request_handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(handler));
    }

    /// Take the receiver for one-way messages and broadcasts addressed to
    /// this node. Can be taken once.
    pub async fn messages(&self) -> Result<mpsc::Receiver<InboundMessage>> {
        let mut guard = self.inbound_rx.lock().await;
        guard.take().context("message receiver already taken")
    }

    /// Send a request and wait for the reply using the configured timeout.
    pub async fn send_sync(&self, destination: Identity, payload: Vec<u8>) -> Result<Reply, NetError> {
        self.send_sync_with_timeout(destination, payload, self.inner.config.request_timeout)
            .await
    }

    pub async fn send_sync_with_timeout(
        &self,
        destination: Identity,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Reply, NetError> {
        let mut envelope = self.inner.prepare(destination, RelayKind::Request, payload)?;
        let inner = &self.inner;
        inner
            .correlator
            .send_sync(timeout, |msg_id| {
                envelope.msg_id = msg_id;
                inner.dispatch(envelope)
            })
            .await
    }

    /// Send a request and return its id immediately. `on_reply` runs once with
    /// the reply, or with the error that ended the wait.
    pub fn send_async<F>(
        &self,
        destination: Identity,
        payload: Vec<u8>,
        on_reply: F,
    ) -> Result<MessageId, NetError>
    where
        F: FnOnce(Result<Reply, NetError>) + Send + 'static,
    {
        let mut envelope = self.inner.prepare(destination, RelayKind::Request, payload)?;
        let pending = self.inner.correlator.register()?;
        let msg_id = pending.msg_id();
        envelope.msg_id = msg_id;
        self.inner.dispatch(envelope)?;

        let timeout = self.inner.config.request_timeout;
        tokio::spawn(async move {
            on_reply(pending.wait(timeout).await);
        });
        Ok(msg_id)
    }

    /// Send a message that expects no reply. It arrives on the destination's
    /// [`messages`](Node::messages) channel.
    pub fn send_oneway(&self, destination: Identity, payload: Vec<u8>) -> Result<MessageId, NetError> {
        let envelope = self.inner.prepare(destination, RelayKind::OneWay, payload)?;
        let msg_id = envelope.msg_id;
        self.inner.dispatch(envelope)?;
        Ok(msg_id)
    }

    /// Flood `payload` to every reachable node. Succeeds with zero neighbors.
    pub fn broadcast(&self, payload: Vec<u8>) -> Result<MessageId, NetError> {
        self.inner.check_payload(&payload)?;
        if self.inner.is_shutting_down() {
            return Err(NetError::Cancelled);
        }
        let (msg_id, sent) = self.inner.broadcaster.broadcast(payload);
        if sent == 0 {
            debug!(msg_id = %short_id(&msg_id), "broadcast has no neighbors to reach");
        }
        Ok(msg_id)
    }

    /// Number of synchronous requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Stop accepting connections, close every link, and cancel every
    /// pending request.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.listener.abort();
        self.maintenance.abort();

        let closed = self.inner.neighbors.drain();
        let cancelled = self.inner.correlator.cancel_all();
        info!(neighbors = closed.len(), cancelled, "node shut down");
        drop(closed);
        tokio::task::yield_now().await;
    }
}

async fn maintain(inner: Arc<NodeInner>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let relayed = inner.router.evict_expired();
        let broadcast = inner.broadcaster.evict_expired();
        if relayed + broadcast > 0 {
            trace!(relayed, broadcast, "evicted expired message ids");
        }
    }
}
