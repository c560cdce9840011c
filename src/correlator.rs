//! # Request Correlator
//!
//! Matches replies to the synchronous requests that triggered them. Each
//! request gets a fresh [`MessageId`] and a pending entry holding a oneshot
//! result slot. The entry is registered *before* the request is dispatched, so
//! a reply racing back over a short path always finds it.
//!
//! ## Resolution
//!
//! Exactly one of the following resolves a pending entry:
//!
//! - `deliver_reply` with the matching id (the waiter gets the reply)
//! - the timeout elapsing (the entry is removed, the waiter gets `RequestTimeout`)
//! - `cancel_all` at shutdown (the waiter gets `Cancelled`)
//!
//! A reply for an id that is unknown or already resolved is discarded.
//! Dropping a waiting future also removes its entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::NetError;
use crate::messages::{MessageId, Reply, generate_message_id, short_id};

/// Default time a synchronous request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type ResultSlot = oneshot::Sender<Result<Reply, NetError>>;

struct PendingRequest {
    created_at: Instant,
    slot: ResultSlot,
}

/// A registered request awaiting its reply.
pub struct PendingReply {
    correlator: Arc<Correlator>,
    msg_id: MessageId,
    rx: oneshot::Receiver<Result<Reply, NetError>>,
}

impl PendingReply {
    pub fn msg_id(&self) -> MessageId {
        self.msg_id
    }

    /// Wait for the reply until `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Reply, NetError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetError::Cancelled),
            Err(_) => {
                debug!(msg_id = %short_id(&self.msg_id), ?timeout, "request timed out");
                Err(NetError::RequestTimeout(timeout))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.forget(&self.msg_id);
    }
}

#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
    closed: AtomicBool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and register its pending entry.
    pub fn register(self: &Arc<Self>) -> Result<PendingReply, NetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        let msg_id = loop {
            let candidate = generate_message_id();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            msg_id,
            PendingRequest {
                created_at: Instant::now(),
                slot: tx,
            },
        );
        drop(pending);
        Ok(PendingReply {
            correlator: Arc::clone(self),
            msg_id,
            rx,
        })
    }

    /// Register a request, hand its id to `dispatch`, and wait for the reply.
    ///
    /// If `dispatch` fails the entry is removed and its error returned.
    pub async fn send_sync<F>(self: &Arc<Self>, timeout: Duration, dispatch: F) -> Result<Reply, NetError>
    where
        F: FnOnce(MessageId) -> Result<(), NetError>,
    {
        let pending = self.register()?;
        dispatch(pending.msg_id())?;
        pending.wait(timeout).await
    }

    /// Resolve the request `msg_id` with `reply`. Returns `false` if no caller
    /// is waiting for it.
    pub fn deliver_reply(&self, msg_id: &MessageId, reply: Reply) -> bool {
        let Some(entry) = self.lock().remove(msg_id) else {
            trace!(msg_id = %short_id(msg_id), "discarding reply with no pending request");
            return false;
        };
        trace!(
            msg_id = %short_id(msg_id),
            replier = %reply.replier.short(),
            rtt_ms = entry.created_at.elapsed().as_millis() as u64,
            "reply correlated"
        );
        entry.slot.send(Ok(reply)).is_ok()
    }

    /// Resolve every pending request with `Cancelled` and refuse new ones.
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.slot.send(Err(NetError::Cancelled));
        }
        if count > 0 {
            debug!(count, "cancelled pending requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn forget(&self, msg_id: &MessageId) {
        self.lock().remove(msg_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
