//! # Broadcast Disseminator
//!
//! Floods a payload to every reachable node exactly once per message id.
//!
//! ## Protocol
//!
//! 1. The origin assigns a fresh id, marks it seen, and sends the envelope to
//!    every neighbor.
//! 2. A receiver drops envelopes whose id is already in its seen set.
//!    Otherwise it marks the id seen, delivers the payload to the local
//!    application, and forwards to every neighbor except the one it came from.
//!
//! The seen sets stop propagation. Each transmission still consumes one hop
//! from the envelope's budget, which defaults to [`DEFAULT_BROADCAST_MAX_HOPS`]
//! and only matters for copies that outlive their id's seen entries.
//!
//! ## Seen Set
//!
//! Ids are kept in a bounded LRU whose entries expire after the configured
//! TTL. A copy that arrives after its id expired is treated as new.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::identity::Identity;
use crate::messages::{BroadcastEnvelope, Frame, MessageId, generate_message_id, short_id};
use crate::neighbors::NeighborTable;
use crate::seen::SeenCache;

/// Default hop budget for broadcasts. Far larger than any expected diameter.
pub const DEFAULT_BROADCAST_MAX_HOPS: u8 = u8::MAX;

#[derive(Debug, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// First copy; deliver to the application.
    Deliver {
        envelope: BroadcastEnvelope,
        forwarded: usize,
    },
    Duplicate,
}

pub struct Broadcaster {
    local: Identity,
    neighbors: Arc<NeighborTable>,
    seen: Mutex<SeenCache>,
    max_hops: u8,
}

impl Broadcaster {
    pub fn new(
        local: Identity,
        neighbors: Arc<NeighborTable>,
        max_hops: u8,
        seen_capacity: usize,
        seen_ttl: Duration,
    ) -> Self {
        Self {
            local,
            neighbors,
            seen: Mutex::new(SeenCache::new(seen_capacity, seen_ttl)),
            max_hops,
        }
    }

    /// Start a broadcast. Returns the new id and the number of neighbors the
    /// envelope was queued for.
    pub fn broadcast(&self, payload: Vec<u8>) -> (MessageId, usize) {
        let envelope = BroadcastEnvelope {
            msg_id: generate_message_id(),
            source: self.local,
            payload,
            remaining_hops: self.max_hops,
        };
        let msg_id = envelope.msg_id;
        self.mark_seen(msg_id);
        let sent = self.forward(envelope, None);
        debug!(msg_id = %short_id(&msg_id), neighbors = sent, "broadcast started");
        (msg_id, sent)
    }

    /// Handle an envelope received from neighbor `from`.
    pub fn receive(&self, envelope: BroadcastEnvelope, from: Identity) -> BroadcastOutcome {
        if envelope.source == self.local || !self.mark_seen(envelope.msg_id) {
            trace!(msg_id = %short_id(&envelope.msg_id), "duplicate broadcast");
            return BroadcastOutcome::Duplicate;
        }
        let forwarded = self.forward(envelope.clone(), Some(from));
        trace!(
            msg_id = %short_id(&envelope.msg_id),
            source = %envelope.source.short(),
            from = %from.short(),
            forwarded,
            "broadcast received"
        );
        BroadcastOutcome::Deliver { envelope, forwarded }
    }

    pub fn evict_expired(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .evict_expired()
    }

    fn mark_seen(&self, msg_id: MessageId) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(msg_id)
    }

    fn forward(&self, mut envelope: BroadcastEnvelope, from: Option<Identity>) -> usize {
        if envelope.remaining_hops == 0 {
            return 0;
        }
        envelope.remaining_hops -= 1;
        let source = envelope.source;
        let frame = Frame::Broadcast(envelope);
        self.neighbors
            .flood(&frame, |identity| Some(*identity) == from || *identity == source)
    }
}
