//! # Relay Router
//!
//! Moves [`RelayEnvelope`]s toward their destination across intermediate
//! neighbors. Routing is bounded flooding:
//!
//! 1. Destination is the local node: hand the envelope back for local dispatch.
//! 2. Destination is a neighbor: send it over that link.
//! 3. Otherwise: send a copy to every neighbor not yet visited, excluding the
//!    peer it arrived from.
//!
//! Before any transmission the hop budget is decremented and the local
//! identity appended to `visited`. An envelope whose budget is spent is
//! dropped, as is any envelope this node has already handled (by message id
//! or by finding itself in `visited`). Together these bound the number of
//! transmissions per envelope and rule out loops in cyclic topologies.
//!
//! The admission gate is never consulted here: two peers that refused a
//! direct link still exchange envelopes through a mutual neighbor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::identity::Identity;
use crate::messages::{Frame, MessageId, RelayEnvelope, short_id};
use crate::neighbors::NeighborTable;
use crate::seen::SeenCache;

/// Default hop budget for new envelopes.
pub const DEFAULT_MAX_HOPS: u8 = 8;

#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Addressed to this node.
    Local(RelayEnvelope),
    /// Sent over the destination's own link.
    Direct,
    /// Flooded to this many neighbors.
    Forwarded(usize),
    /// Hop budget spent.
    Exhausted,
    /// Already handled by this node.
    Duplicate,
    /// No neighbor left to carry the envelope.
    NoRoute,
}

impl RouteOutcome {
    /// True when the envelope left this node.
    pub fn is_sent(&self) -> bool {
        matches!(self, RouteOutcome::Direct | RouteOutcome::Forwarded(_))
    }
}

pub struct Router {
    local: Identity,
    neighbors: Arc<NeighborTable>,
    seen: Mutex<SeenCache>,
}

impl Router {
    pub fn new(
        local: Identity,
        neighbors: Arc<NeighborTable>,
        seen_capacity: usize,
        seen_ttl: Duration,
    ) -> Self {
        Self {
            local,
            neighbors,
            seen: Mutex::new(SeenCache::new(seen_capacity, seen_ttl)),
        }
    }

    /// Route an envelope created on this node.
    pub fn originate(&self, envelope: RelayEnvelope) -> RouteOutcome {
        self.mark_seen(envelope.msg_id);
        let outcome = self.route(envelope, None);
        trace!(outcome = outcome_name(&outcome), "originated relay envelope");
        outcome
    }

    /// Route an envelope received from neighbor `from`.
    pub fn relay(&self, envelope: RelayEnvelope, from: Identity) -> RouteOutcome {
        if !self.mark_seen(envelope.msg_id) {
            trace!(msg_id = %short_id(&envelope.msg_id), "duplicate relay envelope");
            return RouteOutcome::Duplicate;
        }
        let msg_id = envelope.msg_id;
        let outcome = self.route(envelope, Some(from));
        match &outcome {
            RouteOutcome::Exhausted | RouteOutcome::NoRoute => debug!(
                msg_id = %short_id(&msg_id),
                from = %from.short(),
                outcome = outcome_name(&outcome),
                "dropped relay envelope"
            ),
            _ => trace!(
                msg_id = %short_id(&msg_id),
                from = %from.short(),
                outcome = outcome_name(&outcome),
                "relay envelope handled"
            ),
        }
        outcome
    }

    /// Drop expired ids from the seen cache.
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

    fn route(&self, mut envelope: RelayEnvelope, from: Option<Identity>) -> RouteOutcome {
        if envelope.destination == self.local {
            return RouteOutcome::Local(envelope);
        }
        if envelope.has_visited(&self.local) {
            return RouteOutcome::Duplicate;
        }
        if envelope.remaining_hops == 0 {
            return RouteOutcome::Exhausted;
        }

        envelope.remaining_hops -= 1;
        envelope.visited.push(self.local);

        let destination = envelope.destination;
        if self.neighbors.contains(&destination) {
            match self.neighbors.send(&destination, Frame::Relay(envelope.clone())) {
                Ok(()) => return RouteOutcome::Direct,
                Err(e) => debug!(
                    peer = %destination.short(),
                    error = %e,
                    "direct link failed, flooding instead"
                ),
            }
        }

        let mut skip = envelope.visited.clone();
        skip.extend(from);
        let frame = Frame::Relay(envelope);
        match self.neighbors.flood(&frame, |identity| skip.contains(identity)) {
            0 => RouteOutcome::NoRoute,
            sent => RouteOutcome::Forwarded(sent),
        }
    }
}

fn outcome_name(outcome: &RouteOutcome) -> &'static str {
    match outcome {
        RouteOutcome::Local(_) => "local",
        RouteOutcome::Direct => "direct",
        RouteOutcome::Forwarded(_) => "forwarded",
        RouteOutcome::Exhausted => "exhausted",
        RouteOutcome::Duplicate => "duplicate",
        RouteOutcome::NoRoute => "no_route",
    }
}
