//! # Neighbor Table
//!
//! Tracks peers with an open, admitted connection. An entry exists iff a live
//! connection passed admission and completed the handshake; it is removed when
//! the connection's reader observes the link closing.
//!
//! Each neighbor owns a bounded outbound queue drained by a dedicated writer
//! task. Sends never await: a full queue drops the frame, a closed queue
//! removes the neighbor.
//!
//! ## Connection Ids
//!
//! Every connection gets a process-unique id. Removal is keyed on
//! `(identity, conn_id)` so a stale reader task cannot evict the entry of a
//! newer connection to the same peer.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::identity::{Contact, Identity};
use crate::messages::Frame;

/// Maximum number of simultaneous neighbors.
/// SECURITY: Bounds per-node connection state.
pub const DEFAULT_MAX_NEIGHBORS: usize = 64;

/// Frames buffered per neighbor before new frames are dropped.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

#[derive(Debug)]
pub struct Neighbor {
    pub contact: Contact,
    pub link: mpsc::Sender<Frame>,
    pub established_at: Instant,
    pub direction: Direction,
    pub conn_id: u64,
}

/// Read-only view of a neighbor for operators and hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborSummary {
    pub identity: Identity,
    pub addr: String,
    pub direction: Direction,
    pub connected_for: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    #[error("already connected to {0:?}")]
    AlreadyConnected(Identity),
    #[error("neighbor table full ({0} entries)")]
    Full(usize),
}

pub struct NeighborTable {
    entries: RwLock<HashMap<Identity, Neighbor>>,
    max_neighbors: usize,
    next_conn_id: AtomicU64,
}

impl NeighborTable {
    pub fn new(max_neighbors: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_neighbors,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, neighbor: Neighbor) -> Result<(), InsertError> {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let identity = neighbor.contact.identity;
        if entries.contains_key(&identity) {
            return Err(InsertError::AlreadyConnected(identity));
        }
        if entries.len() >= self.max_neighbors {
            return Err(InsertError::Full(entries.len()));
        }
        entries.insert(identity, neighbor);
        Ok(())
    }

    /// Remove the entry for `identity` only if it belongs to connection `conn_id`.
    pub fn remove(&self, identity: &Identity, conn_id: u64) -> Option<Neighbor> {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.get(identity).is_some_and(|n| n.conn_id == conn_id) {
            entries.remove(identity)
        } else {
            None
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_neighbors
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.read().values().map(|n| n.contact.clone()).collect()
    }

    /// Neighbors ordered by connection time, oldest first.
    pub fn summaries(&self) -> Vec<NeighborSummary> {
        let entries = self.read();
        let mut sorted: Vec<&Neighbor> = entries.values().collect();
        sorted.sort_by_key(|n| n.established_at);
        sorted
            .into_iter()
            .map(|n| NeighborSummary {
                identity: n.contact.identity,
                addr: n.contact.addr.clone(),
                direction: n.direction,
                connected_for: n.established_at.elapsed(),
            })
            .collect()
    }

    pub fn summary(&self, identity: &Identity) -> Option<NeighborSummary> {
        self.read().get(identity).map(|n| NeighborSummary {
            identity: n.contact.identity,
            addr: n.contact.addr.clone(),
            direction: n.direction,
            connected_for: n.established_at.elapsed(),
        })
    }

    /// Queue `frame` for one neighbor.
    pub fn send(&self, identity: &Identity, frame: Frame) -> Result<(), NetError> {
        let Some((link, conn_id)) = self
            .read()
            .get(identity)
            .map(|n| (n.link.clone(), n.conn_id))
        else {
            return Err(NetError::TransportFailure(format!(
                "{} is not a neighbor",
                identity.short()
            )));
        };
        self.push(identity, conn_id, &link, frame)
    }

    /// Queue a copy of `frame` for every neighbor not rejected by `skip`.
    /// Returns the number of neighbors the frame was queued for.
    pub fn flood<F>(&self, frame: &Frame, skip: F) -> usize
    where
        F: Fn(&Identity) -> bool,
    {
        let targets: Vec<(Identity, u64, mpsc::Sender<Frame>)> = self
            .read()
            .values()
            .filter(|n| !skip(&n.contact.identity))
            .map(|n| (n.contact.identity, n.conn_id, n.link.clone()))
            .collect();

        targets
            .into_iter()
            .filter(|(identity, conn_id, link)| {
                self.push(identity, *conn_id, link, frame.clone()).is_ok()
            })
            .count()
    }

    /// Remove and return every neighbor. Dropping the returned entries closes
    /// their outbound queues, which ends the writer tasks.
    pub fn drain(&self) -> Vec<Neighbor> {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.drain().map(|(_, n)| n).collect()
    }

    fn push(
        &self,
        identity: &Identity,
        conn_id: u64,
        link: &mpsc::Sender<Frame>,
        frame: Frame,
    ) -> Result<(), NetError> {
        let kind = frame.kind();
        match link.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(peer = %identity.short(), frame = kind, "outbound queue full, dropping frame");
                Err(NetError::TransportFailure("outbound queue full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = %identity.short(), "link closed, removing neighbor");
                self.remove(identity, conn_id);
                Err(NetError::TransportFailure("link closed".into()))
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Identity, Neighbor>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
