//! # Wire Protocol Messages
//!
//! This module defines every serializable frame exchanged between neighbors.
//! Frames are serialized with bincode using size limits to prevent memory
//! exhaustion.
//!
//! ## Frame Types
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `Hello` | dialer → acceptor | Announce the dialer's contact |
//! | `Welcome` | acceptor → dialer | Admit the dialer, introduce known neighbors |
//! | `Accept` | dialer → acceptor | Dialer admits the acceptor, link is live |
//! | `Refused` | either | Admission denied, connection closes |
//! | `Relay` | any hop | Routed point-to-point envelope |
//! | `Broadcast` | any hop | Flooded envelope |
//!
//! ## Message IDs
//!
//! Every envelope carries a random 16-byte [`MessageId`]. Ids are used for
//! deduplication at every hop and for matching replies to requests.

use bincode::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::identity::{Contact, Identity};

pub type MessageId = [u8; 16];

/// Maximum application payload carried by one envelope (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Maximum size of one encoded frame on the wire.
/// Leaves room for the neighbor list in `Welcome` and envelope metadata.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub fn generate_message_id() -> MessageId {
    rand::thread_rng().r#gen()
}

/// Short hex prefix of a message id for log lines.
pub fn short_id(id: &MessageId) -> String {
    hex::encode(&id[..8])
}

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// What a relay envelope carries and how the destination treats it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayKind {
    /// Expects a `Reply` routed back to the source.
    Request,
    /// Answer to the request with the given id.
    Reply { in_reply_to: MessageId },
    /// Fire-and-forget application message.
    OneWay,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub msg_id: MessageId,
    pub source: Identity,
    pub destination: Identity,
    pub kind: RelayKind,
    pub payload: Vec<u8>,
    /// Transmissions left before the envelope is dropped.
    pub remaining_hops: u8,
    /// Every node that has handled this envelope, in hop order.
    pub visited: Vec<Identity>,
}

impl RelayEnvelope {
    pub fn new(
        source: Identity,
        destination: Identity,
        kind: RelayKind,
        payload: Vec<u8>,
        max_hops: u8,
    ) -> Self {
        Self {
            msg_id: generate_message_id(),
            source,
            destination,
            kind,
            payload,
            remaining_hops: max_hops,
            visited: Vec::new(),
        }
    }

    pub fn has_visited(&self, identity: &Identity) -> bool {
        self.visited.contains(identity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub msg_id: MessageId,
    pub source: Identity,
    pub payload: Vec<u8>,
    pub remaining_hops: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        contact: Contact,
    },
    Welcome {
        contact: Contact,
        /// Contacts of the acceptor's current neighbors (seed introduction).
        neighbors: Vec<Contact>,
    },
    Accept,
    Refused {
        /// The refusing node.
        identity: Identity,
        reason: String,
    },
    Relay(RelayEnvelope),
    Broadcast(BroadcastEnvelope),
}

impl Frame {
    /// Frame name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Accept => "accept",
            Frame::Refused { .. } => "refused",
            Frame::Relay(_) => "relay",
            Frame::Broadcast(_) => "broadcast",
        }
    }
}

/// Message handed to the local application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub msg_id: MessageId,
    pub source: Identity,
    pub data: Vec<u8>,
    pub delivery: Delivery,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Point-to-point request expecting a reply.
    Request,
    /// Point-to-point message without a reply.
    OneWay,
    /// Flooded to every node.
    Broadcast,
}

/// Answer to a synchronous request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub payload: Vec<u8>,
    pub replier: Identity,
}
