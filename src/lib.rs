//! # meshgate - Policy-Gated Overlay with Multi-Hop Relay
//!
//! meshgate lets a set of peers form a mesh in which some pairs refuse to
//! connect directly, yet still exchange messages through any node linked to
//! both:
//!
//! - **Admission**: every prospective connection passes an ordered chain of
//!   policies (a blacklist by default) before it becomes a neighbor link
//! - **Relay**: point-to-point envelopes are flooded through neighbors under a
//!   hop budget and a visited set until they reach their destination
//! - **Correlation**: replies travel back over the same relay mechanism and are
//!   matched to the waiting request by message id
//! - **Broadcast**: payloads reach every node once per message id
//!
//! ## Architecture
//!
//! - A [`Node`] is a cheap handle over shared state; every component sits
//!   behind its own lock and no lock is held across components
//! - Each TCP connection has one reader task (frames are handled in arrival
//!   order) and one writer task draining a bounded queue
//! - Forwarding never awaits: a full queue drops the frame, a closed one
//!   removes the neighbor
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Opaque node identities and contacts |
//! | `admission` | Blacklist store and the admission gate |
//! | `middleware` | Hooks keyed by connection/message event |
//! | `neighbors` | Admitted peers and their outbound queues |
//! | `router` | Bounded-hop flooding with visited sets |
//! | `correlator` | Pending requests and reply matching |
//! | `broadcast` | Once-per-id dissemination |
//! | `seen` | Bounded, expiring message id set |
//! | `connection` | Handshake plus per-link reader/writer tasks |
//! | `transport` | TCP listener/dialer and frame codec |
//! | `messages` | Wire frames and envelopes |

mod admission;
mod broadcast;
mod config;
mod connection;
mod correlator;
mod error;
mod identity;
mod messages;
mod middleware;
mod neighbors;
mod node;
mod router;
mod seen;
mod transport;

pub use admission::{AdmissionPolicy, Blacklist, BlacklistPolicy, Candidate, Verdict};
pub use config::NodeConfig;
pub use error::NetError;
pub use identity::{Contact, IDENTITY_LEN, Identity};
pub use messages::{Delivery, InboundMessage, MAX_PAYLOAD_SIZE, MessageId, Reply};
pub use middleware::{ConnectedHook, MessageHook, Middleware};
pub use neighbors::{Direction, NeighborSummary};
pub use node::Node;
