use std::time::Duration;

use crate::broadcast::DEFAULT_BROADCAST_MAX_HOPS;
use crate::correlator::DEFAULT_REQUEST_TIMEOUT;
use crate::identity::Identity;
use crate::messages::MAX_PAYLOAD_SIZE;
use crate::neighbors::{DEFAULT_MAX_NEIGHBORS, DEFAULT_OUTBOUND_QUEUE};
use crate::router::DEFAULT_MAX_HOPS;
use crate::seen::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL};
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

/// Interval between seen-cache sweeps.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the inbound application message channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Node configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Fixed identity; a random one is generated when `None`.
    pub identity: Option<Identity>,
    /// Identities blacklisted from startup.
    pub blacklist: Vec<Identity>,
    /// Hop budget for point-to-point envelopes originated here.
    pub max_hops: u8,
    /// Hop budget for broadcasts originated here.
    pub broadcast_max_hops: u8,
    pub request_timeout: Duration,
    /// Bounds dialing plus the handshake, in both directions.
    pub connect_timeout: Duration,
    pub seen_ttl: Duration,
    pub seen_capacity: usize,
    pub max_neighbors: usize,
    /// Frames buffered per neighbor link.
    pub outbound_queue: usize,
    pub max_payload_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: None,
            blacklist: Vec::new(),
            max_hops: DEFAULT_MAX_HOPS,
            broadcast_max_hops: DEFAULT_BROADCAST_MAX_HOPS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            seen_ttl: DEFAULT_SEEN_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}
