//! Error taxonomy for caller-facing overlay operations.
//!
//! Duplicate suppression is deliberately absent: a duplicate envelope is a
//! normal routing outcome (`RouteOutcome::Duplicate`), not a failure.

use std::time::Duration;

use thiserror::Error;

use crate::identity::Identity;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// The admission policy (ours or the remote's) rejected the connection.
    #[error("connection to {identity} denied by admission policy")]
    AdmissionDenied { identity: Identity },

    /// No neighbor was left to carry the envelope toward its destination.
    #[error("route exhausted: no neighbor can carry the message")]
    RouteExhausted,

    /// No reply arrived before the deadline.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The node shut down while the request was outstanding.
    #[error("request cancelled by node shutdown")]
    Cancelled,

    /// The underlying connection failed.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The destination cannot be addressed (e.g. the local node itself).
    #[error("invalid destination {0}")]
    InvalidDestination(Identity),

    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

impl NetError {
    /// Errors in the timeout class: the network did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout(_) | Self::RouteExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_class() {
        assert!(NetError::RequestTimeout(Duration::from_secs(1)).is_timeout());
        assert!(NetError::RouteExhausted.is_timeout());
        assert!(!NetError::Cancelled.is_timeout());
        assert!(!NetError::TransportFailure("reset".into()).is_timeout());
    }

    #[test]
    fn display_names_the_identity() {
        let identity = Identity::from_bytes([2u8; 32]);
        let err = NetError::AdmissionDenied { identity };
        assert!(err.to_string().contains(&identity.to_hex()));
    }
}
