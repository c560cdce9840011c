//! # Node Identity
//!
//! This module defines the identity types used throughout meshgate:
//!
//! - [`Identity`]: opaque 32-byte identifier naming a node in the overlay
//! - [`Contact`]: an identity paired with the address the node listens on
//!
//! ## Identity Model
//!
//! Identities are opaque. They are either generated from the OS random source
//! at startup or supplied by the operator as 64 hex characters. Uniqueness is
//! a network-wide assumption and is not enforced locally.
//!
//! The remote side of a connection is never identified by its socket address.
//! Identities are exchanged in the handshake and the address is only a hint
//! for dialing.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - An identity is immutable for the lifetime of the process

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Length of an identity in bytes.
pub const IDENTITY_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh identity from the OS random source.
    pub fn random() -> Self {
        let mut bytes = [0u8; IDENTITY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim())?;
        if bytes.len() != IDENTITY_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; IDENTITY_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Identity {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; IDENTITY_LEN]> for Identity {
    fn from(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; IDENTITY_LEN] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A node's identity together with the address it accepts connections on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addr: String,
}

impl Contact {
    pub fn new(identity: Identity, addr: impl Into<String>) -> Self {
        Self {
            identity,
            addr: addr.into(),
        }
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.identity)
    }
}
