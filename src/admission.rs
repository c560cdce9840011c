//! # Admission Gate
//!
//! Decides whether a prospective connection may proceed. The gate is an
//! ordered chain of independent [`AdmissionPolicy`] predicates, each returning
//! a [`Verdict`] with two fields:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `permit` | This predicate allows the connection |
//! | `continue_chain` | Later predicates still observe the event |
//!
//! The aggregate decision denies if any consulted predicate denies. A denial
//! does not short-circuit unless the denying predicate also stops the chain,
//! so independent observers (logging, metrics) still see denied candidates.
//!
//! The gate runs only while a connection is being established. Relayed
//! traffic between peers that refuse each other never passes through it.
//!
//! ## Candidates
//!
//! A candidate is `Unknown` while the transport handshake has not revealed
//! the remote identity yet, and `Known` afterwards. Policies must permit
//! unknown candidates so the decision is deferred rather than blocked.
//!
//! ## Failure Semantics
//!
//! Lock poisoning in the policy store or in the chain itself is treated as a
//! denial (fail closed).

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::identity::{Contact, Identity};

/// A connection candidate as seen by the gate.
#[derive(Clone, Copy, Debug)]
pub enum Candidate<'a> {
    /// Remote identity not yet known; `addr` is the transport address if any.
    Unknown { addr: Option<&'a str> },
    Known(&'a Contact),
}

impl Candidate<'_> {
    pub fn identity(&self) -> Option<Identity> {
        match self {
            Candidate::Unknown { .. } => None,
            Candidate::Known(contact) => Some(contact.identity),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub permit: bool,
    pub continue_chain: bool,
}

impl Verdict {
    pub const PERMIT: Verdict = Verdict { permit: true, continue_chain: true };
    pub const DENY: Verdict = Verdict { permit: false, continue_chain: true };
    /// Deny and hide the event from later predicates.
    pub const DENY_AND_STOP: Verdict = Verdict { permit: false, continue_chain: false };
}

/// One predicate in the admission chain.
pub trait AdmissionPolicy: Send + Sync + 'static {
    fn evaluate(&self, candidate: &Candidate<'_>) -> Verdict;
}

// ============================================================================
// Blacklist (policy store)
// ============================================================================

/// Operator-controlled set of identities that must never become neighbors.
///
/// Owned by the node and shared by reference with [`BlacklistPolicy`].
/// Readers never observe a partially applied add or remove.
#[derive(Debug, Default)]
pub struct Blacklist {
    blocked: RwLock<HashSet<Identity>>,
}

/// Error returned when the blacklist lock is poisoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("blacklist store is poisoned")]
pub struct PoisonedStore;

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            blocked: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Returns `true` if the identity was not already blacklisted.
    pub fn add(&self, identity: Identity) -> bool {
        let mut blocked = self.blocked.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let added = blocked.insert(identity);
        if added {
            info!(peer = %identity, "added to blacklist");
        }
        added
    }

    /// Returns `true` if the identity was blacklisted.
    pub fn remove(&self, identity: &Identity) -> bool {
        let mut blocked = self.blocked.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let removed = blocked.remove(identity);
        if removed {
            info!(peer = %identity, "removed from blacklist");
        }
        removed
    }

    pub fn is_blocked(&self, identity: &Identity) -> Result<bool, PoisonedStore> {
        self.blocked
            .read()
            .map(|blocked| blocked.contains(identity))
            .map_err(|_| PoisonedStore)
    }

    /// Sorted snapshot of blacklisted identities.
    pub fn entries(&self) -> Vec<Identity> {
        let blocked = self.blocked.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<Identity> = blocked.iter().copied().collect();
        entries.sort();
        entries
    }
}

/// Admission predicate backed by a [`Blacklist`].
pub struct BlacklistPolicy {
    blacklist: Arc<Blacklist>,
}

impl BlacklistPolicy {
    pub fn new(blacklist: Arc<Blacklist>) -> Self {
        Self { blacklist }
    }
}

impl AdmissionPolicy for BlacklistPolicy {
    fn evaluate(&self, candidate: &Candidate<'_>) -> Verdict {
        let Candidate::Known(contact) = candidate else {
            return Verdict::PERMIT;
        };
        match self.blacklist.is_blocked(&contact.identity) {
            Ok(false) => Verdict::PERMIT,
            Ok(true) => {
                info!(
                    peer = %contact.identity,
                    addr = %contact.addr,
                    "blocked connection with blacklisted node"
                );
                Verdict::DENY
            }
            Err(e) => {
                warn!(peer = %contact.identity, error = %e, "denying connection");
                Verdict::DENY
            }
        }
    }
}

// ============================================================================
// Gate
// ============================================================================

#[derive(Default)]
pub struct AdmissionGate {
    policies: RwLock<Vec<Arc<dyn AdmissionPolicy>>>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a predicate; predicates run in registration order.
    pub fn register(&self, policy: Arc<dyn AdmissionPolicy>) {
        let mut policies = self.policies.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        policies.push(policy);
    }

    pub fn evaluate(&self, candidate: &Candidate<'_>) -> Verdict {
        let policies: Vec<Arc<dyn AdmissionPolicy>> = match self.policies.read() {
            Ok(policies) => policies.clone(),
            Err(_) => {
                warn!("admission chain lock poisoned, denying");
                return Verdict::DENY_AND_STOP;
            }
        };

        let mut aggregate = Verdict::PERMIT;
        for policy in policies {
            let verdict = policy.evaluate(candidate);
            aggregate.permit &= verdict.permit;
            aggregate.continue_chain = verdict.continue_chain;
            if !verdict.continue_chain {
                break;
            }
        }

        if !aggregate.permit {
            debug!(peer = ?candidate.identity(), "admission denied");
        }
        aggregate
    }

    pub fn permits(&self, candidate: &Candidate<'_>) -> bool {
        self.evaluate(candidate).permit
    }
}
