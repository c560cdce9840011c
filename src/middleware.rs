//! # Connection Middleware
//!
//! Registrable handlers keyed by event kind:
//!
//! | Event | Handler | Returns |
//! |-------|---------|---------|
//! | `WillConnect` | [`AdmissionPolicy`] | [`Verdict`](crate::admission::Verdict) |
//! | `Connected` | [`ConnectedHook`] | continue chain |
//! | `MessageReceived` | [`MessageHook`] | continue chain |
//!
//! `WillConnect` handlers are installed into the admission gate. The other
//! two run after the fact and cannot veto anything; returning `false` only
//! hides the event from handlers registered later.

use std::sync::{Arc, RwLock};

use crate::admission::AdmissionPolicy;
use crate::messages::InboundMessage;
use crate::neighbors::NeighborSummary;

/// Invoked once a neighbor has been admitted and inserted.
pub trait ConnectedHook: Send + Sync + 'static {
    fn on_connected(&self, neighbor: &NeighborSummary) -> bool;
}

/// Invoked for every application message delivered to this node.
pub trait MessageHook: Send + Sync + 'static {
    fn on_message(&self, message: &InboundMessage) -> bool;
}

impl<F> ConnectedHook for F
where
    F: Fn(&NeighborSummary) -> bool + Send + Sync + 'static,
{
    fn on_connected(&self, neighbor: &NeighborSummary) -> bool {
        self(neighbor)
    }
}

impl<F> MessageHook for F
where
    F: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
{
    fn on_message(&self, message: &InboundMessage) -> bool {
        self(message)
    }
}

#[derive(Clone)]
pub enum Middleware {
    WillConnect(Arc<dyn AdmissionPolicy>),
    Connected(Arc<dyn ConnectedHook>),
    MessageReceived(Arc<dyn MessageHook>),
}

impl Middleware {
    pub fn kind(&self) -> &'static str {
        match self {
            Middleware::WillConnect(_) => "will_connect",
            Middleware::Connected(_) => "connected",
            Middleware::MessageReceived(_) => "message_received",
        }
    }
}

/// Post-event hooks in registration order.
#[derive(Default)]
pub struct Hooks {
    connected: RwLock<Vec<Arc<dyn ConnectedHook>>>,
    message_received: RwLock<Vec<Arc<dyn MessageHook>>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connected(&self, hook: Arc<dyn ConnectedHook>) {
        self.connected
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    pub fn add_message_received(&self, hook: Arc<dyn MessageHook>) {
        self.message_received
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    /// Returns the number of hooks that observed the event.
    pub fn connected(&self, neighbor: &NeighborSummary) -> usize {
        let hooks = self
            .connected
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        run_chain(&hooks, |hook| hook.on_connected(neighbor))
    }

    pub fn message_received(&self, message: &InboundMessage) -> usize {
        let hooks = self
            .message_received
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        run_chain(&hooks, |hook| hook.on_message(message))
    }
}

fn run_chain<H: ?Sized>(hooks: &[Arc<H>], mut call: impl FnMut(&H) -> bool) -> usize {
    let mut observed = 0;
    for hook in hooks {
        observed += 1;
        if !call(&**hook) {
            break;
        }
    }
    observed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::identity::Identity;
    use crate::messages::Delivery;
    use crate::neighbors::Direction;

    fn summary() -> NeighborSummary {
        NeighborSummary {
            identity: Identity::from_bytes([1u8; 32]),
            addr: "127.0.0.1:30001".into(),
            direction: Direction::Inbound,
            connected_for: Duration::ZERO,
        }
    }

    #[test]
    fn connected_hooks_run_in_order_until_stopped() {
        let hooks = Hooks::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        hooks.add_connected(Arc::new(move |_: &NeighborSummary| {
            c.fetch_add(1, Ordering::SeqCst);
            false
        }));
        let c = calls.clone();
        hooks.add_connected(Arc::new(move |_: &NeighborSummary| {
            c.fetch_add(10, Ordering::SeqCst);
            true
        }));

        assert_eq!(hooks.connected(&summary()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn message_hooks_observe_payload() {
        let hooks = Hooks::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        hooks.add_message_received(Arc::new(move |msg: &InboundMessage| {
            s.fetch_add(msg.data.len(), Ordering::SeqCst);
            true
        }));

        let message = InboundMessage {
            msg_id: [0u8; 16],
            source: Identity::from_bytes([2u8; 32]),
            data: b"hello".to_vec(),
            delivery: Delivery::Broadcast,
        };
        assert_eq!(hooks.message_received(&message), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn empty_chain_observes_nothing() {
        let hooks = Hooks::new();
        assert_eq!(hooks.connected(&summary()), 0);
    }
}
