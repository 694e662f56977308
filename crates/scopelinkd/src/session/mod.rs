//! Signal session — the control plane.
//!
//! One `SignalServer` talks to many `SignalClient`s. Both ends run the same
//! poll loop on their worker thread:
//!
//!   1. receive at most one envelope without blocking and hand it to the
//!      registered listeners
//!   2. send at most one queued envelope (the server sends it to every
//!      client it has heard from)
//!   3. sleep `idle_sleep` if neither step did anything
//!
//! Sending goes through a bounded queue; a full queue drops the envelope
//! with a warning after `offer_timeout`. A `Shutdown` envelope, sent or
//! received, moves the endpoint to DRAINING: it flushes what is queued and
//! then closes.

pub mod client;
pub mod server;
mod state;

pub use client::SignalClient;
pub use server::{ClientRegistry, SignalServer};
pub use state::{SessionState, SharedState};

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use scopelink_core::signal::{AppPayload, Envelope};
use scopelink_services::OutgoingQueue;

/// Called on the server worker thread for every inbound envelope.
pub type ServerListener = Arc<dyn Fn(SocketAddr, &Envelope) + Send + Sync>;

/// Called on the client worker thread for every inbound envelope.
pub type ClientListener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// An encoded envelope waiting in the outgoing queue.
struct Queued {
    bytes: Vec<u8>,
    kind: &'static str,
    shutdown: bool,
}

/// Cloneable handle to an endpoint's outgoing queue.
#[derive(Clone)]
pub struct SignalSender {
    queue: Arc<OutgoingQueue<Queued>>,
    offer_timeout: Duration,
    state: SharedState,
}

impl SignalSender {
    fn new(name: &'static str, capacity: usize, offer_timeout: Duration, state: SharedState) -> Self {
        Self {
            queue: Arc::new(OutgoingQueue::new(name, capacity)),
            offer_timeout,
            state,
        }
    }

    /// Encode and queue `envelope`. Returns false if it was dropped.
    pub fn send(&self, envelope: &Envelope) -> bool {
        if self.state.get() == SessionState::Closed {
            tracing::warn!(kind = envelope.kind(), "session closed, signal dropped");
            return false;
        }
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(kind = envelope.kind(), error = %e, "failed to encode signal");
                return false;
            }
        };
        self.queue.offer(
            Queued {
                bytes,
                kind: envelope.kind(),
                shutdown: envelope.is_shutdown(),
            },
            self.offer_timeout,
        )
    }

    /// Wrap a domain payload in `AppSpecific` and queue it.
    pub fn send_app<P: AppPayload>(&self, payload: &P) -> bool {
        match payload.to_envelope() {
            Ok(envelope) => self.send(&envelope),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode app payload");
                false
            }
        }
    }

    /// Queue a `Shutdown`. The endpoint closes once it has been sent.
    pub fn shutdown(&self) -> bool {
        self.send(&Envelope::Shutdown)
    }

    /// Envelopes queued but not sent yet.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Envelopes dropped because the queue stayed full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    fn poll(&self) -> Option<Queued> {
        self.queue.poll()
    }
}

/// Listener list shared between a handle and its worker.
struct Listeners<F: ?Sized>(Arc<RwLock<Vec<Arc<F>>>>);

impl<F: ?Sized> Clone for Listeners<F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<F: ?Sized> Listeners<F> {
    fn new(initial: Vec<Arc<F>>) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    fn add(&self, listener: Arc<F>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Copy of the current list, so listeners may register more listeners.
    fn snapshot(&self) -> Vec<Arc<F>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Mark the endpoint draining after a shutdown was sent or received.
fn begin_drain(state: &SharedState, role: &'static str) {
    if state.advance(SessionState::Draining) {
        tracing::info!(role, "shutdown observed, draining outgoing signals");
    }
}
