//! Session endpoint state.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// RUNNING → DRAINING → CLOSED. Never goes backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Running = 0,
    /// Shutdown seen. Flushing the outgoing queue, ignoring inbound.
    Draining = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Running,
            1 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

/// State shared between an endpoint handle and its worker.
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SessionState::Running as u8)))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Returns false if already at or past it.
    pub fn advance(&self, next: SessionState) -> bool {
        let prev = self.0.fetch_max(next as u8, Ordering::AcqRel);
        prev < next as u8
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
