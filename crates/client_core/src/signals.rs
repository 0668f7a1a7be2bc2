//! Typed hand-off between the HTTP layer and the session store.

use tokio::sync::broadcast;
use tracing::warn;

/// Emitted once per refresh that failed in a way that ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExpired;

#[derive(Clone)]
pub struct SessionSignals {
    expired: broadcast::Sender<SessionExpired>,
}

impl SessionSignals {
    pub fn new() -> Self {
        let (expired, _) = broadcast::channel(16);
        Self { expired }
    }

    pub fn emit_session_expired(&self) {
        if self.expired.send(SessionExpired).is_err() {
            warn!("session expired with no observer attached");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionExpired> {
        self.expired.subscribe()
    }
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self::new()
    }
}
