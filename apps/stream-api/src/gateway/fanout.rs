//! Broadcast hub for dispatching gateway events to connected sessions.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each connected session
//! subscribes and filters events locally against its own scope. This is
//! efficient for the single-process architecture; scaling across processes
//! would externalize this through the cache.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every member of a room (streamer and viewers).
    Room(String),
    /// Every connected session, optionally excluding one connection
    /// (used for the "new-stream-started" notice, which skips the streamer).
    Global { exclude: Option<String> },
    /// Exactly one connection (used for the streamer-only "new-viewer"
    /// signal that starts the direct media handshake).
    Conn(String),
}

/// A payload broadcast to connected gateway sessions.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    pub scope: Scope,
    /// The dispatch event name (e.g. "new-message").
    pub event_name: &'static str,
    pub data: Value,
}

/// The global broadcast hub. Cloneable — store in AppState.
#[derive(Clone)]
pub struct GatewayBroadcast {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the broadcast channel. Each gateway session should call
    /// this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    /// Dispatch an event to every subscribed session; each filters by scope.
    pub fn dispatch(&self, scope: Scope, event_name: &'static str, data: Value) {
        // send() returns Err if there are no receivers — that's fine.
        let _ = self.sender.send(Arc::new(BroadcastPayload {
            scope,
            event_name,
            data,
        }));
    }
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}
