//! Per-connection session state.
//!
//! A `Session` is owned exclusively by its connection task, created after a
//! successful IDENTIFY and destroyed on disconnect. It is never persisted
//! and never shared; the event router receives it by mutable reference.

/// Where a session currently is in the room state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected and authenticated, not in any room.
    Unbound,
    /// Broadcasting to the room (streamer path).
    Publishing { room_id: String },
    /// Watching the room (viewer path).
    Viewing { room_id: String },
}

/// State for a single authenticated WebSocket connection.
#[derive(Debug)]
pub struct Session {
    /// Unique connection identifier (`conn_` prefixed ULID). Doubles as the
    /// viewer key in a room's viewer set.
    pub conn_id: String,
    /// Authenticated user ID.
    pub user_id: String,
    /// Authenticated username (from the token claims).
    pub username: String,
    state: SessionState,
    /// Monotonically increasing sequence number for dispatch events.
    seq: u64,
}

impl Session {
    pub fn new(conn_id: String, user_id: String, username: String) -> Self {
        Self {
            conn_id,
            user_id,
            username,
            state: SessionState::Unbound,
            seq: 0,
        }
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The room this session is in, regardless of role.
    pub fn room_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Unbound => None,
            SessionState::Publishing { room_id } | SessionState::Viewing { room_id } => {
                Some(room_id)
            }
        }
    }

    pub fn is_streamer(&self) -> bool {
        matches!(self.state, SessionState::Publishing { .. })
    }

    /// Bind this session to a room as its publisher. Session-local only —
    /// the event router performs the matching directory mutation.
    pub fn attach_as_streamer(&mut self, room_id: String) {
        self.state = SessionState::Publishing { room_id };
    }

    /// Bind this session to a room as a viewer.
    pub fn attach_as_viewer(&mut self, room_id: String) {
        self.state = SessionState::Viewing { room_id };
    }

    /// Return to the unbound state. Idempotent.
    pub fn detach(&mut self) {
        self.state = SessionState::Unbound;
    }
}
