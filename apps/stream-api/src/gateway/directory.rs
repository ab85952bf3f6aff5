//! Authoritative in-memory map of live rooms.
//!
//! Single source of truth for "is this room live right now". Uses `DashMap`
//! for shard-level concurrency and `parking_lot::Mutex` per room so that all
//! mutations of one room's viewer set and chat history are serialized.
//! Room locks are only ever held for in-memory work — callers must do their
//! datastore/cache I/O before or after, never inside.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Hard cap on a room's viewer set.
pub const MAX_VIEWERS: usize = 100;

/// Bounded chat history per room; oldest entries are evicted first.
pub const CHAT_HISTORY_LIMIT: usize = 100;

/// How much chat history a joining viewer receives.
pub const CHAT_SNAPSHOT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryError {
    /// No live room under that identifier.
    NotFound,
    /// The streamer already owns a live room.
    AlreadyLive,
    /// A live room with that identifier already exists.
    Conflict,
    /// The viewer set is at `MAX_VIEWERS`.
    Capacity,
}

/// A member of a room's viewer set, keyed by connection identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerEntry {
    pub user_id: String,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// One entry of a room's bounded chat history. Serializes to the wire shape
/// broadcast as `new-message`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: i64,
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// In-memory representative of a currently-broadcasting room.
#[derive(Debug)]
pub struct LiveRoom {
    /// Backing persistent row id.
    pub record_id: i64,
    pub room_id: String,
    pub streamer_id: String,
    pub streamer_username: String,
    /// The streamer's current connection; at most one publisher slot.
    pub streamer_conn: Option<String>,
    pub viewers: HashMap<String, ViewerEntry>,
    pub chat: VecDeque<ChatEntry>,
    pub started_at: DateTime<Utc>,
}

impl LiveRoom {
    pub fn new(
        record_id: i64,
        room_id: String,
        streamer_id: String,
        streamer_username: String,
        streamer_conn: Option<String>,
    ) -> Self {
        Self {
            record_id,
            room_id,
            streamer_id,
            streamer_username,
            streamer_conn,
            viewers: HashMap::new(),
            chat: VecDeque::new(),
            started_at: Utc::now(),
        }
    }
}

/// What a successful join sees, captured atomically under the room lock.
#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    pub viewer_count: usize,
    pub streamer_conn: Option<String>,
    pub streamer_username: String,
    pub chat_tail: Vec<ChatEntry>,
}

/// A room removed from the directory, returned for durable finalization.
#[derive(Debug)]
pub struct ClosedRoom {
    pub record_id: i64,
    pub room_id: String,
    pub streamer_id: String,
    pub reason: String,
    pub chat: Vec<ChatEntry>,
    pub duration: Duration,
}

/// Shared registry of all live rooms plus an owner index enforcing the
/// one-live-room-per-streamer invariant.
pub struct RoomDirectory {
    rooms: DashMap<String, Mutex<LiveRoom>>,
    /// streamer user id → live room id
    owners: DashMap<String, String>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Register a new live room. Fails with `AlreadyLive` if the streamer
    /// already owns one, `Conflict` if the room id is already present.
    pub fn create_room(&self, room: LiveRoom) -> Result<(), DirectoryError> {
        let streamer_id = room.streamer_id.clone();
        let room_id = room.room_id.clone();

        match self.owners.entry(streamer_id) {
            Entry::Occupied(_) => Err(DirectoryError::AlreadyLive),
            Entry::Vacant(owner_slot) => match self.rooms.entry(room_id.clone()) {
                Entry::Occupied(_) => Err(DirectoryError::Conflict),
                Entry::Vacant(room_slot) => {
                    owner_slot.insert(room_id);
                    room_slot.insert(Mutex::new(room));
                    Ok(())
                }
            },
        }
    }

    /// Insert a viewer, capacity-checked. `publish` runs under the room lock
    /// with the post-insert snapshot, so membership broadcasts observe the
    /// mutation order. The ban check is the router's job (it requires I/O
    /// and must not run under the lock).
    pub fn attach_viewer(
        &self,
        room_id: &str,
        conn_id: &str,
        user_id: &str,
        username: &str,
        publish: impl FnOnce(&JoinSnapshot),
    ) -> Result<JoinSnapshot, DirectoryError> {
        let entry = self.rooms.get(room_id).ok_or(DirectoryError::NotFound)?;
        let mut room = entry.lock();

        if room.viewers.len() >= MAX_VIEWERS {
            return Err(DirectoryError::Capacity);
        }

        room.viewers.insert(
            conn_id.to_string(),
            ViewerEntry {
                user_id: user_id.to_string(),
                username: username.to_string(),
                joined_at: Utc::now(),
            },
        );

        let tail_start = room.chat.len().saturating_sub(CHAT_SNAPSHOT_LIMIT);
        let snapshot = JoinSnapshot {
            viewer_count: room.viewers.len(),
            streamer_conn: room.streamer_conn.clone(),
            streamer_username: room.streamer_username.clone(),
            chat_tail: room.chat.iter().skip(tail_start).cloned().collect(),
        };

        publish(&snapshot);
        Ok(snapshot)
    }

    /// Remove a viewer. Idempotent: removing an absent entry is a no-op.
    /// Returns `(current_count, removed)`, or `None` if the room is gone.
    /// `publish` runs under the lock and only when an entry was removed, so
    /// a second detach never re-broadcasts.
    pub fn detach_viewer(
        &self,
        room_id: &str,
        conn_id: &str,
        publish: impl FnOnce(usize),
    ) -> Option<(usize, bool)> {
        let entry = self.rooms.get(room_id)?;
        let mut room = entry.lock();
        let removed = room.viewers.remove(conn_id).is_some();
        let count = room.viewers.len();
        if removed {
            publish(count);
        }
        Some((count, removed))
    }

    /// Remove the room, returning its final chat history and duration for
    /// durable finalization. Fails with `NotFound` if already absent —
    /// callers treat that as benign (race with the sweeper or a double
    /// teardown).
    pub fn end_room(&self, room_id: &str, reason: &str) -> Result<ClosedRoom, DirectoryError> {
        let (_, mutex) = self.rooms.remove(room_id).ok_or(DirectoryError::NotFound)?;
        let room = mutex.into_inner();
        self.owners.remove(&room.streamer_id);

        let duration = (Utc::now() - room.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        Ok(ClosedRoom {
            record_id: room.record_id,
            room_id: room.room_id,
            streamer_id: room.streamer_id,
            reason: reason.to_string(),
            chat: room.chat.into_iter().collect(),
            duration,
        })
    }

    /// Append to the bounded chat history, evicting the oldest beyond the
    /// cap. `publish` runs under the lock so broadcasts preserve append
    /// order. Returns `false` if the room is gone (in-flight chat racing a
    /// disconnect) — a soft failure.
    pub fn append_chat(
        &self,
        room_id: &str,
        entry: ChatEntry,
        publish: impl FnOnce(&ChatEntry),
    ) -> bool {
        let Some(room_entry) = self.rooms.get(room_id) else {
            return false;
        };
        let mut room = room_entry.lock();
        room.chat.push_back(entry);
        while room.chat.len() > CHAT_HISTORY_LIMIT {
            room.chat.pop_front();
        }
        publish(room.chat.back().expect("just pushed"));
        true
    }

    /// Remove one message from the history. Returns whether a removal
    /// occurred.
    pub fn remove_chat(&self, room_id: &str, message_id: i64) -> bool {
        let Some(room_entry) = self.rooms.get(room_id) else {
            return false;
        };
        let mut room = room_entry.lock();
        let before = room.chat.len();
        room.chat.retain(|m| m.id != message_id);
        room.chat.len() < before
    }

    /// Drop the entire chat history. Returns `false` if the room is gone.
    pub fn clear_chat(&self, room_id: &str) -> bool {
        let Some(room_entry) = self.rooms.get(room_id) else {
            return false;
        };
        room_entry.lock().chat.clear();
        true
    }

    /// Backing persistent row id for a live room.
    pub fn record_id(&self, room_id: &str) -> Option<i64> {
        self.rooms.get(room_id).map(|e| e.lock().record_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Current viewer entries of a live room.
    pub fn viewers(&self, room_id: &str) -> Option<Vec<ViewerEntry>> {
        let entry = self.rooms.get(room_id)?;
        let room = entry.lock();
        Some(room.viewers.values().cloned().collect())
    }

    pub fn viewer_count(&self, room_id: &str) -> Option<usize> {
        self.rooms.get(room_id).map(|e| e.lock().viewers.len())
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Evict rooms with no viewers and no attached streamer connection
    /// (leaked after a crash or dropped disconnect event). Re-checks the
    /// condition at removal time so a concurrent join is never lost.
    pub fn sweep_orphaned(&self) -> Vec<ClosedRoom> {
        let candidates: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| {
                let room = entry.value().lock();
                room.viewers.is_empty() && room.streamer_conn.is_none()
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = Vec::new();
        for room_id in candidates {
            let removed = self.rooms.remove_if(&room_id, |_, mutex| {
                let room = mutex.lock();
                room.viewers.is_empty() && room.streamer_conn.is_none()
            });
            if let Some((_, mutex)) = removed {
                let room = mutex.into_inner();
                self.owners.remove(&room.streamer_id);
                let duration = (Utc::now() - room.started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                closed.push(ClosedRoom {
                    record_id: room.record_id,
                    room_id: room.room_id,
                    streamer_id: room.streamer_id,
                    reason: "Orphaned room swept".to_string(),
                    chat: room.chat.into_iter().collect(),
                    duration,
                });
            }
        }
        closed
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_room(room_id: &str, streamer_id: &str) -> LiveRoom {
        LiveRoom::new(
            1,
            room_id.to_string(),
            streamer_id.to_string(),
            "streamer".to_string(),
            Some("conn_streamer".to_string()),
        )
    }

    fn chat_entry(id: i64, message: &str) -> ChatEntry {
        ChatEntry {
            id,
            user_id: "usr_1".to_string(),
            username: "alice".to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn create_then_duplicate_room_id_conflicts() {
        let dir = RoomDirectory::new();
        dir.create_room(live_room("room_a", "usr_1")).unwrap();
        assert_eq!(
            dir.create_room(live_room("room_a", "usr_2")),
            Err(DirectoryError::Conflict)
        );
    }

    #[test]
    fn streamer_cannot_own_two_live_rooms() {
        let dir = RoomDirectory::new();
        dir.create_room(live_room("room_a", "usr_1")).unwrap();
        assert_eq!(
            dir.create_room(live_room("room_b", "usr_1")),
            Err(DirectoryError::AlreadyLive)
        );

        // After ending the first, the streamer may go live again.
        dir.end_room("room_a", "done").unwrap();
        dir.create_room(live_room("room_b", "usr_1")).unwrap();
    }

    #[test]
    fn viewer_cap_is_enforced_and_set_unchanged() {
        let dir = RoomDirectory::new();
        dir.create_room(live_room("room_a", "usr_1")).unwrap();

        for i in 0..MAX_VIEWERS {
            dir.attach_viewer("room_a", &format!("conn_{i}"), "usr_v", "v", |_| {})
                .unwrap();
        }
        assert_eq!(dir.viewer_count("room_a"), Some(MAX_VIEWERS));

        // The 101st join fails and leaves the set unchanged.
        let err = dir
            .attach_viewer("room_a", "conn_extra", "usr_v", "v", |_| {
                panic!("publish must not run on failure")
            })
            .unwrap_err();
        assert_eq!(err, DirectoryError::Capacity);
        assert_eq!(dir.viewer_count("room_a"), Some(MAX_VIEWERS));
    }

    #[test]
    fn attach_to_absent_room_is_not_found() {
        let dir = RoomDirectory::new();
        assert_eq!(
            dir.attach_viewer("room_x", "conn_1", "usr_v", "v", |_| {})
                .unwrap_err(),
            DirectoryError::NotFound
        );
    }

    #[test]
    fn detach_is_idempotent_and_publishes_once() {
        let dir = RoomDirectory::new();
        dir.create_room(live_room("room_a", "usr_1")).unwrap();
        dir.attach_viewer("room_a", "conn_v", "usr_v", "v", |_| {})
            .unwrap();

        let mut published = 0;
        let (count, removed) = dir
            .detach_viewer("room_a", "conn_v", |_| published += 1)
            .unwrap();
        assert_eq!((count, removed), (0, true));

        // Second detach: no-op, current count, no publish.
        let (count, removed) = dir
            .detach_viewer("room_a", "conn_v", |_| published += 1)
            .unwrap();
        assert_eq!((count, removed), (0, false));
        assert_eq!(published, 1);
    }

    #[test]
    fn detach_from_absent_room_is_none() {
        let dir = RoomDirectory::new();
        assert!(dir.detach_viewer("room_x", "conn_1", |_| {}).is_none());
    }

    #[test]
    fn chat_history_is_bounded_and_evicts_oldest() {
        let dir = RoomDirectory::new();
        dir.create_room(live_room("room_a", "usr_1")).unwrap();

        for i in 0..(CHAT_HISTORY_LIMIT as i64 + 1) {
            assert!(dir.append_chat("room_a", chat_entry(i, "hi"), |_| {}));
        }

        let closed = dir.end_room("room_a", "done").unwrap();
        assert_eq!(closed.chat.len(), CHAT_HISTORY_LIMIT);
        // Exactly the oldest entry was evicted.
        assert_eq!(closed.chat.first().unwrap().id, 1);
        assert_eq!(closed.chat.last().unwrap().id, CHAT_HISTORY_LIMIT as i64);
    }

    #[test]
    fn append_chat_to_absent_room_is_soft_failure() {
        let dir = RoomDirectory::new();
        assert!(!dir.append_chat("room_x", chat_entry(1, "hi"), |_| {
            panic!("publish must not run")
        }));
    }

    #[test]
    fn remove_chat_filters_by_id() {
        let dir = RoomDirectory::new();
        dir.create_room(live_room("room_a", "usr_1")).unwrap();
        dir.append_chat("room_a", chat_entry(1, "one"), |_| {});
        dir.append_chat("room_a", chat_entry(2, "two"), |_| {});

        assert!(dir.remove_chat("room_a", 1));
        assert!(!dir.remove_chat("room_a", 1));

        let closed = dir.end_room("room_a", "done").unwrap();
        assert_eq!(closed.chat.len(), 1);
        assert_eq!(closed.chat[0].id, 2);
    }

    #[test]
    fn join_snapshot_caps_chat_tail() {
        let dir = RoomDirectory::new();
        dir.create_room(live_room("room_a", "usr_1")).unwrap();
        for i in 0..80 {
            dir.append_chat("room_a", chat_entry(i, "m"), |_| {});
        }

        let snapshot = dir
            .attach_viewer("room_a", "conn_v", "usr_v", "v", |_| {})
            .unwrap();
        assert_eq!(snapshot.chat_tail.len(), CHAT_SNAPSHOT_LIMIT);
        // Tail keeps the most recent messages in order.
        assert_eq!(snapshot.chat_tail.first().unwrap().id, 30);
        assert_eq!(snapshot.chat_tail.last().unwrap().id, 79);
    }

    #[test]
    fn end_room_twice_is_not_found() {
        let dir = RoomDirectory::new();
        dir.create_room(live_room("room_a", "usr_1")).unwrap();
        dir.end_room("room_a", "done").unwrap();
        assert_eq!(
            dir.end_room("room_a", "done").unwrap_err(),
            DirectoryError::NotFound
        );
        assert!(!dir.contains("room_a"));
    }

    #[test]
    fn sweep_removes_only_orphaned_rooms() {
        let dir = RoomDirectory::new();

        // Orphaned: no viewers, no streamer connection.
        let mut orphan = live_room("room_orphan", "usr_1");
        orphan.streamer_conn = None;
        dir.create_room(orphan).unwrap();

        // Healthy: streamer attached.
        dir.create_room(live_room("room_live", "usr_2")).unwrap();

        // Watched: no streamer connection but a viewer present.
        let mut watched = live_room("room_watched", "usr_3");
        watched.streamer_conn = None;
        dir.create_room(watched).unwrap();
        dir.attach_viewer("room_watched", "conn_v", "usr_v", "v", |_| {})
            .unwrap();

        let closed = dir.sweep_orphaned();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].room_id, "room_orphan");
        assert!(dir.contains("room_live"));
        assert!(dir.contains("room_watched"));

        // Owner slot is freed by the sweep.
        dir.create_room(live_room("room_again", "usr_1")).unwrap();
    }
}
