//! Abstraction over the relational datastore.
//!
//! The gateway and HTTP routes consume this trait; `db::pg::PgStore` is the
//! production implementation and `MemoryStore` backs the test suite (same
//! pattern as `db::kv`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use beacon_common::SnowflakeGenerator;

use crate::models::ban::{Ban, NewBan};
use crate::models::message::{Message, NewMessage};
use crate::models::room::{NewRoom, Room};
use crate::models::user::{NewUser, User};

/// Datastore failure, reduced to what callers need to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Unique constraint hit; the message is client-safe.
    Conflict(&'static str),
    NotFound,
    /// The store could not be reached or the query failed.
    Unavailable,
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    // Users
    async fn create_user(&self, new: NewUser) -> Result<User, StoreError>;
    async fn find_user_by_username(&self, username_lower: &str)
        -> Result<Option<User>, StoreError>;
    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError>;
    async fn set_user_streaming(&self, user_id: &str, streaming: bool) -> Result<(), StoreError>;
    async fn set_stream_key(&self, user_id: &str, key: &str) -> Result<Option<User>, StoreError>;

    // Rooms
    async fn create_room_record(&self, new: NewRoom) -> Result<Room, StoreError>;
    async fn find_room_by_external_id(&self, room_id: &str) -> Result<Option<Room>, StoreError>;
    async fn live_room_for_streamer(&self, streamer_id: &str)
        -> Result<Option<Room>, StoreError>;
    async fn live_rooms(&self, limit: i64, offset: i64) -> Result<Vec<Room>, StoreError>;
    async fn end_room_record(&self, room_id: &str) -> Result<Option<Room>, StoreError>;
    async fn update_room_info(
        &self,
        room_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Room>, StoreError>;
    async fn update_viewer_count(&self, room_id: &str, count: i32) -> Result<(), StoreError>;

    // Bans — always consulted live, never cached in memory.
    async fn is_user_banned(
        &self,
        room_record_id: i64,
        user_id: &str,
    ) -> Result<Option<Ban>, StoreError>;
    async fn create_ban(&self, new: NewBan) -> Result<Ban, StoreError>;
    async fn remove_ban(&self, room_record_id: i64, user_id: &str) -> Result<bool, StoreError>;

    // Chat messages
    async fn insert_chat_message(&self, new: NewMessage) -> Result<Message, StoreError>;
    async fn soft_delete_chat_message(&self, message_id: i64) -> Result<bool, StoreError>;
    async fn active_messages(
        &self,
        room_record_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    users: Vec<User>,
    rooms: Vec<Room>,
    bans: Vec<Ban>,
    messages: Vec<Message>,
}

pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    snowflake: SnowflakeGenerator,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            snowflake: SnowflakeGenerator::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Simulate the datastore being unreachable: every call fails.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if inner
            .users
            .iter()
            .any(|u| u.username_lower == new.username_lower)
        {
            return Err(StoreError::Conflict("Username is already taken"));
        }
        if inner.users.iter().any(|u| u.email == new.email) {
            return Err(StoreError::Conflict("Email is already registered"));
        }
        let user = User {
            id: new.id,
            username: new.username,
            username_lower: new.username_lower,
            email: new.email,
            password_hash: new.password_hash,
            stream_key: new.stream_key,
            is_streaming: false,
            created_at: Utc::now(),
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn find_user_by_username(
        &self,
        username_lower: &str,
    ) -> Result<Option<User>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .iter()
            .find(|u| u.username_lower == username_lower)
            .cloned())
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.iter().find(|u| u.id == id).cloned())
    }

    async fn set_user_streaming(&self, user_id: &str, streaming: bool) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.users.iter_mut().find(|u| u.id == user_id) {
            user.is_streaming = streaming;
        }
        Ok(())
    }

    async fn set_stream_key(&self, user_id: &str, key: &str) -> Result<Option<User>, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.users.iter_mut().find(|u| u.id == user_id).map(|u| {
            u.stream_key = key.to_string();
            u.clone()
        }))
    }

    async fn create_room_record(&self, new: NewRoom) -> Result<Room, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.rooms.iter().any(|r| r.room_id == new.room_id) {
            return Err(StoreError::Conflict("Room already exists"));
        }
        let room = Room {
            id: self.snowflake.generate(),
            room_id: new.room_id,
            streamer_id: new.streamer_id,
            streamer_username: new.streamer_username,
            title: new.title,
            description: new.description,
            category: new.category,
            is_live: new.is_live,
            viewer_count: 0,
            peak_viewers: 0,
            started_at: new.started_at,
            ended_at: None,
            created_at: Utc::now(),
        };
        inner.rooms.push(room.clone());
        Ok(room)
    }

    async fn find_room_by_external_id(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.rooms.iter().find(|r| r.room_id == room_id).cloned())
    }

    async fn live_room_for_streamer(
        &self,
        streamer_id: &str,
    ) -> Result<Option<Room>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rooms
            .iter()
            .find(|r| r.streamer_id == streamer_id && r.is_live)
            .cloned())
    }

    async fn live_rooms(&self, limit: i64, offset: i64) -> Result<Vec<Room>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        let mut live: Vec<Room> = inner.rooms.iter().filter(|r| r.is_live).cloned().collect();
        live.sort_by(|a, b| {
            b.viewer_count
                .cmp(&a.viewer_count)
                .then(b.started_at.cmp(&a.started_at))
        });
        Ok(live
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn end_room_record(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .rooms
            .iter_mut()
            .find(|r| r.room_id == room_id && r.is_live)
            .map(|r| {
                r.is_live = false;
                r.ended_at = Some(Utc::now());
                r.viewer_count = 0;
                r.clone()
            }))
    }

    async fn update_room_info(
        &self,
        room_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Room>, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .rooms
            .iter_mut()
            .find(|r| r.room_id == room_id)
            .map(|r| {
                if let Some(title) = title {
                    r.title = title.to_string();
                }
                if let Some(description) = description {
                    r.description = Some(description.to_string());
                }
                r.clone()
            }))
    }

    async fn update_viewer_count(&self, room_id: &str, count: i32) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(room) = inner.rooms.iter_mut().find(|r| r.room_id == room_id) {
            room.viewer_count = count;
            room.peak_viewers = room.peak_viewers.max(count);
        }
        Ok(())
    }

    async fn is_user_banned(
        &self,
        room_record_id: i64,
        user_id: &str,
    ) -> Result<Option<Ban>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        Ok(inner
            .bans
            .iter()
            .find(|b| {
                b.room_id == room_record_id
                    && b.user_id == user_id
                    && b.expires_at.map(|at| at > now).unwrap_or(true)
            })
            .cloned())
    }

    async fn create_ban(&self, new: NewBan) -> Result<Ban, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .bans
            .retain(|b| !(b.room_id == new.room_id && b.user_id == new.user_id));
        let ban = Ban {
            room_id: new.room_id,
            user_id: new.user_id,
            banned_by: new.banned_by,
            reason: new.reason,
            expires_at: new.expires_at,
            created_at: Utc::now(),
        };
        inner.bans.push(ban.clone());
        Ok(ban)
    }

    async fn remove_ban(&self, room_record_id: i64, user_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.bans.len();
        inner
            .bans
            .retain(|b| !(b.room_id == room_record_id && b.user_id == user_id));
        Ok(inner.bans.len() < before)
    }

    async fn insert_chat_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let message = Message {
            id: self.snowflake.generate(),
            room_id: new.room_id,
            user_id: new.user_id,
            username: new.username,
            content: new.content,
            deleted: false,
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn soft_delete_chat_message(&self, message_id: i64) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && !m.deleted)
            .map(|m| {
                m.deleted = true;
            })
            .is_some())
    }

    async fn active_messages(
        &self,
        room_record_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        let mut msgs: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.room_id == room_record_id && !m.deleted)
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.id);
        msgs.truncate(limit.max(0) as usize);
        Ok(msgs)
    }
}
