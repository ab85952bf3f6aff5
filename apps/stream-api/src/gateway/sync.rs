//! Mirrors committed in-memory transitions to the durable store and cache.
//!
//! Room lifecycle writes are awaited before the in-memory transition is
//! treated as committed, since HTTP reads ("is this room live") must
//! reflect them immediately. Chat persistence is awaited too — the durable
//! id is needed for the broadcast payload. High-frequency viewer-count and
//! stat updates are fire-and-forget.

use std::sync::Arc;

use crate::db::kv::KeyValueStore;
use crate::db::store::{StoreError, StreamStore};
use crate::models::message::{Message, NewMessage};
use crate::models::room::Room;

/// Cache hash indexing currently-live rooms for cross-process readers.
pub const LIVE_ROOMS_KEY: &str = "live_rooms";

pub struct SyncAdapter {
    store: Arc<dyn StreamStore>,
    kv: Arc<dyn KeyValueStore>,
}

impl SyncAdapter {
    pub fn new(store: Arc<dyn StreamStore>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self { store, kv }
    }

    /// Persist a chat message, returning the store-assigned id and
    /// timestamp. The only synchronous per-message write.
    pub async fn persist_chat(
        &self,
        room_record_id: i64,
        user_id: &str,
        username: &str,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.store
            .insert_chat_message(NewMessage {
                room_id: room_record_id,
                user_id: user_id.to_string(),
                username: username.to_string(),
                content: content.to_string(),
            })
            .await
    }

    /// Soft-delete a chat message in the durable store.
    pub async fn delete_chat(&self, message_id: i64) -> Result<bool, StoreError> {
        self.store.soft_delete_chat_message(message_id).await
    }

    /// Index a room as live in the cache. Best-effort.
    pub async fn room_live(&self, room: &Room) {
        let value = serde_json::json!({
            "roomId": room.room_id,
            "title": room.title,
            "category": room.category,
            "streamer": room.streamer_username,
        });
        if let Err(e) = self
            .kv
            .hset(LIVE_ROOMS_KEY, &room.room_id, &value.to_string())
            .await
        {
            tracing::warn!(%e, room_id = %room.room_id, "failed to index live room");
        }
    }

    /// Finalize an ended room: durable record, streamer flag, cache index.
    /// Failures are logged; teardown must still complete in memory.
    pub async fn room_ended(&self, room_id: &str, streamer_id: &str) {
        if let Err(e) = self.store.end_room_record(room_id).await {
            tracing::error!(?e, room_id, "failed to finalize room record");
        }
        if let Err(e) = self.store.set_user_streaming(streamer_id, false).await {
            tracing::error!(?e, streamer_id, "failed to clear streaming flag");
        }
        if let Err(e) = self.kv.hdel(LIVE_ROOMS_KEY, room_id).await {
            tracing::warn!(%e, room_id, "failed to drop live room index entry");
        }
    }

    /// Fire-and-forget viewer-count mirror.
    pub fn viewer_count_changed(&self, room_id: &str, count: usize) {
        let store = self.store.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.update_viewer_count(&room_id, count as i32).await {
                tracing::warn!(?e, room_id, "failed to mirror viewer count");
            }
        });
    }

    /// Fire-and-forget per-room stat counter bump.
    pub fn bump_stat(&self, room_id: &str, field: &'static str) {
        let kv = self.kv.clone();
        let key = format!("room:{room_id}:stats");
        tokio::spawn(async move {
            if let Err(e) = kv.hincr(&key, field, 1).await {
                tracing::warn!(%e, key, field, "failed to bump room stat");
            }
        });
    }
}
