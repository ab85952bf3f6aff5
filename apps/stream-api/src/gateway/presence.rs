//! Presence and rate counters, backed by the external cache.
//!
//! The cache is treated as potentially unavailable. Rate checks fail OPEN:
//! a cache outage must not block chat or connects. The join-time ban check
//! lives in the durable store and fails CLOSED.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::kv::{KeyValueStore, KvError};

/// Cache hash holding one entry per online user.
pub const ONLINE_USERS_KEY: &str = "online_users";

#[derive(Debug, Serialize, Deserialize)]
struct OnlineEntry {
    #[serde(rename = "connId")]
    conn_id: String,
    /// Unix millis of the last connect; used only for staleness sweeping,
    /// not authoritative for live-room membership.
    #[serde(rename = "lastSeen")]
    last_seen: i64,
}

pub struct PresenceTracker {
    kv: Arc<dyn KeyValueStore>,
}

impl PresenceTracker {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Upsert the user's online entry with the current timestamp.
    /// Best-effort: cache failures are logged, never surfaced.
    pub async fn mark_online(&self, user_id: &str, conn_id: &str) {
        let entry = OnlineEntry {
            conn_id: conn_id.to_string(),
            last_seen: Utc::now().timestamp_millis(),
        };
        let value = serde_json::to_string(&entry).expect("serialize online entry");
        if let Err(e) = self.kv.hset(ONLINE_USERS_KEY, user_id, &value).await {
            tracing::warn!(%e, user_id, "failed to mark user online");
        }
    }

    /// Remove the user's online entry. Best-effort.
    pub async fn mark_offline(&self, user_id: &str) {
        if let Err(e) = self.kv.hdel(ONLINE_USERS_KEY, user_id).await {
            tracing::warn!(%e, user_id, "failed to mark user offline");
        }
    }

    /// Remove online entries whose last-seen timestamp is older than
    /// `max_age`. Returns the number of entries removed.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize, KvError> {
        let entries = self.kv.hgetall(ONLINE_USERS_KEY).await?;
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let mut removed = 0;

        for (user_id, value) in entries {
            let stale = match serde_json::from_str::<OnlineEntry>(&value) {
                Ok(entry) => entry.last_seen < cutoff,
                // Unparseable entries are stale by definition.
                Err(_) => true,
            };
            if stale {
                self.kv.hdel(ONLINE_USERS_KEY, &user_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Atomic windowed increment: the expiry is set only on the first
    /// increment of a window (count == 1).
    ///
    /// Returns `None` when the cache is unavailable — callers FAIL OPEN and
    /// allow the guarded action.
    pub async fn incr_with_window(&self, key: &str, window_secs: u64) -> Option<i64> {
        match self.kv.incr(key).await {
            Ok(count) => {
                if count == 1 {
                    if let Err(e) = self.kv.expire(key, window_secs).await {
                        tracing::warn!(%e, key, "failed to set rate window expiry");
                    }
                }
                Some(count)
            }
            Err(e) => {
                tracing::warn!(%e, key, "rate counter unavailable, failing open");
                None
            }
        }
    }

    /// Record a chat timeout for a user in a room; expires with the TTL.
    pub async fn set_timeout(
        &self,
        room_id: &str,
        user_id: &str,
        duration_secs: u64,
    ) -> Result<(), KvError> {
        self.kv
            .set_ex(&timeout_key(room_id, user_id), "1", duration_secs)
            .await
    }

    /// Whether the user currently has an active timeout in the room.
    /// Fails open: an unreachable cache never blocks chat.
    pub async fn is_timed_out(&self, room_id: &str, user_id: &str) -> bool {
        match self.kv.get(&timeout_key(room_id, user_id)).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                tracing::warn!(%e, room_id, user_id, "timeout check unavailable, failing open");
                false
            }
        }
    }
}

fn timeout_key(room_id: &str, user_id: &str) -> String {
    format!("timeout:{room_id}:{user_id}")
}
