//! Periodic reconciliation of leaked state.
//!
//! Two independent passes: orphaned rooms out of the directory, stale
//! entries out of the presence hash. A failure in either pass is logged
//! and never blocks the other or crashes the process.

use std::time::Duration;

use crate::AppState;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Presence entries whose last-seen timestamp is older than this are
/// dropped.
pub const PRESENCE_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Start the sweeper on its fixed interval.
pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(SWEEP_INTERVAL);
        timer.tick().await; // First tick fires immediately; skip it.
        loop {
            timer.tick().await;
            tracing::debug!("running gateway sweep");
            run_once(&state).await;
        }
    })
}

/// One full sweep. Public so tests can drive it without the timer.
pub async fn run_once(state: &AppState) {
    // Pass (a): rooms with no viewers and no streamer connection.
    let closed = state.rooms.sweep_orphaned();
    for room in &closed {
        // Finalization failures are logged inside and don't stop the pass.
        state.sync.room_ended(&room.room_id, &room.streamer_id).await;
        tracing::debug!(room_id = %room.room_id, "cleaned up orphaned room");
    }
    if !closed.is_empty() {
        tracing::info!(count = closed.len(), "orphaned rooms swept");
    }

    // Pass (b): stale presence entries.
    match state.presence.sweep_stale(PRESENCE_STALE_AFTER).await {
        Ok(removed) if removed > 0 => {
            tracing::debug!(removed, "stale presence entries swept");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(%e, "presence sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use chrono::Utc;

    use crate::config::Config;
    use crate::db::kv::{KeyValueStore, MemoryKv};
    use crate::db::store::{MemoryStore, StreamStore};
    use crate::gateway::directory::{LiveRoom, RoomDirectory};
    use crate::gateway::fanout::GatewayBroadcast;
    use crate::gateway::presence::{PresenceTracker, ONLINE_USERS_KEY};
    use crate::gateway::sync::SyncAdapter;
    use crate::models::room::NewRoom;
    use crate::AppState;

    fn test_state() -> (AppState, Arc<MemoryStore>, Arc<MemoryKv>) {
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let store_dyn: Arc<dyn StreamStore> = store.clone();
        let kv_dyn: Arc<dyn KeyValueStore> = kv.clone();

        let config = Config {
            database_url: String::new(),
            redis_url: None,
            jwt_secret: "test-secret".to_string(),
            port: 0,
            chat_rate_limit_enabled: false,
        };

        let state = AppState {
            store: store_dyn.clone(),
            kv: kv_dyn.clone(),
            config: Arc::new(config),
            rooms: Arc::new(RoomDirectory::new()),
            presence: Arc::new(PresenceTracker::new(kv_dyn.clone())),
            sync: Arc::new(SyncAdapter::new(store_dyn, kv_dyn)),
            broadcast: GatewayBroadcast::new(),
        };
        (state, store, kv)
    }

    async fn seed_room(store: &MemoryStore, room_id: &str) -> i64 {
        store
            .create_room_record(NewRoom {
                room_id: room_id.to_string(),
                streamer_id: "usr_1".to_string(),
                streamer_username: "alice".to_string(),
                title: "test".to_string(),
                description: None,
                category: None,
                is_live: true,
                started_at: Some(Utc::now()),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn sweep_finalizes_orphaned_rooms() {
        let (state, store, _kv) = test_state();

        let record_id = seed_room(&store, "room_orphan").await;
        let orphan = LiveRoom::new(
            record_id,
            "room_orphan".to_string(),
            "usr_1".to_string(),
            "alice".to_string(),
            None,
        );
        state.rooms.create_room(orphan).unwrap();

        run_once(&state).await;

        assert!(!state.rooms.contains("room_orphan"));
        let record = store
            .find_room_by_external_id("room_orphan")
            .await
            .unwrap()
            .unwrap();
        assert!(!record.is_live);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn sweep_leaves_attached_rooms_alone() {
        let (state, store, _kv) = test_state();

        let record_id = seed_room(&store, "room_live").await;
        state
            .rooms
            .create_room(LiveRoom::new(
                record_id,
                "room_live".to_string(),
                "usr_1".to_string(),
                "alice".to_string(),
                Some("conn_streamer".to_string()),
            ))
            .unwrap();

        run_once(&state).await;
        assert!(state.rooms.contains("room_live"));
    }

    #[tokio::test]
    async fn presence_pass_removes_stale_entries() {
        let (state, _store, kv) = test_state();

        let stale = serde_json::json!({
            "connId": "conn_old",
            "lastSeen": Utc::now().timestamp_millis() - 600_000,
        });
        kv.hset(ONLINE_USERS_KEY, "usr_stale", &stale.to_string())
            .await
            .unwrap();

        run_once(&state).await;
        assert!(kv
            .hget(ONLINE_USERS_KEY, "usr_stale")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn presence_pass_failure_does_not_block_room_pass() {
        let (state, store, kv) = test_state();

        let record_id = seed_room(&store, "room_orphan").await;
        state
            .rooms
            .create_room(LiveRoom::new(
                record_id,
                "room_orphan".to_string(),
                "usr_1".to_string(),
                "alice".to_string(),
                None,
            ))
            .unwrap();

        // Cache down: the presence pass fails, the room pass still runs
        // (its cache writes degrade to logged warnings).
        kv.set_fail(true);
        run_once(&state).await;

        assert!(!state.rooms.contains("room_orphan"));
    }
}
