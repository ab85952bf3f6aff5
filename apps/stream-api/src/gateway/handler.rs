//! Client event dispatch: the state machine driving room membership, chat,
//! and moderation.
//!
//! Every handler returns a structured ack to the calling session only —
//! `{success:true, ...}` or `{error:"..."}` — and never lets a failure
//! escape the handler boundary. Broadcasts are side effects, emitted via
//! the fanout hub and always distinct from the per-call ack.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::db::store::StreamStore;
use crate::gateway::directory::{ChatEntry, DirectoryError, LiveRoom};
use crate::gateway::events::{
    ChatMessagePayload, CreateRoomPayload, DeleteMessagePayload, EventName, JoinRoomPayload,
    RequestName, SendReactionPayload, TimeoutUserPayload, UpdateStreamInfoPayload,
};
use crate::gateway::fanout::Scope;
use crate::gateway::moderation::{self, MAX_MESSAGE_LENGTH};
use crate::gateway::session::{Session, SessionState};
use crate::AppState;

/// Chat rate limit: messages per window (applied only when enabled).
pub const CHAT_RATE_LIMIT: i64 = 5;
pub const CHAT_RATE_WINDOW_SECS: u64 = 10;

/// Handler failure taxonomy. Converted to a client-safe ack; upstream
/// details are never surfaced verbatim.
#[derive(Debug)]
pub enum GatewayError {
    NotFound(&'static str),
    AlreadyLive,
    Conflict(&'static str),
    Capacity,
    Banned {
        reason: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    Validation(&'static str),
    NotAuthorized(&'static str),
    RateLimited {
        retry_after: u64,
    },
    /// Durable store or cache failure on a path that fails closed.
    Upstream,
}

impl GatewayError {
    pub fn to_ack(&self) -> Value {
        match self {
            Self::NotFound(m) | Self::Conflict(m) | Self::Validation(m) | Self::NotAuthorized(m) => {
                json!({ "error": m })
            }
            Self::AlreadyLive => json!({ "error": "You already have a live room" }),
            Self::Capacity => json!({ "error": "Room is full (max 100 viewers)" }),
            Self::Banned { reason, expires_at } => json!({
                "error": "You are banned from this room",
                "reason": reason,
                "expiresAt": expires_at,
            }),
            Self::RateLimited { retry_after } => json!({
                "error": format!(
                    "Slow down! You can send another message in {retry_after} seconds"
                ),
                "retryAfter": retry_after,
            }),
            Self::Upstream => json!({ "error": "Service temporarily unavailable" }),
        }
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, GatewayError> {
    serde_json::from_value(payload).map_err(|_| GatewayError::Validation("Invalid payload"))
}

/// Dispatch one client request and produce its ack payload. Failures never
/// propagate past here.
pub async fn handle_request(
    state: &AppState,
    session: &mut Session,
    event: &str,
    payload: Value,
) -> Value {
    let result = match event {
        RequestName::CREATE_ROOM => create_room(state, session, payload).await,
        RequestName::JOIN_ROOM => join_room(state, session, payload).await,
        RequestName::LEAVE_ROOM => leave_room(state, session).await,
        RequestName::CHAT_MESSAGE => chat_message(state, session, payload).await,
        RequestName::DELETE_MESSAGE => delete_message(state, session, payload).await,
        RequestName::CLEAR_CHAT => clear_chat(state, session).await,
        RequestName::TIMEOUT_USER => timeout_user(state, session, payload).await,
        RequestName::SEND_REACTION => send_reaction(state, session, payload).await,
        RequestName::GET_VIEWERS => get_viewers(state, session).await,
        RequestName::UPDATE_STREAM_INFO => update_stream_info(state, session, payload).await,
        _ => Err(GatewayError::Validation("Unknown event")),
    };

    match result {
        Ok(ack) => ack,
        Err(err) => {
            tracing::debug!(?err, event, user_id = %session.user_id, "request failed");
            err.to_ack()
        }
    }
}

// ---------------------------------------------------------------------------
// create-room (streamer)
// ---------------------------------------------------------------------------

async fn create_room(
    state: &AppState,
    session: &mut Session,
    payload: Value,
) -> Result<Value, GatewayError> {
    if session.room_id().is_some() {
        return Err(GatewayError::Validation("Already in a room"));
    }
    let p: CreateRoomPayload = parse(payload)?;

    // Validate against the durable record: the room row must exist and
    // belong to the caller.
    let record = state
        .store
        .find_room_by_external_id(&p.room_id)
        .await
        .map_err(|_| GatewayError::Upstream)?
        .ok_or(GatewayError::NotFound("Room not found"))?;

    if record.streamer_id != session.user_id {
        return Err(GatewayError::NotAuthorized("Not authorized"));
    }

    let live = LiveRoom::new(
        record.id,
        record.room_id.clone(),
        session.user_id.clone(),
        session.username.clone(),
        Some(session.conn_id.clone()),
    );
    match state.rooms.create_room(live) {
        Ok(()) => {}
        Err(DirectoryError::AlreadyLive) => return Err(GatewayError::AlreadyLive),
        Err(_) => return Err(GatewayError::Conflict("Room is already live")),
    }

    state.sync.room_live(&record).await;
    session.attach_as_streamer(record.room_id.clone());

    tracing::info!(room_id = %record.room_id, streamer = %session.username, "room initialized");

    // Announce the new stream to every session outside the room.
    state.broadcast.dispatch(
        Scope::Global {
            exclude: Some(session.conn_id.clone()),
        },
        EventName::NEW_STREAM_STARTED,
        json!({
            "roomId": record.room_id,
            "title": record.title,
            "category": record.category,
            "streamer": session.username,
        }),
    );

    Ok(json!({
        "success": true,
        "room": {
            "roomId": record.room_id,
            "title": record.title,
            "description": record.description,
            "category": record.category,
            "streamer": session.username,
            "startedAt": record.started_at,
        },
    }))
}

// ---------------------------------------------------------------------------
// join-room (viewer)
// ---------------------------------------------------------------------------

async fn join_room(
    state: &AppState,
    session: &mut Session,
    payload: Value,
) -> Result<Value, GatewayError> {
    if session.room_id().is_some() {
        return Err(GatewayError::Validation("Already in a room"));
    }
    let p: JoinRoomPayload = parse(payload)?;

    let record_id = state
        .rooms
        .record_id(&p.room_id)
        .ok_or(GatewayError::NotFound("Room not found or not live"))?;

    // Ban check against the durable store — never cached, and it fails
    // CLOSED: an unreachable store denies the join.
    let ban = state
        .store
        .is_user_banned(record_id, &session.user_id)
        .await
        .map_err(|_| GatewayError::Upstream)?;
    if let Some(ban) = ban {
        return Err(GatewayError::Banned {
            reason: ban.reason,
            expires_at: ban.expires_at,
        });
    }

    let snapshot = state
        .rooms
        .attach_viewer(
            &p.room_id,
            &session.conn_id,
            &session.user_id,
            &session.username,
            |snap| {
                state.broadcast.dispatch(
                    Scope::Room(p.room_id.clone()),
                    EventName::VIEWER_JOINED,
                    json!({
                        "userId": session.user_id,
                        "username": session.username,
                        "viewerCount": snap.viewer_count,
                    }),
                );
            },
        )
        .map_err(|e| match e {
            DirectoryError::Capacity => GatewayError::Capacity,
            _ => GatewayError::NotFound("Room not found or not live"),
        })?;

    session.attach_as_viewer(p.room_id.clone());

    // Out-of-band signal, addressed to the streamer connection only, so it
    // can open the direct media handshake with this viewer.
    if let Some(streamer_conn) = &snapshot.streamer_conn {
        state.broadcast.dispatch(
            Scope::Conn(streamer_conn.clone()),
            EventName::NEW_VIEWER,
            json!({
                "viewerId": session.conn_id,
                "username": session.username,
            }),
        );
    }

    state
        .sync
        .viewer_count_changed(&p.room_id, snapshot.viewer_count);
    state.sync.bump_stat(&p.room_id, "totalViews");

    tracing::info!(room_id = %p.room_id, viewer = %session.username, "viewer joined");

    Ok(json!({
        "success": true,
        "room": {
            "roomId": p.room_id,
            "viewerCount": snapshot.viewer_count,
            "chatHistory": snapshot.chat_tail,
            "streamer": snapshot.streamer_username,
        },
    }))
}

// ---------------------------------------------------------------------------
// leave-room / disconnect
// ---------------------------------------------------------------------------

async fn leave_room(state: &AppState, session: &mut Session) -> Result<Value, GatewayError> {
    match session.state().clone() {
        SessionState::Unbound => Err(GatewayError::Validation("Not in a room")),
        SessionState::Publishing { room_id } => {
            end_stream(state, session, &room_id, "Streamer ended the stream").await;
            Ok(json!({ "success": true }))
        }
        SessionState::Viewing { room_id } => {
            viewer_leave(state, session, &room_id).await;
            Ok(json!({ "success": true }))
        }
    }
}

/// Teardown entry point for an abrupt close. Deterministically mirrors
/// `leave-room` and tolerates running after an explicit leave (the session
/// is already unbound, so only presence is touched).
pub async fn handle_disconnect(state: &AppState, session: &mut Session) {
    match session.state().clone() {
        SessionState::Publishing { room_id } => {
            end_stream(state, session, &room_id, "Streamer disconnected").await;
        }
        SessionState::Viewing { room_id } => {
            viewer_leave(state, session, &room_id).await;
        }
        SessionState::Unbound => {}
    }
    state.presence.mark_offline(&session.user_id).await;
}

async fn end_stream(state: &AppState, session: &mut Session, room_id: &str, reason: &str) {
    // Already finalized elsewhere (HTTP delete, sweeper) — nothing left to
    // broadcast or write, only the session state to clear.
    if !state.rooms.contains(room_id) {
        session.detach();
        return;
    }

    // Members hear about the end before teardown.
    state.broadcast.dispatch(
        Scope::Room(room_id.to_string()),
        EventName::STREAM_ENDED,
        json!({ "reason": reason }),
    );

    // Durable finalization happens before the in-memory removal commits.
    state.sync.room_ended(room_id, &session.user_id).await;

    match state.rooms.end_room(room_id, reason) {
        Ok(closed) => {
            tracing::info!(
                room_id,
                reason,
                duration_secs = closed.duration.as_secs(),
                messages = closed.chat.len(),
                "stream ended"
            );
        }
        // Removed by a racing teardown after the check above — benign.
        Err(DirectoryError::NotFound) => {}
        Err(e) => tracing::warn!(?e, room_id, "unexpected end_room failure"),
    }

    session.detach();
}

async fn viewer_leave(state: &AppState, session: &mut Session, room_id: &str) {
    let result = state
        .rooms
        .detach_viewer(room_id, &session.conn_id, |count| {
            state.broadcast.dispatch(
                Scope::Room(room_id.to_string()),
                EventName::VIEWER_LEFT,
                json!({
                    "userId": session.user_id,
                    "username": session.username,
                    "viewerCount": count,
                }),
            );
        });

    if let Some((count, true)) = result {
        state.sync.viewer_count_changed(room_id, count);
    }

    session.detach();
}

// ---------------------------------------------------------------------------
// chat-message
// ---------------------------------------------------------------------------

async fn chat_message(
    state: &AppState,
    session: &mut Session,
    payload: Value,
) -> Result<Value, GatewayError> {
    let room_id = session
        .room_id()
        .ok_or(GatewayError::Validation("Not in a room"))?
        .to_string();
    let p: ChatMessagePayload = parse(payload)?;

    let trimmed = p.message.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::Validation("Message cannot be empty"));
    }
    if trimmed.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(GatewayError::Validation(
            "Message too long (max 500 characters)",
        ));
    }

    let record_id = state
        .rooms
        .record_id(&room_id)
        .ok_or(GatewayError::NotFound("Room not found"))?;

    // An active moderation timeout blocks chat. The check fails open on a
    // cache outage, like every rate-style gate.
    if state.presence.is_timed_out(&room_id, &session.user_id).await {
        return Err(GatewayError::NotAuthorized("You are timed out in this room"));
    }

    if state.config.chat_rate_limit_enabled {
        let key = format!("chat_rate:{}:{}", session.user_id, room_id);
        if let Some(count) = state
            .presence
            .incr_with_window(&key, CHAT_RATE_WINDOW_SECS)
            .await
        {
            if count > CHAT_RATE_LIMIT {
                return Err(GatewayError::RateLimited {
                    retry_after: CHAT_RATE_WINDOW_SECS,
                });
            }
        }
    }

    let clean = moderation::filter_denylist(&moderation::strip_markup(trimmed));

    // Synchronous persistence: the broadcast payload carries the durable id.
    let saved = state
        .sync
        .persist_chat(record_id, &session.user_id, &session.username, &clean)
        .await
        .map_err(|_| GatewayError::Upstream)?;

    let entry = ChatEntry {
        id: saved.id,
        user_id: session.user_id.clone(),
        username: session.username.clone(),
        message: clean,
        timestamp: saved.created_at,
    };
    let entry_json = serde_json::to_value(&entry).expect("serialize chat entry");

    // Publish runs under the room lock, so broadcast order matches append
    // order. A missing room here is an in-flight message racing the
    // stream's end — a soft failure.
    let appended = state.rooms.append_chat(&room_id, entry, |e| {
        state.broadcast.dispatch(
            Scope::Room(room_id.clone()),
            EventName::NEW_MESSAGE,
            serde_json::to_value(e).expect("serialize chat entry"),
        );
    });
    if !appended {
        return Err(GatewayError::NotFound("Room not found"));
    }

    state.sync.bump_stat(&room_id, "messageCount");

    Ok(json!({ "success": true, "message": entry_json }))
}

// ---------------------------------------------------------------------------
// delete-message / clear-chat / timeout-user (streamer-only moderation)
// ---------------------------------------------------------------------------

fn require_streamer(session: &Session) -> Result<String, GatewayError> {
    match session.state() {
        SessionState::Publishing { room_id } => Ok(room_id.clone()),
        _ => Err(GatewayError::NotAuthorized("Not authorized")),
    }
}

async fn delete_message(
    state: &AppState,
    session: &mut Session,
    payload: Value,
) -> Result<Value, GatewayError> {
    let room_id = require_streamer(session)?;
    let p: DeleteMessagePayload = parse(payload)?;

    state
        .sync
        .delete_chat(p.message_id)
        .await
        .map_err(|_| GatewayError::Upstream)?;
    state.rooms.remove_chat(&room_id, p.message_id);

    state.broadcast.dispatch(
        Scope::Room(room_id.clone()),
        EventName::MESSAGE_DELETED,
        json!({ "messageId": p.message_id }),
    );

    tracing::info!(room_id, message_id = p.message_id, by = %session.username, "message deleted");
    Ok(json!({ "success": true }))
}

async fn clear_chat(state: &AppState, session: &mut Session) -> Result<Value, GatewayError> {
    let room_id = require_streamer(session)?;

    state.rooms.clear_chat(&room_id);
    state.broadcast.dispatch(
        Scope::Room(room_id.clone()),
        EventName::CHAT_CLEARED,
        json!({}),
    );

    tracing::info!(room_id, "chat cleared");
    Ok(json!({ "success": true }))
}

async fn timeout_user(
    state: &AppState,
    session: &mut Session,
    payload: Value,
) -> Result<Value, GatewayError> {
    let room_id = require_streamer(session)?;
    let p: TimeoutUserPayload = parse(payload)?;

    state
        .presence
        .set_timeout(&room_id, &p.user_id, p.duration)
        .await
        .map_err(|_| GatewayError::Upstream)?;

    state.broadcast.dispatch(
        Scope::Room(room_id.clone()),
        EventName::USER_TIMED_OUT,
        json!({
            "userId": p.user_id,
            "duration": p.duration,
            "by": session.username,
        }),
    );

    tracing::info!(room_id, target = %p.user_id, duration = p.duration, "user timed out");
    Ok(json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// send-reaction / get-viewers / update-stream-info
// ---------------------------------------------------------------------------

async fn send_reaction(
    state: &AppState,
    session: &mut Session,
    payload: Value,
) -> Result<Value, GatewayError> {
    let room_id = session
        .room_id()
        .ok_or(GatewayError::Validation("Not in a room"))?
        .to_string();
    let p: SendReactionPayload = parse(payload)?;

    state.broadcast.dispatch(
        Scope::Room(room_id),
        EventName::REACTION,
        json!({
            "userId": session.user_id,
            "username": session.username,
            "emoji": p.emoji,
            "timestamp": Utc::now(),
        }),
    );

    Ok(json!({ "success": true }))
}

async fn get_viewers(state: &AppState, session: &mut Session) -> Result<Value, GatewayError> {
    let room_id = session
        .room_id()
        .ok_or(GatewayError::Validation("Not in a room"))?;

    let viewers = state
        .rooms
        .viewers(room_id)
        .ok_or(GatewayError::NotFound("Room not found"))?;

    Ok(json!({
        "success": true,
        "viewers": viewers,
    }))
}

async fn update_stream_info(
    state: &AppState,
    session: &mut Session,
    payload: Value,
) -> Result<Value, GatewayError> {
    let room_id = require_streamer(session)?;
    let p: UpdateStreamInfoPayload = parse(payload)?;

    state
        .store
        .update_room_info(&room_id, p.title.as_deref(), p.description.as_deref())
        .await
        .map_err(|_| GatewayError::Upstream)?;

    state.broadcast.dispatch(
        Scope::Room(room_id.clone()),
        EventName::STREAM_INFO_UPDATED,
        json!({
            "title": p.title,
            "description": p.description,
        }),
    );

    tracing::info!(room_id, "stream info updated");
    Ok(json!({ "success": true }))
}
