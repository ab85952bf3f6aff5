//! Room CRUD and ban management.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::db::store::StreamStore;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::gateway::events::EventName;
use crate::gateway::fanout::Scope;
use crate::models::ban::{Ban, NewBan};
use crate::models::room::{NewRoom, Room};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", post(create_room).get(list_rooms))
        .route("/rooms/{room_id}", get(get_room).delete(end_room))
        .route("/rooms/{room_id}/bans", post(ban_user))
        .route("/rooms/{room_id}/bans/{user_id}", delete(unban_user))
}

// ---------------------------------------------------------------------------
// POST /api/v1/rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRoomRequest {
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/rooms",
    tag = "Rooms",
    request_body = CreateRoomRequest,
    responses(
        (status = 201, description = "Room created and marked live", body = Room),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 409, description = "Streamer already has a live room", body = ApiErrorBody),
    ),
)]
pub async fn create_room(
    AuthUser { user_id, username }: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<Room>), ApiError> {
    let title = body.title.trim();
    if title.is_empty() || title.len() > 120 {
        return Err(ApiError::validation(vec![FieldError {
            field: "title".to_string(),
            message: "Title must be 1-120 characters".to_string(),
        }]));
    }

    // One live room per streamer, enforced against the durable state.
    if state.store.live_room_for_streamer(&user_id).await?.is_some() {
        return Err(ApiError::conflict("You already have a live room"));
    }

    let room = state
        .store
        .create_room_record(NewRoom {
            room_id: beacon_common::id::prefixed_ulid(beacon_common::id::prefix::ROOM),
            streamer_id: user_id.clone(),
            streamer_username: username,
            title: title.to_string(),
            description: body.description,
            category: body.category,
            is_live: true,
            started_at: Some(Utc::now()),
        })
        .await?;

    state.store.set_user_streaming(&user_id, true).await?;
    state.sync.room_live(&room).await;

    tracing::info!(room_id = %room.room_id, streamer_id = %user_id, "room created");

    Ok((StatusCode::CREATED, Json(room)))
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListRoomsParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListRoomsResponse {
    pub data: Vec<Room>,
}

#[utoipa::path(
    get,
    path = "/api/v1/rooms",
    tag = "Rooms",
    responses(
        (status = 200, description = "Live rooms, most watched first", body = ListRoomsResponse),
    ),
)]
pub async fn list_rooms(
    State(state): State<AppState>,
    Query(params): Query<ListRoomsParams>,
) -> Result<Json<ListRoomsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);

    let data = state.store.live_rooms(limit, offset).await?;
    Ok(Json(ListRoomsResponse { data }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms/{room_id}
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/rooms/{room_id}",
    tag = "Rooms",
    params(("room_id" = String, Path, description = "Room identifier")),
    responses(
        (status = 200, description = "Room details", body = Room),
        (status = 404, description = "Room not found", body = ApiErrorBody),
    ),
)]
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Room>, ApiError> {
    let room = state
        .store
        .find_room_by_external_id(&room_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Room not found"))?;

    Ok(Json(room))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/rooms/{room_id}
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/api/v1/rooms/{room_id}",
    tag = "Rooms",
    params(("room_id" = String, Path, description = "Room identifier")),
    responses(
        (status = 204, description = "Stream ended"),
        (status = 403, description = "Not the room owner", body = ApiErrorBody),
        (status = 404, description = "Room not found", body = ApiErrorBody),
    ),
)]
pub async fn end_room(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let room = state
        .store
        .find_room_by_external_id(&room_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Room not found"))?;

    if room.streamer_id != user_id {
        return Err(ApiError::forbidden("Not authorized"));
    }

    // If the room is live in the gateway, members hear about the end and
    // the in-memory state is torn down too.
    if state.rooms.contains(&room_id) {
        state.broadcast.dispatch(
            Scope::Room(room_id.clone()),
            EventName::STREAM_ENDED,
            serde_json::json!({ "reason": "Streamer ended the stream" }),
        );
        let _ = state.rooms.end_room(&room_id, "Streamer ended the stream");
    }
    state.sync.room_ended(&room_id, &user_id).await;

    tracing::info!(room_id, streamer_id = %user_id, "room ended via http");

    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// POST /api/v1/rooms/{room_id}/bans
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct BanRequest {
    pub user_id: String,
    pub reason: Option<String>,
    /// When set, the ban expires after this many seconds.
    pub duration_secs: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/bans",
    tag = "Bans",
    params(("room_id" = String, Path, description = "Room identifier")),
    request_body = BanRequest,
    responses(
        (status = 201, description = "Ban recorded", body = Ban),
        (status = 403, description = "Not the room owner", body = ApiErrorBody),
        (status = 404, description = "Room not found", body = ApiErrorBody),
    ),
)]
pub async fn ban_user(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(body): Json<BanRequest>,
) -> Result<(StatusCode, Json<Ban>), ApiError> {
    let room = state
        .store
        .find_room_by_external_id(&room_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Room not found"))?;

    if room.streamer_id != user_id {
        return Err(ApiError::forbidden("Not authorized"));
    }
    if body.user_id == user_id {
        return Err(ApiError::bad_request("You cannot ban yourself"));
    }

    let expires_at = body
        .duration_secs
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

    let ban = state
        .store
        .create_ban(NewBan {
            room_id: room.id,
            user_id: body.user_id,
            banned_by: user_id,
            reason: body.reason,
            expires_at,
        })
        .await?;

    tracing::info!(room_id, banned = %ban.user_id, by = %ban.banned_by, "user banned");

    Ok((StatusCode::CREATED, Json(ban)))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/rooms/{room_id}/bans/{user_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BanPath {
    pub room_id: String,
    pub user_id: String,
}

#[utoipa::path(
    delete,
    path = "/api/v1/rooms/{room_id}/bans/{user_id}",
    tag = "Bans",
    params(
        ("room_id" = String, Path, description = "Room identifier"),
        ("user_id" = String, Path, description = "User to unban"),
    ),
    responses(
        (status = 204, description = "Ban lifted"),
        (status = 403, description = "Not the room owner", body = ApiErrorBody),
        (status = 404, description = "Room or ban not found", body = ApiErrorBody),
    ),
)]
pub async fn unban_user(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(path): Path<BanPath>,
) -> Result<StatusCode, ApiError> {
    let room = state
        .store
        .find_room_by_external_id(&path.room_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Room not found"))?;

    if room.streamer_id != user_id {
        return Err(ApiError::forbidden("Not authorized"));
    }

    let removed = state.store.remove_ban(room.id, &path.user_id).await?;
    if !removed {
        return Err(ApiError::not_found("Ban not found"));
    }

    Ok(StatusCode::NO_CONTENT)
}
