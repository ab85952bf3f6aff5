//! Own-profile endpoints, including the RTMP stream key.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::db::store::StreamStore;
use crate::error::{ApiError, ApiErrorBody};
use crate::models::user::{generate_stream_key, User};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/@me", get(get_me))
        .route("/users/@me/stream-key", post(regenerate_stream_key))
}

/// Own profile: the only view that includes the stream key.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProfileResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    pub stream_key: String,
    pub is_streaming: bool,
    pub created_at: DateTime<Utc>,
}

impl From<User> for ProfileResponse {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            email: u.email,
            stream_key: u.stream_key,
            is_streaming: u.is_streaming,
            created_at: u.created_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/users/@me",
    tag = "Users",
    responses(
        (status = 200, description = "Own profile", body = ProfileResponse),
        (status = 401, description = "Missing or invalid token", body = ApiErrorBody),
    ),
)]
pub async fn get_me(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let user = state
        .store
        .find_user_by_id(&user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    Ok(Json(ProfileResponse::from(user)))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StreamKeyResponse {
    pub stream_key: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/users/@me/stream-key",
    tag = "Users",
    responses(
        (status = 200, description = "New stream key", body = StreamKeyResponse),
        (status = 401, description = "Missing or invalid token", body = ApiErrorBody),
    ),
)]
pub async fn regenerate_stream_key(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<StreamKeyResponse>, ApiError> {
    let key = generate_stream_key();

    let user = state
        .store
        .set_stream_key(&user_id, &key)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    tracing::info!(user_id = %user.id, "stream key regenerated");

    Ok(Json(StreamKeyResponse {
        stream_key: user.stream_key,
    }))
}
