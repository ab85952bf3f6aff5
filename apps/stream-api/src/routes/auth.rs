//! Registration and login.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::jwt;
use crate::auth::middleware::AuthUser;
use crate::db::store::StreamStore;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::models::user::{generate_stream_key, NewUser, User, UserResponse};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
}

// ---------------------------------------------------------------------------
// POST /api/v1/auth/register
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    pub user: UserResponse,
    pub token: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    tag = "Auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = AuthResponse),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 409, description = "Username or email taken", body = ApiErrorBody),
    ),
)]
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let username = body.username.trim();

    let mut errors = Vec::new();
    if username.len() < 3 || username.len() > 30 {
        errors.push(FieldError {
            field: "username".to_string(),
            message: "Username must be 3-30 characters".to_string(),
        });
    } else if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        errors.push(FieldError {
            field: "username".to_string(),
            message: "Username may only contain letters, numbers, and underscores".to_string(),
        });
    }
    if !body.email.contains('@') {
        errors.push(FieldError {
            field: "email".to_string(),
            message: "A valid email address is required".to_string(),
        });
    }
    if body.password.len() < 8 {
        errors.push(FieldError {
            field: "password".to_string(),
            message: "Password must be at least 8 characters".to_string(),
        });
    }
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let password_hash = hash_password(&body.password)?;
    let id = beacon_common::id::prefixed_ulid(beacon_common::id::prefix::USER);

    let user = state
        .store
        .create_user(NewUser {
            id,
            username: username.to_string(),
            username_lower: username.to_lowercase(),
            email: body.email.trim().to_string(),
            password_hash,
            stream_key: generate_stream_key(),
        })
        .await?;

    tracing::info!(user_id = %user.id, username = %user.username, "user registered");

    let token = jwt::issue(&state.config.jwt_secret, &user.id, &user.username)
        .map_err(|_| ApiError::internal("Failed to issue token"))?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user: UserResponse::from(user),
            token,
        }),
    ))
}

/// Hash a password using Argon2id with a random salt.
fn hash_password(password: &str) -> Result<String, ApiError> {
    use argon2::Argon2;
    use password_hash::rand_core::OsRng;
    use password_hash::{PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!(?e, "password hashing failed");
            ApiError::internal("Failed to process password")
        })
}

fn verify_password(hash: &str, password: &str) -> bool {
    use argon2::Argon2;
    use password_hash::{PasswordHash, PasswordVerifier};

    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/auth/login
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials", body = ApiErrorBody),
    ),
)]
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let user: Option<User> = state
        .store
        .find_user_by_username(&body.username.trim().to_lowercase())
        .await?;

    let user = match user {
        Some(user) if verify_password(&user.password_hash, &body.password) => user,
        _ => return Err(ApiError::unauthorized("Invalid username or password")),
    };

    let token = jwt::issue(&state.config.jwt_secret, &user.id, &user.username)
        .map_err(|_| ApiError::internal("Failed to issue token"))?;

    tracing::debug!(user_id = %user.id, "user logged in");

    Ok(Json(AuthResponse {
        user: UserResponse::from(user),
        token,
    }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/auth/me
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    tag = "Auth",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Missing or invalid token", body = ApiErrorBody),
    ),
)]
pub async fn me(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state
        .store
        .find_user_by_id(&user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    Ok(Json(UserResponse::from(user)))
}
