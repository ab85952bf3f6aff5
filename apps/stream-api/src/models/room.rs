use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::rooms;

/// Persistent room record. The in-memory live representative is
/// `gateway::directory::LiveRoom`; this row is the durable source of truth
/// for "is this room live" as seen by the HTTP API.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = rooms)]
pub struct Room {
    pub id: i64,
    pub room_id: String,
    pub streamer_id: String,
    pub streamer_username: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub is_live: bool,
    pub viewer_count: i32,
    pub peak_viewers: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = rooms)]
pub struct NewRoom {
    pub room_id: String,
    pub streamer_id: String,
    pub streamer_username: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub is_live: bool,
    pub started_at: Option<DateTime<Utc>>,
}
