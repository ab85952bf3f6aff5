use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::bans;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = bans)]
pub struct Ban {
    pub room_id: i64,
    pub user_id: String,
    pub banned_by: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = bans)]
pub struct NewBan {
    pub room_id: i64,
    pub user_id: String,
    pub banned_by: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}
