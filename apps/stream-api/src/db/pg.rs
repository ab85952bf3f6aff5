//! Diesel-backed `StreamStore` implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError, OptionalExtension};
use diesel::upsert::excluded;

use beacon_common::SnowflakeGenerator;

use crate::db::pool::DbPool;
use crate::db::schema::{bans, messages, rooms, users};
use crate::db::store::{StoreError, StreamStore};
use crate::models::ban::{Ban, NewBan};
use crate::models::message::{Message, NewMessage};
use crate::models::room::{NewRoom, Room};
use crate::models::user::{NewUser, User};

diesel::define_sql_function! {
    fn greatest(a: diesel::sql_types::Integer, b: diesel::sql_types::Integer) -> diesel::sql_types::Integer;
}

pub struct PgStore {
    pool: DbPool,
    snowflake: Arc<SnowflakeGenerator>,
}

impl PgStore {
    pub fn new(pool: DbPool, snowflake: Arc<SnowflakeGenerator>) -> Self {
        Self { pool, snowflake }
    }

    async fn conn(
        &self,
    ) -> Result<
        diesel_async::pooled_connection::deadpool::Object<diesel_async::AsyncPgConnection>,
        StoreError,
    > {
        self.pool.get().await.map_err(|e| {
            tracing::error!(?e, "pool error");
            StoreError::Unavailable
        })
    }
}

fn map_db_err(err: DieselError) -> StoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, ref info) => {
            let constraint = info.constraint_name().unwrap_or("");
            if constraint.contains("username") {
                StoreError::Conflict("Username is already taken")
            } else if constraint.contains("email") {
                StoreError::Conflict("Email is already registered")
            } else if constraint.contains("room") {
                StoreError::Conflict("Room already exists")
            } else {
                StoreError::Conflict("A record with that information already exists")
            }
        }
        DieselError::NotFound => StoreError::NotFound,
        other => {
            tracing::error!(?other, "database error");
            StoreError::Unavailable
        }
    }
}

#[async_trait]
impl StreamStore for PgStore {
    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(users::table)
                .values(&new)
                .returning(User::as_returning()),
            &mut conn,
        )
        .await
        .map_err(map_db_err)
    }

    async fn find_user_by_username(
        &self,
        username_lower: &str,
    ) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            users::table
                .filter(users::username_lower.eq(username_lower))
                .select(User::as_select()),
            &mut conn,
        )
        .await
        .optional()
        .map_err(map_db_err)
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            users::table.find(id).select(User::as_select()),
            &mut conn,
        )
        .await
        .optional()
        .map_err(map_db_err)
    }

    async fn set_user_streaming(&self, user_id: &str, streaming: bool) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::update(users::table.find(user_id)).set(users::is_streaming.eq(streaming)),
            &mut conn,
        )
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn set_stream_key(&self, user_id: &str, key: &str) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            diesel::update(users::table.find(user_id))
                .set(users::stream_key.eq(key))
                .returning(User::as_returning()),
            &mut conn,
        )
        .await
        .optional()
        .map_err(map_db_err)
    }

    async fn create_room_record(&self, new: NewRoom) -> Result<Room, StoreError> {
        let mut conn = self.conn().await?;
        let id = self.snowflake.generate();
        diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(rooms::table)
                .values((rooms::id.eq(id), &new))
                .returning(Room::as_returning()),
            &mut conn,
        )
        .await
        .map_err(map_db_err)
    }

    async fn find_room_by_external_id(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            rooms::table
                .filter(rooms::room_id.eq(room_id))
                .select(Room::as_select()),
            &mut conn,
        )
        .await
        .optional()
        .map_err(map_db_err)
    }

    async fn live_room_for_streamer(
        &self,
        streamer_id: &str,
    ) -> Result<Option<Room>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            rooms::table
                .filter(rooms::streamer_id.eq(streamer_id))
                .filter(rooms::is_live.eq(true))
                .select(Room::as_select()),
            &mut conn,
        )
        .await
        .optional()
        .map_err(map_db_err)
    }

    async fn live_rooms(&self, limit: i64, offset: i64) -> Result<Vec<Room>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::load(
            rooms::table
                .filter(rooms::is_live.eq(true))
                .order((rooms::viewer_count.desc(), rooms::started_at.desc()))
                .limit(limit)
                .offset(offset)
                .select(Room::as_select()),
            &mut conn,
        )
        .await
        .map_err(map_db_err)
    }

    async fn end_room_record(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            diesel::update(
                rooms::table
                    .filter(rooms::room_id.eq(room_id))
                    .filter(rooms::is_live.eq(true)),
            )
            .set((
                rooms::is_live.eq(false),
                rooms::ended_at.eq(Utc::now()),
                rooms::viewer_count.eq(0),
            ))
            .returning(Room::as_returning()),
            &mut conn,
        )
        .await
        .optional()
        .map_err(map_db_err)
    }

    async fn update_room_info(
        &self,
        room_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Room>, StoreError> {
        let mut conn = self.conn().await?;

        if title.is_none() && description.is_none() {
            return diesel_async::RunQueryDsl::get_result(
                rooms::table
                    .filter(rooms::room_id.eq(room_id))
                    .select(Room::as_select()),
                &mut conn,
            )
            .await
            .optional()
            .map_err(map_db_err);
        }

        #[derive(AsChangeset)]
        #[diesel(table_name = rooms)]
        struct InfoChanges<'a> {
            title: Option<&'a str>,
            description: Option<&'a str>,
        }

        diesel_async::RunQueryDsl::get_result(
            diesel::update(rooms::table.filter(rooms::room_id.eq(room_id)))
                .set(InfoChanges { title, description })
                .returning(Room::as_returning()),
            &mut conn,
        )
        .await
        .optional()
        .map_err(map_db_err)
    }

    async fn update_viewer_count(&self, room_id: &str, count: i32) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::update(rooms::table.filter(rooms::room_id.eq(room_id))).set((
                rooms::viewer_count.eq(count),
                rooms::peak_viewers.eq(greatest(rooms::peak_viewers, count)),
            )),
            &mut conn,
        )
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn is_user_banned(
        &self,
        room_record_id: i64,
        user_id: &str,
    ) -> Result<Option<Ban>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            bans::table
                .filter(bans::room_id.eq(room_record_id))
                .filter(bans::user_id.eq(user_id))
                .filter(
                    bans::expires_at
                        .is_null()
                        .or(bans::expires_at.gt(Utc::now())),
                )
                .select(Ban::as_select()),
            &mut conn,
        )
        .await
        .optional()
        .map_err(map_db_err)
    }

    async fn create_ban(&self, new: NewBan) -> Result<Ban, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(bans::table)
                .values(&new)
                .on_conflict((bans::room_id, bans::user_id))
                .do_update()
                .set((
                    bans::banned_by.eq(excluded(bans::banned_by)),
                    bans::reason.eq(excluded(bans::reason)),
                    bans::expires_at.eq(excluded(bans::expires_at)),
                ))
                .returning(Ban::as_returning()),
            &mut conn,
        )
        .await
        .map_err(map_db_err)
    }

    async fn remove_ban(&self, room_record_id: i64, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let deleted = diesel_async::RunQueryDsl::execute(
            diesel::delete(
                bans::table
                    .filter(bans::room_id.eq(room_record_id))
                    .filter(bans::user_id.eq(user_id)),
            ),
            &mut conn,
        )
        .await
        .map_err(map_db_err)?;
        Ok(deleted > 0)
    }

    async fn insert_chat_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let mut conn = self.conn().await?;
        let id = self.snowflake.generate();
        diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(messages::table)
                .values((messages::id.eq(id), &new))
                .returning(Message::as_returning()),
            &mut conn,
        )
        .await
        .map_err(map_db_err)
    }

    async fn soft_delete_chat_message(&self, message_id: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(messages::table.find(message_id).filter(messages::deleted.eq(false)))
                .set(messages::deleted.eq(true)),
            &mut conn,
        )
        .await
        .map_err(map_db_err)?;
        Ok(updated > 0)
    }

    async fn active_messages(
        &self,
        room_record_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.conn().await?;
        diesel_async::RunQueryDsl::load(
            messages::table
                .filter(messages::room_id.eq(room_record_id))
                .filter(messages::deleted.eq(false))
                .order(messages::id.asc())
                .limit(limit)
                .select(Message::as_select()),
            &mut conn,
        )
        .await
        .map_err(map_db_err)
    }
}
