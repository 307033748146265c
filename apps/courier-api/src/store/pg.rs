//! PostgreSQL-backed `ChatStore`.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::OptionalExtension;
use diesel_async::RunQueryDsl;
use uuid::Uuid;

use crate::db::pool::DbPool;
use crate::db::schema::{chat_members, chats, message_reads, messages, users};
use crate::models::chat::{Chat, ChatMember, NewChat, NewChatMember};
use crate::models::message::{self, Message, MessageRead, NewMessage, NewMessageRead};
use crate::models::user::{NewUser, User};

use super::{ChatStore, CreateMessage, StoreError};

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        password_hash: Option<&str>,
    ) -> Result<User, StoreError> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(users::table)
            .values(NewUser {
                id: Uuid::new_v4(),
                username,
                display_name,
                password_hash,
            })
            .returning(User::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => StoreError::Conflict("Username is already taken"),
                other => StoreError::from(other),
            })
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let mut conn = self.pool.get().await?;

        Ok(users::table
            .find(id)
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let mut conn = self.pool.get().await?;

        Ok(users::table
            .filter(users::username.eq(username))
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn set_online(&self, user_id: Uuid, online: bool) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;

        diesel::update(users::table.find(user_id))
            .set((
                users::is_online.eq(online),
                users::last_seen.eq(Utc::now()),
                users::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn create_chat(
        &self,
        kind: &str,
        name: &str,
        owner_id: Uuid,
    ) -> Result<Chat, StoreError> {
        let mut conn = self.pool.get().await?;

        Ok(diesel::insert_into(chats::table)
            .values(NewChat {
                id: Uuid::new_v4(),
                kind,
                name,
                owner_id,
            })
            .returning(Chat::as_returning())
            .get_result(&mut conn)
            .await?)
    }

    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
        let mut conn = self.pool.get().await?;

        Ok(chats::table
            .find(id)
            .select(Chat::as_select())
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn update_chat_name(&self, chat_id: Uuid, name: &str) -> Result<Chat, StoreError> {
        let mut conn = self.pool.get().await?;

        Ok(diesel::update(chats::table.find(chat_id))
            .set((chats::name.eq(name), chats::updated_at.eq(Utc::now())))
            .returning(Chat::as_returning())
            .get_result(&mut conn)
            .await?)
    }

    async fn create_membership(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        role: &str,
    ) -> Result<ChatMember, StoreError> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(chat_members::table)
            .values(NewChatMember {
                chat_id,
                user_id,
                role,
            })
            .returning(ChatMember::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => StoreError::Conflict("Already a member"),
                other => StoreError::from(other),
            })
    }

    async fn is_member(&self, chat_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let found: Option<Uuid> = chat_members::table
            .filter(chat_members::chat_id.eq(chat_id))
            .filter(chat_members::user_id.eq(user_id))
            .filter(chat_members::left_at.is_null())
            .select(chat_members::user_id)
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found.is_some())
    }

    async fn members_of(&self, chat_id: Uuid) -> Result<Vec<ChatMember>, StoreError> {
        let mut conn = self.pool.get().await?;

        Ok(chat_members::table
            .filter(chat_members::chat_id.eq(chat_id))
            .filter(chat_members::left_at.is_null())
            .select(ChatMember::as_select())
            .load(&mut conn)
            .await?)
    }

    async fn create_message(&self, params: CreateMessage) -> Result<Message, StoreError> {
        let mut conn = self.pool.get().await?;

        let message: Message = diesel::insert_into(messages::table)
            .values(NewMessage {
                id: Uuid::new_v4(),
                chat_id: params.chat_id,
                sender_id: params.sender_id,
                content: &params.content,
                message_type: &params.message_type,
                media_url: params.media_url.as_deref(),
                reply_to_id: params.reply_to_id,
                status: message::status::SENT,
            })
            .returning(Message::as_returning())
            .get_result(&mut conn)
            .await?;

        let _ = diesel::update(chats::table.find(params.chat_id))
            .set(chats::last_message_at.eq(message.created_at))
            .execute(&mut conn)
            .await;

        Ok(message)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let mut conn = self.pool.get().await?;

        Ok(messages::table
            .find(id)
            .select(Message::as_select())
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn recent_messages(
        &self,
        chat_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.pool.get().await?;

        let mut newest_first: Vec<Message> = messages::table
            .filter(messages::chat_id.eq(chat_id))
            .filter(messages::is_deleted.eq(false))
            .order(messages::created_at.desc())
            .offset(offset)
            .limit(limit)
            .select(Message::as_select())
            .load(&mut conn)
            .await?;

        newest_first.reverse();
        Ok(newest_first)
    }

    async fn set_message_status(&self, message_id: Uuid, status: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;

        diesel::update(messages::table.find(message_id))
            .set((
                messages::status.eq(status),
                messages::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_message_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> Result<MessageRead, StoreError> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(message_reads::table)
            .values(NewMessageRead {
                message_id,
                user_id,
            })
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(message_reads::table
            .find((message_id, user_id))
            .select(MessageRead::as_select())
            .first(&mut conn)
            .await?)
    }

    async fn mark_chat_read(&self, chat_id: Uuid, user_id: Uuid) -> Result<usize, StoreError> {
        let mut conn = self.pool.get().await?;

        // Unread = not sent by the reader and without a read mark yet.
        let unread: Vec<Uuid> = messages::table
            .left_outer_join(
                message_reads::table.on(message_reads::message_id
                    .eq(messages::id)
                    .and(message_reads::user_id.eq(user_id))),
            )
            .filter(messages::chat_id.eq(chat_id))
            .filter(messages::sender_id.ne(user_id))
            .filter(messages::is_deleted.eq(false))
            .filter(message_reads::message_id.is_null())
            .select(messages::id)
            .load(&mut conn)
            .await?;

        if unread.is_empty() {
            return Ok(0);
        }

        let rows: Vec<NewMessageRead> = unread
            .iter()
            .map(|id| NewMessageRead {
                message_id: *id,
                user_id,
            })
            .collect();

        let inserted = diesel::insert_into(message_reads::table)
            .values(&rows)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(inserted)
    }
}
