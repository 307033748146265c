//! Persistence seam for the hub.
//!
//! The gateway never touches the database directly; everything goes through
//! the `ChatStore` capability set. `PgStore` is the production backend,
//! `MemoryStore` backs the tests.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::chat::{Chat, ChatMember};
use crate::models::message::{Message, MessageRead};
use crate::models::user::User;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    /// A uniqueness constraint was violated (e.g. username taken).
    Conflict(&'static str),
    /// Any other database failure.
    Database(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict(msg) => write!(f, "conflict: {msg}"),
            StoreError::Database(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for StoreError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Parameters for creating a message.
#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub reply_to_id: Option<Uuid>,
}

/// The persistence capability set the hub and routes depend on.
///
/// All implementations must be safe to call concurrently from the reader
/// tasks and from spawned fire-and-forget markers.
#[async_trait]
pub trait ChatStore: Send + Sync {
    // --- users ---
    async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        password_hash: Option<&str>,
    ) -> Result<User, StoreError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
    async fn set_online(&self, user_id: Uuid, online: bool) -> Result<(), StoreError>;

    // --- chats & memberships ---
    async fn create_chat(&self, kind: &str, name: &str, owner_id: Uuid)
        -> Result<Chat, StoreError>;
    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError>;
    async fn update_chat_name(&self, chat_id: Uuid, name: &str) -> Result<Chat, StoreError>;
    async fn create_membership(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        role: &str,
    ) -> Result<ChatMember, StoreError>;
    async fn is_member(&self, chat_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;
    async fn members_of(&self, chat_id: Uuid) -> Result<Vec<ChatMember>, StoreError>;

    // --- messages ---
    async fn create_message(&self, params: CreateMessage) -> Result<Message, StoreError>;
    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;
    /// The most recent `limit` non-deleted messages of a chat, skipping
    /// `offset` newest ones, returned oldest-first within the window.
    async fn recent_messages(
        &self,
        chat_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, StoreError>;
    async fn set_message_status(&self, message_id: Uuid, status: &str) -> Result<(), StoreError>;

    // --- read marks ---
    async fn mark_message_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> Result<MessageRead, StoreError>;
    /// Create read marks for every unread message in the chat that was not
    /// sent by `user_id`. Returns the number of messages marked.
    async fn mark_chat_read(&self, chat_id: Uuid, user_id: Uuid) -> Result<usize, StoreError>;
}
