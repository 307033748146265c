use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::schema::{chat_members, chats};

/// Chat kinds.
pub mod kind {
    pub const PRIVATE: &str = "private";
    pub const GROUP: &str = "group";
}

/// Member roles within a chat.
pub mod role {
    pub const OWNER: &str = "owner";
    pub const ADMIN: &str = "admin";
    pub const MEMBER: &str = "member";
}

/// A chat (private or group) as stored in the database.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = chats)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Chat {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chats)]
pub struct NewChat<'a> {
    pub id: Uuid,
    pub kind: &'a str,
    pub name: &'a str,
    pub owner_id: Uuid,
}

/// A chat membership row.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = chat_members)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ChatMember {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl ChatMember {
    /// A member who has left keeps their row for history but loses access.
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chat_members)]
pub struct NewChatMember<'a> {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub role: &'a str,
}
