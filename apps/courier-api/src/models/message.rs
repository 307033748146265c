use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::schema::{message_reads, messages};

/// Message content types.
pub mod message_type {
    pub const TEXT: &str = "text";
    pub const IMAGE: &str = "image";
    pub const FILE: &str = "file";
    pub const VOICE: &str = "voice";
}

/// Message delivery statuses.
pub mod status {
    pub const SENT: &str = "sent";
    pub const DELIVERED: &str = "delivered";
    pub const READ: &str = "read";
}

/// A chat message row.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage<'a> {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: &'a str,
    pub message_type: &'a str,
    pub media_url: Option<&'a str>,
    pub reply_to_id: Option<Uuid>,
    pub status: &'a str,
}

/// A per-user read mark for a message.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = message_reads)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct MessageRead {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = message_reads)]
pub struct NewMessageRead {
    pub message_id: Uuid,
    pub user_id: Uuid,
}
