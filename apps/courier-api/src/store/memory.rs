//! In-memory `ChatStore` used by the integration tests and local development.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::chat::{Chat, ChatMember};
use crate::models::message::{Message, MessageRead};
use crate::models::user::User;

use super::{ChatStore, CreateMessage, StoreError};

pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    chats: DashMap<Uuid, Chat>,
    /// Memberships keyed by chat.
    members: DashMap<Uuid, Vec<ChatMember>>,
    /// All messages in creation order.
    messages: Mutex<Vec<Message>>,
    reads: Mutex<Vec<MessageRead>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            chats: DashMap::new(),
            members: DashMap::new(),
            messages: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
        }
    }

    /// Number of stored messages for a chat (test assertions).
    pub fn message_count(&self, chat_id: Uuid) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .count()
    }

    /// Read marks recorded for a message (test assertions).
    pub fn read_marks(&self, message_id: Uuid) -> Vec<MessageRead> {
        self.reads
            .lock()
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        password_hash: Option<&str>,
    ) -> Result<User, StoreError> {
        if self
            .users
            .iter()
            .any(|u| u.username.eq_ignore_ascii_case(username))
        {
            return Err(StoreError::Conflict("Username is already taken"));
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            avatar_url: None,
            password_hash: password_hash.map(str::to_string),
            is_online: false,
            last_seen: now,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .map(|u| u.value().clone()))
    }

    async fn set_online(&self, user_id: Uuid, online: bool) -> Result<(), StoreError> {
        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.is_online = online;
            user.last_seen = Utc::now();
            user.updated_at = user.last_seen;
        }
        Ok(())
    }

    async fn create_chat(
        &self,
        kind: &str,
        name: &str,
        owner_id: Uuid,
    ) -> Result<Chat, StoreError> {
        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            name: name.to_string(),
            owner_id,
            created_at: now,
            updated_at: now,
            last_message_at: None,
        };
        self.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
        Ok(self.chats.get(&id).map(|c| c.value().clone()))
    }

    async fn update_chat_name(&self, chat_id: Uuid, name: &str) -> Result<Chat, StoreError> {
        let mut chat = self
            .chats
            .get_mut(&chat_id)
            .ok_or(StoreError::Conflict("Chat not found"))?;
        chat.name = name.to_string();
        chat.updated_at = Utc::now();
        Ok(chat.clone())
    }

    async fn create_membership(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        role: &str,
    ) -> Result<ChatMember, StoreError> {
        let member = ChatMember {
            chat_id,
            user_id,
            role: role.to_string(),
            joined_at: Utc::now(),
            left_at: None,
        };
        let mut members = self.members.entry(chat_id).or_default();
        if members.iter().any(|m| m.user_id == user_id) {
            return Err(StoreError::Conflict("Already a member"));
        }
        members.push(member.clone());
        Ok(member)
    }

    async fn is_member(&self, chat_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .members
            .get(&chat_id)
            .map(|ms| ms.iter().any(|m| m.user_id == user_id && m.is_active()))
            .unwrap_or(false))
    }

    async fn members_of(&self, chat_id: Uuid) -> Result<Vec<ChatMember>, StoreError> {
        Ok(self
            .members
            .get(&chat_id)
            .map(|ms| ms.iter().filter(|m| m.is_active()).cloned().collect())
            .unwrap_or_default())
    }

    async fn create_message(&self, params: CreateMessage) -> Result<Message, StoreError> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            chat_id: params.chat_id,
            sender_id: params.sender_id,
            content: params.content,
            message_type: params.message_type,
            media_url: params.media_url,
            reply_to_id: params.reply_to_id,
            is_edited: false,
            is_deleted: false,
            status: crate::models::message::status::SENT.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.messages.lock().push(message.clone());
        if let Some(mut chat) = self.chats.get_mut(&params.chat_id) {
            chat.last_message_at = Some(now);
        }
        Ok(message)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.lock().iter().find(|m| m.id == id).cloned())
    }

    async fn recent_messages(
        &self,
        chat_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.lock();
        let mut newest_first: Vec<Message> = messages
            .iter()
            .rev()
            .filter(|m| m.chat_id == chat_id && !m.is_deleted)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        newest_first.reverse();
        Ok(newest_first)
    }

    async fn set_message_status(&self, message_id: Uuid, status: &str) -> Result<(), StoreError> {
        let mut messages = self.messages.lock();
        if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
            message.status = status.to_string();
            message.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_message_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> Result<MessageRead, StoreError> {
        let mut reads = self.reads.lock();
        if let Some(existing) = reads
            .iter()
            .find(|r| r.message_id == message_id && r.user_id == user_id)
        {
            return Ok(existing.clone());
        }
        let read = MessageRead {
            message_id,
            user_id,
            read_at: Utc::now(),
        };
        reads.push(read.clone());
        Ok(read)
    }

    async fn mark_chat_read(&self, chat_id: Uuid, user_id: Uuid) -> Result<usize, StoreError> {
        let messages = self.messages.lock();
        let unread: Vec<Uuid> = {
            let reads = self.reads.lock();
            messages
                .iter()
                .filter(|m| m.chat_id == chat_id && m.sender_id != user_id && !m.is_deleted)
                .filter(|m| {
                    !reads
                        .iter()
                        .any(|r| r.message_id == m.id && r.user_id == user_id)
                })
                .map(|m| m.id)
                .collect()
        };
        drop(messages);

        let now = Utc::now();
        let mut reads = self.reads.lock();
        for message_id in &unread {
            reads.push(MessageRead {
                message_id: *message_id,
                user_id,
                read_at: now,
            });
        }
        Ok(unread.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{kind, role};

    fn params(chat_id: Uuid, sender_id: Uuid, content: &str) -> CreateMessage {
        CreateMessage {
            chat_id,
            sender_id,
            content: content.to_string(),
            message_type: "text".to_string(),
            media_url: None,
            reply_to_id: None,
        }
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let store = MemoryStore::new();
        store.create_user("alice", "Alice", None).await.unwrap();
        assert!(matches!(
            store.create_user("Alice", "Other", None).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn membership_governs_is_member() {
        let store = MemoryStore::new();
        let alice = store.create_user("alice", "Alice", None).await.unwrap();
        let bob = store.create_user("bob", "Bob", None).await.unwrap();
        let chat = store
            .create_chat(kind::PRIVATE, "", alice.id)
            .await
            .unwrap();
        store
            .create_membership(chat.id, alice.id, role::OWNER)
            .await
            .unwrap();

        assert!(store.is_member(chat.id, alice.id).await.unwrap());
        assert!(!store.is_member(chat.id, bob.id).await.unwrap());
    }

    #[tokio::test]
    async fn recent_messages_skips_deleted_and_orders_oldest_first() {
        let store = MemoryStore::new();
        let alice = store.create_user("alice", "Alice", None).await.unwrap();
        let chat = store.create_chat(kind::GROUP, "g", alice.id).await.unwrap();

        let m1 = store
            .create_message(params(chat.id, alice.id, "one"))
            .await
            .unwrap();
        let m2 = store
            .create_message(params(chat.id, alice.id, "two"))
            .await
            .unwrap();
        let m3 = store
            .create_message(params(chat.id, alice.id, "three"))
            .await
            .unwrap();

        // Soft-delete the middle message.
        store.messages.lock()[1].is_deleted = true;
        let _ = m2;

        let window = store.recent_messages(chat.id, 50, 0).await.unwrap();
        let ids: Vec<Uuid> = window.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m1.id, m3.id]);
    }

    #[tokio::test]
    async fn recent_messages_window_takes_newest() {
        let store = MemoryStore::new();
        let alice = store.create_user("alice", "Alice", None).await.unwrap();
        let chat = store.create_chat(kind::GROUP, "g", alice.id).await.unwrap();

        for i in 0..5 {
            store
                .create_message(params(chat.id, alice.id, &format!("m{i}")))
                .await
                .unwrap();
        }

        let window = store.recent_messages(chat.id, 2, 0).await.unwrap();
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn mark_chat_read_skips_own_and_already_read() {
        let store = MemoryStore::new();
        let alice = store.create_user("alice", "Alice", None).await.unwrap();
        let bob = store.create_user("bob", "Bob", None).await.unwrap();
        let chat = store.create_chat(kind::GROUP, "g", alice.id).await.unwrap();

        let from_bob = store
            .create_message(params(chat.id, bob.id, "hi"))
            .await
            .unwrap();
        store
            .create_message(params(chat.id, alice.id, "own"))
            .await
            .unwrap();
        store
            .create_message(params(chat.id, bob.id, "again"))
            .await
            .unwrap();

        store
            .mark_message_read(from_bob.id, alice.id)
            .await
            .unwrap();

        // Only bob's second message is still unread for alice.
        let marked = store.mark_chat_read(chat.id, alice.id).await.unwrap();
        assert_eq!(marked, 1);

        // Second pass marks nothing.
        let marked = store.mark_chat_read(chat.id, alice.id).await.unwrap();
        assert_eq!(marked, 0);
    }

    #[tokio::test]
    async fn mark_message_read_is_idempotent() {
        let store = MemoryStore::new();
        let alice = store.create_user("alice", "Alice", None).await.unwrap();
        let bob = store.create_user("bob", "Bob", None).await.unwrap();
        let chat = store.create_chat(kind::GROUP, "g", alice.id).await.unwrap();
        let message = store
            .create_message(params(chat.id, bob.id, "hi"))
            .await
            .unwrap();

        store
            .mark_message_read(message.id, alice.id)
            .await
            .unwrap();
        store
            .mark_message_read(message.id, alice.id)
            .await
            .unwrap();

        assert_eq!(store.read_marks(message.id).len(), 1);
    }
}
