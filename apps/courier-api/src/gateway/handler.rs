//! Intent dispatch: the switch from a decoded client frame to a persistence
//! call plus broadcast.
//!
//! Handlers run inline on the session's reader task, never on the hub loop,
//! so a slow persistence call only stalls the one session that issued the
//! intent. All failures surface as `error` envelopes to the originator; the
//! reader loop never terminates because of a handler error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::from_value;
use uuid::Uuid;

use crate::models::message::{self, Message};
use crate::models::user::User;
use crate::store::{CreateMessage, StoreError};
use crate::AppState;

use super::envelope::{
    code, ChatRefPayload, ClientEnvelope, Envelope, EventName, MessagePayload,
    MessageReadPayload, MessageStatusPayload, ReadMessagePayload, SendMessagePayload,
    TypingStatusPayload,
};
use super::session::{SendError, Session};

/// How many recent messages are replayed to a session on subscribe.
pub const HISTORY_REPLAY_LIMIT: i64 = 50;

/// Handle one inbound transport frame, which may carry several
/// newline-separated envelopes.
pub async fn handle_frame(state: &AppState, session: &Arc<Session>, text: &str) {
    for raw in super::envelope::split_frames(text) {
        handle_envelope(state, session, raw).await;
        if session.is_closed() {
            return;
        }
    }
}

async fn handle_envelope(state: &AppState, session: &Arc<Session>, raw: &str) {
    let envelope: ClientEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(_) => {
            send_error(state, session, None, code::INVALID_JSON, "Failed to parse message").await;
            return;
        }
    };

    let request_id = envelope.request_id.clone();
    match envelope.kind.as_str() {
        EventName::SEND_MESSAGE => handle_send_message(state, session, envelope).await,
        EventName::READ_MESSAGE => handle_read_message(state, session, envelope).await,
        EventName::READ_CHAT => handle_read_chat(state, session, envelope).await,
        EventName::TYPING_START => handle_typing(state, session, envelope, true).await,
        EventName::TYPING_STOP => handle_typing(state, session, envelope, false).await,
        EventName::SUBSCRIBE_CHAT => handle_subscribe(state, session, envelope).await,
        EventName::UNSUBSCRIBE_CHAT => handle_unsubscribe(state, session, envelope).await,
        // An application-level ping only serves to reset the read deadline,
        // which receiving the frame already did.
        EventName::PING => {}
        _ => {
            send_error(
                state,
                session,
                request_id,
                code::UNKNOWN_TYPE,
                "Unknown message type",
            )
            .await;
        }
    }
}

// ---------------------------------------------------------------------------
// send_message
// ---------------------------------------------------------------------------

/// Why a message could not be posted.
#[derive(Debug)]
pub enum PostMessageError {
    NotMember,
    EmptyContent,
    Store(StoreError),
}

/// Persist a message and broadcast the derived `message` envelope to the
/// chat's subscribers, excluding the sender.
///
/// This is the single send path: both the `send_message` intent and the REST
/// message endpoint go through here, so HTTP-sent messages reach live
/// subscribers exactly like socket-sent ones.
pub async fn post_message(
    state: &AppState,
    sender_id: Uuid,
    chat_id: Uuid,
    content: &str,
    message_type: Option<String>,
    media_url: Option<String>,
    reply_to_id: Option<Uuid>,
) -> Result<MessagePayload, PostMessageError> {
    let message_type = message_type.unwrap_or_else(|| message::message_type::TEXT.to_string());
    let content = content.trim();
    if content.is_empty() && message_type == message::message_type::TEXT {
        return Err(PostMessageError::EmptyContent);
    }

    let is_member = state
        .store
        .is_member(chat_id, sender_id)
        .await
        .map_err(PostMessageError::Store)?;
    if !is_member {
        return Err(PostMessageError::NotMember);
    }

    let stored = state
        .store
        .create_message(CreateMessage {
            chat_id,
            sender_id,
            content: content.to_string(),
            message_type,
            media_url,
            reply_to_id,
        })
        .await
        .map_err(PostMessageError::Store)?;

    let sender = state
        .store
        .get_user(sender_id)
        .await
        .map_err(PostMessageError::Store)?;
    let payload = message_payload(&stored, sender.as_ref());

    let envelope = Envelope::event(EventName::MESSAGE, payload.clone());
    state
        .hub
        .broadcast_to_chat(chat_id, &envelope, Some(sender_id))
        .await;

    Ok(payload)
}

async fn handle_send_message(state: &AppState, session: &Arc<Session>, envelope: ClientEnvelope) {
    let request_id = envelope.request_id;
    let payload: SendMessagePayload = match from_value(envelope.payload) {
        Ok(payload) => payload,
        Err(_) => {
            send_error(
                state,
                session,
                request_id,
                code::INVALID_PAYLOAD,
                "Failed to parse payload",
            )
            .await;
            return;
        }
    };

    let Ok(chat_id) = Uuid::parse_str(&payload.chat_id) else {
        send_error(state, session, request_id, code::INVALID_CHAT_ID, "Invalid chat ID").await;
        return;
    };
    // An unparsable reply reference degrades to a plain message.
    let reply_to_id = payload
        .reply_to_id
        .as_deref()
        .and_then(|s| Uuid::parse_str(s).ok());

    match post_message(
        state,
        session.user_id,
        chat_id,
        &payload.content,
        payload.message_type,
        payload.media_url,
        reply_to_id,
    )
    .await
    {
        Ok(message) => {
            // Echo to the originator; the broadcast excluded them.
            let echo = Envelope::event(EventName::MESSAGE, message).with_request_id(request_id);
            deliver(state, session, echo).await;
        }
        Err(PostMessageError::NotMember) => {
            send_error(
                state,
                session,
                request_id,
                code::NOT_MEMBER,
                "You are not a member of this chat",
            )
            .await;
        }
        Err(PostMessageError::EmptyContent) => {
            send_error(
                state,
                session,
                request_id,
                code::INVALID_PAYLOAD,
                "Message content cannot be empty",
            )
            .await;
        }
        Err(PostMessageError::Store(err)) => {
            tracing::error!(%err, %chat_id, "failed to persist message");
            send_error(
                state,
                session,
                request_id,
                code::SEND_FAILED,
                "Failed to send message",
            )
            .await;
        }
    }
}

// ---------------------------------------------------------------------------
// read_message / read_chat
// ---------------------------------------------------------------------------

async fn handle_read_message(state: &AppState, session: &Arc<Session>, envelope: ClientEnvelope) {
    let request_id = envelope.request_id;
    let payload: ReadMessagePayload = match from_value(envelope.payload) {
        Ok(payload) => payload,
        Err(_) => {
            send_error(
                state,
                session,
                request_id,
                code::INVALID_PAYLOAD,
                "Failed to parse payload",
            )
            .await;
            return;
        }
    };

    let Ok(message_id) = Uuid::parse_str(&payload.message_id) else {
        send_error(
            state,
            session,
            request_id,
            code::INVALID_MESSAGE_ID,
            "Invalid message ID",
        )
        .await;
        return;
    };

    let message = match state.store.get_message(message_id).await {
        Ok(Some(message)) => message,
        Ok(None) | Err(_) => {
            send_error(
                state,
                session,
                request_id,
                code::MESSAGE_NOT_FOUND,
                "Message not found",
            )
            .await;
            return;
        }
    };

    // Reading your own message is a no-op.
    if message.sender_id == session.user_id {
        return;
    }

    let read_at = match state
        .store
        .mark_message_read(message_id, session.user_id)
        .await
    {
        Ok(read) => read.read_at,
        Err(err) => {
            tracing::warn!(%err, %message_id, "failed to persist read mark");
            Utc::now()
        }
    };

    // Promote the delivery status; best-effort.
    if let Err(err) = state
        .store
        .set_message_status(message_id, message::status::READ)
        .await
    {
        tracing::warn!(%err, %message_id, "failed to update message status");
    }

    // Everyone in the chat, the reader included, learns about the read mark.
    let read_envelope = Envelope::event(
        EventName::MESSAGE_READ,
        MessageReadPayload {
            message_id,
            user_id: session.user_id,
            read_at,
        },
    );
    state
        .hub
        .broadcast_to_chat(message.chat_id, &read_envelope, None)
        .await;

    let status_envelope = Envelope::event(
        EventName::MESSAGE_STATUS,
        MessageStatusPayload {
            message_id,
            status: message::status::READ.to_string(),
            updated_at: read_at,
        },
    );
    state
        .hub
        .broadcast_to_chat(message.chat_id, &status_envelope, None)
        .await;
}

async fn handle_read_chat(state: &AppState, session: &Arc<Session>, envelope: ClientEnvelope) {
    let request_id = envelope.request_id.clone();
    let Some(chat_id) = parse_chat_ref(state, session, envelope).await else {
        return;
    };

    match state.store.is_member(chat_id, session.user_id).await {
        Ok(true) => {}
        Ok(false) => {
            send_error(
                state,
                session,
                request_id,
                code::NOT_MEMBER,
                "You are not a member of this chat",
            )
            .await;
            return;
        }
        Err(err) => {
            tracing::error!(%err, %chat_id, "membership check failed");
            send_error(
                state,
                session,
                request_id,
                code::READ_CHAT_FAILED,
                "Failed to mark chat read",
            )
            .await;
            return;
        }
    }

    // No broadcast on success: read_chat only advances the reader's own state.
    if let Err(err) = state.store.mark_chat_read(chat_id, session.user_id).await {
        tracing::error!(%err, %chat_id, "failed to mark chat read");
        send_error(
            state,
            session,
            request_id,
            code::READ_CHAT_FAILED,
            "Failed to mark chat read",
        )
        .await;
    }
}

// ---------------------------------------------------------------------------
// typing
// ---------------------------------------------------------------------------

async fn handle_typing(
    state: &AppState,
    session: &Arc<Session>,
    envelope: ClientEnvelope,
    is_typing: bool,
) {
    let Some(chat_id) = parse_chat_ref(state, session, envelope).await else {
        return;
    };

    session.set_typing(chat_id, is_typing);

    let typing_envelope = Envelope::event(
        EventName::TYPING,
        TypingStatusPayload {
            chat_id,
            user_id: session.user_id,
            user_name: session.username.clone(),
            is_typing,
        },
    );

    // Typing is a non-essential event type: when the hub channel is full we
    // drop it rather than stall the reader.
    if !state
        .hub
        .try_broadcast_to_chat(chat_id, &typing_envelope, Some(session.user_id))
    {
        tracing::debug!(%chat_id, user_id = %session.user_id, "typing frame dropped");
    }
}

// ---------------------------------------------------------------------------
// subscribe / unsubscribe
// ---------------------------------------------------------------------------

async fn handle_subscribe(state: &AppState, session: &Arc<Session>, envelope: ClientEnvelope) {
    let request_id = envelope.request_id.clone();
    let Some(chat_id) = parse_chat_ref(state, session, envelope).await else {
        return;
    };

    match state.store.is_member(chat_id, session.user_id).await {
        Ok(true) => {}
        Ok(false) => {
            send_error(
                state,
                session,
                request_id,
                code::NOT_MEMBER,
                "You are not a member of this chat",
            )
            .await;
            return;
        }
        Err(err) => {
            tracing::error!(%err, %chat_id, "membership check failed");
            send_error(
                state,
                session,
                request_id,
                code::SUBSCRIBE_FAILED,
                "Failed to subscribe to chat",
            )
            .await;
            return;
        }
    }

    let history = match state
        .store
        .recent_messages(chat_id, HISTORY_REPLAY_LIMIT, 0)
        .await
    {
        Ok(history) => history,
        Err(err) => {
            tracing::error!(%err, %chat_id, "failed to load history for replay");
            send_error(
                state,
                session,
                request_id,
                code::SUBSCRIBE_FAILED,
                "Failed to subscribe to chat",
            )
            .await;
            return;
        }
    };

    // Serialize the replay here, off the hub loop. Oldest first.
    let mut senders: HashMap<Uuid, Option<User>> = HashMap::new();
    let mut backlog = Vec::with_capacity(history.len());
    for stored in &history {
        let sender = match senders.get(&stored.sender_id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = state.store.get_user(stored.sender_id).await.ok().flatten();
                senders.insert(stored.sender_id, fetched.clone());
                fetched
            }
        };
        let payload = message_payload(stored, sender.as_ref());
        backlog.push(Envelope::event(EventName::MESSAGE, payload).to_frame());
    }

    state.hub.subscribe(session.clone(), chat_id, backlog).await;
}

async fn handle_unsubscribe(state: &AppState, session: &Arc<Session>, envelope: ClientEnvelope) {
    let Some(chat_id) = parse_chat_ref(state, session, envelope).await else {
        return;
    };
    state.hub.unsubscribe(session.clone(), chat_id).await;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Decode a `{chat_id}` payload, reporting decode and UUID failures to the
/// session. Returns `None` once the error envelope has been sent.
async fn parse_chat_ref(
    state: &AppState,
    session: &Arc<Session>,
    envelope: ClientEnvelope,
) -> Option<Uuid> {
    let request_id = envelope.request_id;
    let payload: ChatRefPayload = match from_value(envelope.payload) {
        Ok(payload) => payload,
        Err(_) => {
            send_error(
                state,
                session,
                request_id,
                code::INVALID_PAYLOAD,
                "Failed to parse payload",
            )
            .await;
            return None;
        }
    };

    match Uuid::parse_str(&payload.chat_id) {
        Ok(chat_id) => Some(chat_id),
        Err(_) => {
            send_error(state, session, request_id, code::INVALID_CHAT_ID, "Invalid chat ID").await;
            None
        }
    }
}

/// Build the wire payload for a stored message.
pub fn message_payload(stored: &Message, sender: Option<&User>) -> MessagePayload {
    let (sender_name, sender_avatar) = match sender {
        Some(user) => {
            let name = if user.display_name.is_empty() {
                user.username.clone()
            } else {
                user.display_name.clone()
            };
            (name, user.avatar_url.clone())
        }
        None => (String::new(), None),
    };

    MessagePayload {
        id: stored.id,
        chat_id: stored.chat_id,
        sender_id: stored.sender_id,
        sender_name,
        sender_avatar,
        content: stored.content.clone(),
        message_type: stored.message_type.clone(),
        media_url: stored.media_url.clone(),
        reply_to_id: stored.reply_to_id,
        is_edited: stored.is_edited,
        is_deleted: stored.is_deleted,
        status: stored.status.clone(),
        created_at: stored.created_at,
    }
}

/// Enqueue an envelope for this session. Queue overflow is fatal for the
/// session per the backpressure policy.
async fn deliver(state: &AppState, session: &Arc<Session>, envelope: Envelope) {
    match session.send(&envelope) {
        Ok(()) => {}
        Err(SendError::Full) => {
            tracing::warn!(
                session_id = %session.session_id,
                "outbound queue overflow on direct reply; deregistering"
            );
            state.hub.deregister(session.clone()).await;
        }
        Err(SendError::Closed) => {}
    }
}

async fn send_error(
    state: &AppState,
    session: &Arc<Session>,
    request_id: Option<String>,
    code: &str,
    message: &str,
) {
    let envelope = Envelope::error(code, message).with_request_id(request_id);
    deliver(state, session, envelope).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::config::Config;
    use crate::db::kv::MemoryKv;
    use crate::gateway::hub::Hub;
    use crate::models::chat::{kind, role, Chat, ChatMember};
    use crate::models::message::MessageRead;
    use crate::store::{ChatStore, MemoryStore};

    /// Store double whose chat-read operations can be made to fail, for
    /// driving the persistence-error paths of the read intents.
    struct FailingReadStore {
        inner: MemoryStore,
        fail_membership: bool,
        fail_marks: bool,
    }

    impl FailingReadStore {
        fn new(fail_membership: bool, fail_marks: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_membership,
                fail_marks,
            }
        }
    }

    #[async_trait]
    impl ChatStore for FailingReadStore {
        async fn create_user(
            &self,
            username: &str,
            display_name: &str,
            password_hash: Option<&str>,
        ) -> Result<User, StoreError> {
            self.inner
                .create_user(username, display_name, password_hash)
                .await
        }

        async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
            self.inner.get_user(id).await
        }

        async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
            self.inner.get_user_by_username(username).await
        }

        async fn set_online(&self, user_id: Uuid, online: bool) -> Result<(), StoreError> {
            self.inner.set_online(user_id, online).await
        }

        async fn create_chat(
            &self,
            kind: &str,
            name: &str,
            owner_id: Uuid,
        ) -> Result<Chat, StoreError> {
            self.inner.create_chat(kind, name, owner_id).await
        }

        async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
            self.inner.get_chat(id).await
        }

        async fn update_chat_name(&self, chat_id: Uuid, name: &str) -> Result<Chat, StoreError> {
            self.inner.update_chat_name(chat_id, name).await
        }

        async fn create_membership(
            &self,
            chat_id: Uuid,
            user_id: Uuid,
            role: &str,
        ) -> Result<ChatMember, StoreError> {
            self.inner.create_membership(chat_id, user_id, role).await
        }

        async fn is_member(&self, chat_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
            if self.fail_membership {
                return Err(StoreError::Database("membership lookup failed".to_string()));
            }
            self.inner.is_member(chat_id, user_id).await
        }

        async fn members_of(&self, chat_id: Uuid) -> Result<Vec<ChatMember>, StoreError> {
            self.inner.members_of(chat_id).await
        }

        async fn create_message(&self, params: CreateMessage) -> Result<Message, StoreError> {
            self.inner.create_message(params).await
        }

        async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
            self.inner.get_message(id).await
        }

        async fn recent_messages(
            &self,
            chat_id: Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<Message>, StoreError> {
            self.inner.recent_messages(chat_id, limit, offset).await
        }

        async fn set_message_status(
            &self,
            message_id: Uuid,
            status: &str,
        ) -> Result<(), StoreError> {
            self.inner.set_message_status(message_id, status).await
        }

        async fn mark_message_read(
            &self,
            message_id: Uuid,
            user_id: Uuid,
        ) -> Result<MessageRead, StoreError> {
            self.inner.mark_message_read(message_id, user_id).await
        }

        async fn mark_chat_read(&self, chat_id: Uuid, user_id: Uuid) -> Result<usize, StoreError> {
            if self.fail_marks {
                return Err(StoreError::Database("read marks unavailable".to_string()));
            }
            self.inner.mark_chat_read(chat_id, user_id).await
        }
    }

    fn state_over(store: Arc<dyn ChatStore>) -> AppState {
        AppState {
            store: store.clone(),
            kv: Arc::new(MemoryKv::new()),
            hub: Hub::spawn(store),
            config: Arc::new(Config {
                database_url: String::new(),
                port: 0,
            }),
        }
    }

    #[tokio::test]
    async fn read_chat_surfaces_mark_failure_as_error_envelope() {
        let store = Arc::new(FailingReadStore::new(false, true));
        let state = state_over(store.clone());

        let user = store.create_user("alice", "Alice", None).await.unwrap();
        let chat = store.create_chat(kind::PRIVATE, "", user.id).await.unwrap();
        store
            .create_membership(chat.id, user.id, role::OWNER)
            .await
            .unwrap();

        let (session, mut rx) = Session::new(user.id, user.username.clone());
        let frame = format!(
            r#"{{"type":"read_chat","payload":{{"chat_id":"{}"}},"request_id":"r4"}}"#,
            chat.id
        );
        handle_frame(&state, &session, &frame).await;

        let reply: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["payload"]["code"], "read_chat_failed");
        assert_eq!(reply["request_id"], "r4");
        assert!(rx.try_recv().is_err());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn read_chat_surfaces_membership_check_failure_as_error_envelope() {
        let store = Arc::new(FailingReadStore::new(true, false));
        let state = state_over(store.clone());

        // The membership row is irrelevant here: the lookup itself fails.
        let user = store.create_user("alice", "Alice", None).await.unwrap();
        let chat = store.create_chat(kind::PRIVATE, "", user.id).await.unwrap();

        let (session, mut rx) = Session::new(user.id, user.username.clone());
        let frame = format!(
            r#"{{"type":"read_chat","payload":{{"chat_id":"{}"}}}}"#,
            chat.id
        );
        handle_frame(&state, &session, &frame).await;

        let reply: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["payload"]["code"], "read_chat_failed");
        assert!(rx.try_recv().is_err());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn read_chat_success_stays_silent() {
        let store = Arc::new(FailingReadStore::new(false, false));
        let state = state_over(store.clone());

        let user = store.create_user("alice", "Alice", None).await.unwrap();
        let chat = store.create_chat(kind::PRIVATE, "", user.id).await.unwrap();
        store
            .create_membership(chat.id, user.id, role::OWNER)
            .await
            .unwrap();

        let (session, mut rx) = Session::new(user.id, user.username.clone());
        let frame = format!(
            r#"{{"type":"read_chat","payload":{{"chat_id":"{}"}}}}"#,
            chat.id
        );
        handle_frame(&state, &session, &frame).await;

        assert!(rx.try_recv().is_err());
    }
}
