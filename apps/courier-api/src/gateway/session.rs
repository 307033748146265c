//! Per-connection session state.
//!
//! A session owns the server side of one WebSocket connection: the bounded
//! outbound queue drained by the writer task, the chat subscriptions held by
//! this connection, and the per-chat typing flags. The hub closes a session
//! by signalling `close()`; the writer observes it and shuts the transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::envelope::Envelope;

/// Outbound queue capacity. Enqueueing onto a full queue is fatal for the
/// session: a slow consumer must not stall delivery to everyone else.
pub const OUT_QUEUE_CAP: usize = 256;

/// Why an enqueue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The queue is full. The session must be evicted.
    Full,
    /// The session is already closing.
    Closed,
}

pub struct Session {
    /// Unique per-connection id (`ses_`-prefixed ULID).
    pub session_id: String,
    /// Authenticated user id.
    pub user_id: Uuid,
    /// Authenticated username (cached at upgrade time).
    pub username: String,
    out: mpsc::Sender<String>,
    closed: watch::Sender<bool>,
    subscribed: Mutex<HashSet<Uuid>>,
    /// Chats this session is typing in, with the instant of the last typing
    /// frame (used by the hub's auto-stop sweep).
    typing: Mutex<HashMap<Uuid, Instant>>,
    last_seen: Mutex<DateTime<Utc>>,
}

impl Session {
    /// Create a session and the receiving half of its outbound queue.
    pub fn new(user_id: Uuid, username: String) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (out, rx) = mpsc::channel(OUT_QUEUE_CAP);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            session_id: courier_common::id::prefixed_ulid(courier_common::id::prefix::SESSION),
            user_id,
            username,
            out,
            closed,
            subscribed: Mutex::new(HashSet::new()),
            typing: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Utc::now()),
        });
        (session, rx)
    }

    /// Serialize and enqueue an envelope. Non-blocking; `Full` is fatal for
    /// this session and the caller must deregister it.
    pub fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        self.send_raw(envelope.to_frame())
    }

    /// Enqueue an already-serialized frame (hub fan-out path: the bytes are
    /// serialized once and copied to every target).
    pub fn send_raw(&self, frame: String) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match self.out.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Signal the writer to shut down. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close()` has been called. Used by the writer's select.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // wait_for checks the current value first, so a close() that already
        // happened resolves immediately.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // --- subscriptions -----------------------------------------------------

    /// Record a subscription on the session. The hub owns the subscriber-map
    /// bookkeeping; this only updates local state.
    pub fn subscribe(&self, chat_id: Uuid) {
        self.subscribed.lock().insert(chat_id);
    }

    pub fn unsubscribe(&self, chat_id: Uuid) {
        self.subscribed.lock().remove(&chat_id);
        self.typing.lock().remove(&chat_id);
    }

    pub fn is_subscribed(&self, chat_id: Uuid) -> bool {
        self.subscribed.lock().contains(&chat_id)
    }

    /// Snapshot of the subscribed chats (hub deregistration walks this).
    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.subscribed.lock().iter().copied().collect()
    }

    // --- typing ------------------------------------------------------------

    pub fn set_typing(&self, chat_id: Uuid, is_typing: bool) {
        let mut typing = self.typing.lock();
        if is_typing {
            typing.insert(chat_id, Instant::now());
            *self.last_seen.lock() = Utc::now();
        } else {
            typing.remove(&chat_id);
        }
    }

    pub fn is_typing(&self, chat_id: Uuid) -> bool {
        self.typing.lock().contains_key(&chat_id)
    }

    /// Remove and return the chats whose last typing frame is older than
    /// `ttl`. The hub broadcasts a synthetic `typing_stop` for each.
    pub fn take_expired_typing(&self, ttl: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let mut typing = self.typing.lock();
        let expired: Vec<Uuid> = typing
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= ttl)
            .map(|(chat, _)| *chat)
            .collect();
        for chat in &expired {
            typing.remove(chat);
        }
        expired
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Arc<Session>, mpsc::Receiver<String>) {
        Session::new(Uuid::new_v4(), "tester".to_string())
    }

    #[test]
    fn queue_accepts_up_to_capacity_then_overflows() {
        let (session, _rx) = session();

        for i in 0..OUT_QUEUE_CAP {
            assert_eq!(session.send_raw(format!("frame {i}")), Ok(()));
        }
        assert_eq!(
            session.send_raw("one too many".to_string()),
            Err(SendError::Full)
        );
    }

    #[test]
    fn send_after_close_is_rejected() {
        let (session, _rx) = session();
        session.close();
        assert_eq!(session.send_raw("late".to_string()), Err(SendError::Closed));
    }

    #[test]
    fn close_is_idempotent() {
        let (session, _rx) = session();
        session.close();
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn closed_future_resolves_after_close() {
        let (session, _rx) = session();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        session.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() did not resolve")
            .unwrap();

        // Resolves immediately once already closed.
        session.closed().await;
    }

    #[test]
    fn subscribe_and_unsubscribe_are_idempotent() {
        let (session, _rx) = session();
        let chat = Uuid::new_v4();

        session.subscribe(chat);
        session.subscribe(chat);
        assert!(session.is_subscribed(chat));
        assert_eq!(session.subscriptions(), vec![chat]);

        session.unsubscribe(chat);
        session.unsubscribe(chat);
        assert!(!session.is_subscribed(chat));
        assert!(session.subscriptions().is_empty());
    }

    #[test]
    fn unsubscribe_clears_typing_flag() {
        let (session, _rx) = session();
        let chat = Uuid::new_v4();

        session.set_typing(chat, true);
        assert!(session.is_typing(chat));
        session.unsubscribe(chat);
        assert!(!session.is_typing(chat));
    }

    #[test]
    fn typing_expiry_returns_stale_chats_once() {
        let (session, _rx) = session();
        let chat = Uuid::new_v4();

        session.set_typing(chat, true);
        assert!(session.take_expired_typing(Duration::from_secs(60)).is_empty());

        let expired = session.take_expired_typing(Duration::ZERO);
        assert_eq!(expired, vec![chat]);
        assert!(!session.is_typing(chat));
        assert!(session.take_expired_typing(Duration::ZERO).is_empty());
    }

    #[test]
    fn frames_drain_in_fifo_order() {
        let (session, mut rx) = session();
        session.send_raw("a".to_string()).unwrap();
        session.send_raw("b".to_string()).unwrap();
        session.send_raw("c".to_string()).unwrap();

        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
        assert_eq!(rx.try_recv().unwrap(), "c");
    }
}
