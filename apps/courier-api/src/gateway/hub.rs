//! Process-wide connection hub.
//!
//! All mutations of `sessions_by_user` and `subscribers_by_chat` happen on a
//! single long-running loop task fed by four bounded channels: `register`,
//! `deregister`, `broadcast` (global) and `chat` (chat broadcast +
//! subscription changes). Handlers never touch the maps directly; they hold
//! a cloneable `Hub` handle and send commands.
//!
//! Because every fan-out enqueue happens from the one loop, envelopes are
//! enqueued into each target session in the loop's arrival order: any two
//! subscribers of a chat observe its broadcasts in the same order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::store::ChatStore;

use super::envelope::{Envelope, EventName, TypingStatusPayload};
use super::presence;
use super::session::Session;

/// Capacity of the hub's inbound channels. A full channel applies
/// backpressure to the sending handler.
pub const HUB_CHANNEL_CAP: usize = 256;

/// A session with no typing frame for this long gets a synthetic
/// `typing_stop` broadcast, bounding stale typing indicators across clients.
pub const TYPING_TTL: Duration = Duration::from_secs(3);

const TYPING_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Messages on the global broadcast channel.
enum GlobalCommand {
    /// Deliver to every connected session, except `exclude` when set.
    Broadcast {
        frame: String,
        exclude: Option<Uuid>,
    },
    /// Deliver to a single user's session, if connected.
    Direct { user_id: Uuid, frame: String },
}

/// Messages on the chat channel. Broadcasts and subscription changes share
/// one channel so that a subscribe's history replay is totally ordered with
/// live chat traffic: no live frame can overtake the backlog.
enum ChatCommand {
    Broadcast {
        chat_id: Uuid,
        frame: String,
        exclude: Option<Uuid>,
    },
    Subscribe {
        session: Arc<Session>,
        chat_id: Uuid,
        backlog: Vec<String>,
    },
    Unsubscribe {
        session: Arc<Session>,
        chat_id: Uuid,
    },
}

/// Cloneable handle to the hub loop.
#[derive(Clone)]
pub struct Hub {
    register: mpsc::Sender<Arc<Session>>,
    deregister: mpsc::Sender<Arc<Session>>,
    broadcast: mpsc::Sender<GlobalCommand>,
    chat: mpsc::Sender<ChatCommand>,
}

impl Hub {
    /// Spawn the hub loop. The loop exits (closing every session) once all
    /// `Hub` handles have been dropped.
    pub fn spawn(store: Arc<dyn ChatStore>) -> Self {
        let (register_tx, register_rx) = mpsc::channel(HUB_CHANNEL_CAP);
        let (deregister_tx, deregister_rx) = mpsc::channel(HUB_CHANNEL_CAP);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(HUB_CHANNEL_CAP);
        let (chat_tx, chat_rx) = mpsc::channel(HUB_CHANNEL_CAP);

        tokio::spawn(run(
            store,
            register_rx,
            deregister_rx,
            broadcast_rx,
            chat_rx,
        ));

        Self {
            register: register_tx,
            deregister: deregister_tx,
            broadcast: broadcast_tx,
            chat: chat_tx,
        }
    }

    /// Register a session. An existing session for the same user is evicted.
    pub async fn register(&self, session: Arc<Session>) {
        if self.register.send(session).await.is_err() {
            tracing::error!("hub loop is gone; dropping registration");
        }
    }

    /// Deregister a session. A no-op if a newer session has replaced it.
    pub async fn deregister(&self, session: Arc<Session>) {
        if self.deregister.send(session).await.is_err() {
            tracing::error!("hub loop is gone; dropping deregistration");
        }
    }

    /// Fan out an envelope to every connected session.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<Uuid>) {
        let command = GlobalCommand::Broadcast {
            frame: envelope.to_frame(),
            exclude,
        };
        if self.broadcast.send(command).await.is_err() {
            tracing::error!("hub loop is gone; dropping broadcast");
        }
    }

    /// Deliver an envelope to one user's session, if connected.
    pub async fn send_to_user(&self, user_id: Uuid, envelope: &Envelope) {
        let command = GlobalCommand::Direct {
            user_id,
            frame: envelope.to_frame(),
        };
        if self.broadcast.send(command).await.is_err() {
            tracing::error!("hub loop is gone; dropping direct send");
        }
    }

    /// Fan out an envelope to a chat's subscribers. Applies backpressure to
    /// the caller when the hub channel is full; message-class events must
    /// wait rather than be dropped.
    pub async fn broadcast_to_chat(&self, chat_id: Uuid, envelope: &Envelope, exclude: Option<Uuid>) {
        let command = ChatCommand::Broadcast {
            chat_id,
            frame: envelope.to_frame(),
            exclude,
        };
        if self.chat.send(command).await.is_err() {
            tracing::error!(%chat_id, "hub loop is gone; dropping chat broadcast");
        }
    }

    /// Non-blocking chat fan-out for droppable event types (typing). Returns
    /// false if the frame was dropped because the channel was full.
    pub fn try_broadcast_to_chat(
        &self,
        chat_id: Uuid,
        envelope: &Envelope,
        exclude: Option<Uuid>,
    ) -> bool {
        let command = ChatCommand::Broadcast {
            chat_id,
            frame: envelope.to_frame(),
            exclude,
        };
        self.chat.try_send(command).is_ok()
    }

    /// Add a session to a chat's subscriber set. `backlog` is the serialized
    /// history replay, delivered to this session only, before any live chat
    /// traffic. Re-subscribing is a no-op (no duplicate replay).
    pub async fn subscribe(&self, session: Arc<Session>, chat_id: Uuid, backlog: Vec<String>) {
        let command = ChatCommand::Subscribe {
            session,
            chat_id,
            backlog,
        };
        if self.chat.send(command).await.is_err() {
            tracing::error!(%chat_id, "hub loop is gone; dropping subscribe");
        }
    }

    /// Remove a session from a chat's subscriber set.
    pub async fn unsubscribe(&self, session: Arc<Session>, chat_id: Uuid) {
        let command = ChatCommand::Unsubscribe { session, chat_id };
        if self.chat.send(command).await.is_err() {
            tracing::error!(%chat_id, "hub loop is gone; dropping unsubscribe");
        }
    }
}

// ---------------------------------------------------------------------------
// Hub loop
// ---------------------------------------------------------------------------

async fn run(
    store: Arc<dyn ChatStore>,
    mut register_rx: mpsc::Receiver<Arc<Session>>,
    mut deregister_rx: mpsc::Receiver<Arc<Session>>,
    mut broadcast_rx: mpsc::Receiver<GlobalCommand>,
    mut chat_rx: mpsc::Receiver<ChatCommand>,
) {
    let mut state = HubState::new();
    let mut sweep = tokio::time::interval(TYPING_SWEEP_PERIOD);
    sweep.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            registered = register_rx.recv() => match registered {
                Some(session) => handle_register(&mut state, &store, session),
                None => break,
            },
            deregistered = deregister_rx.recv() => match deregistered {
                Some(session) => handle_deregister(&mut state, &store, session),
                None => break,
            },
            command = broadcast_rx.recv() => match command {
                Some(GlobalCommand::Broadcast { frame, exclude }) => {
                    let evicted = state.broadcast(&frame, exclude);
                    log_evictions(&evicted);
                }
                Some(GlobalCommand::Direct { user_id, frame }) => {
                    let evicted = state.send_to_user(user_id, &frame);
                    log_evictions(&evicted);
                }
                None => break,
            },
            command = chat_rx.recv() => match command {
                Some(ChatCommand::Broadcast { chat_id, frame, exclude }) => {
                    let evicted = state.broadcast_to_chat(chat_id, &frame, exclude);
                    log_evictions(&evicted);
                }
                Some(ChatCommand::Subscribe { session, chat_id, backlog }) => {
                    handle_subscribe(&mut state, session, chat_id, backlog);
                }
                Some(ChatCommand::Unsubscribe { session, chat_id }) => {
                    state.unsubscribe(&session, chat_id);
                }
                None => break,
            },
            _ = sweep.tick() => sweep_typing(&mut state),
        }
    }

    // Hub shutdown: close every session so writers flush and exit.
    state.close_all();
    tracing::info!("hub loop stopped");
}

fn handle_register(state: &mut HubState, store: &Arc<dyn ChatStore>, session: Arc<Session>) {
    let user_id = session.user_id;
    let username = session.username.clone();

    if let Some(prior) = state.register(session.clone()) {
        tracing::info!(
            user_id = %user_id,
            evicted = %prior.session_id,
            replacement = %session.session_id,
            "duplicate login; evicted prior session"
        );
    }

    presence::mark(store.clone(), user_id, true);

    let frame = presence::online_envelope(user_id, &username).to_frame();
    let evicted = state.broadcast(&frame, Some(user_id));
    log_evictions(&evicted);

    tracing::info!(session_id = %session.session_id, user_id = %user_id, "session registered");
}

fn handle_deregister(state: &mut HubState, store: &Arc<dyn ChatStore>, session: Arc<Session>) {
    if !state.deregister(&session) {
        // A newer session replaced this one, or it was already evicted.
        return;
    }

    presence::mark(store.clone(), session.user_id, false);

    let frame = presence::offline_envelope(session.user_id, &session.username).to_frame();
    let evicted = state.broadcast(&frame, Some(session.user_id));
    log_evictions(&evicted);

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        "session deregistered"
    );
}

fn handle_subscribe(
    state: &mut HubState,
    session: Arc<Session>,
    chat_id: Uuid,
    backlog: Vec<String>,
) {
    if !state.subscribe(&session, chat_id) {
        return; // Already subscribed; no duplicate replay.
    }
    for frame in backlog {
        if session.send_raw(frame).is_err() {
            state.evict(&session);
            log_evictions(std::slice::from_ref(&session));
            return;
        }
    }
}

fn sweep_typing(state: &mut HubState) {
    for (session, chat_id) in state.expired_typing(TYPING_TTL) {
        let envelope = Envelope::event(
            EventName::TYPING,
            TypingStatusPayload {
                chat_id,
                user_id: session.user_id,
                user_name: session.username.clone(),
                is_typing: false,
            },
        );
        let evicted = state.broadcast_to_chat(chat_id, &envelope.to_frame(), Some(session.user_id));
        log_evictions(&evicted);
    }
}

fn log_evictions(evicted: &[Arc<Session>]) {
    for session in evicted {
        tracing::warn!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            "outbound queue overflow; session evicted"
        );
    }
}

// ---------------------------------------------------------------------------
// Hub state
// ---------------------------------------------------------------------------

/// The maps the hub loop owns. No locking: only the loop task touches this.
struct HubState {
    sessions_by_user: HashMap<Uuid, Arc<Session>>,
    subscribers_by_chat: HashMap<Uuid, HashMap<Uuid, Arc<Session>>>,
}

impl HubState {
    fn new() -> Self {
        Self {
            sessions_by_user: HashMap::new(),
            subscribers_by_chat: HashMap::new(),
        }
    }

    /// Install a session, evicting any prior session for the same user.
    /// The evicted session is closed and removed from both maps.
    fn register(&mut self, session: Arc<Session>) -> Option<Arc<Session>> {
        let prior = self.sessions_by_user.remove(&session.user_id);
        if let Some(ref prior) = prior {
            prior.close();
            for chat_id in prior.subscriptions() {
                self.remove_subscriber(chat_id, prior.user_id);
            }
        }
        self.sessions_by_user.insert(session.user_id, session);
        prior
    }

    /// Remove a session, but only if it is still the registered one for its
    /// user. Returns false for sessions already replaced or evicted.
    fn deregister(&mut self, session: &Arc<Session>) -> bool {
        match self.sessions_by_user.get(&session.user_id) {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => return false,
        }
        self.sessions_by_user.remove(&session.user_id);
        session.close();
        for chat_id in session.subscriptions() {
            self.remove_subscriber(chat_id, session.user_id);
        }
        true
    }

    /// Add a session to a chat's subscriber set. Returns false if it was
    /// already subscribed.
    fn subscribe(&mut self, session: &Arc<Session>, chat_id: Uuid) -> bool {
        let subscribers = self.subscribers_by_chat.entry(chat_id).or_default();
        let newly = match subscribers.insert(session.user_id, session.clone()) {
            None => true,
            Some(old) => !Arc::ptr_eq(&old, session),
        };
        session.subscribe(chat_id);
        newly
    }

    fn unsubscribe(&mut self, session: &Arc<Session>, chat_id: Uuid) {
        self.remove_subscriber(chat_id, session.user_id);
        session.unsubscribe(chat_id);
    }

    /// Remove a subscriber, dropping the chat key once its set is empty.
    fn remove_subscriber(&mut self, chat_id: Uuid, user_id: Uuid) {
        if let Some(subscribers) = self.subscribers_by_chat.get_mut(&chat_id) {
            subscribers.remove(&user_id);
            if subscribers.is_empty() {
                self.subscribers_by_chat.remove(&chat_id);
            }
        }
    }

    /// Fan out to every connected session. Returns the sessions evicted for
    /// queue overflow.
    fn broadcast(&mut self, frame: &str, exclude: Option<Uuid>) -> Vec<Arc<Session>> {
        let targets: Vec<Arc<Session>> = self
            .sessions_by_user
            .values()
            .filter(|s| exclude != Some(s.user_id))
            .cloned()
            .collect();
        self.deliver(targets, frame)
    }

    /// Fan out to a chat's subscribers.
    fn broadcast_to_chat(
        &mut self,
        chat_id: Uuid,
        frame: &str,
        exclude: Option<Uuid>,
    ) -> Vec<Arc<Session>> {
        let targets: Vec<Arc<Session>> = match self.subscribers_by_chat.get(&chat_id) {
            Some(subscribers) => subscribers
                .values()
                .filter(|s| exclude != Some(s.user_id))
                .cloned()
                .collect(),
            None => return Vec::new(),
        };
        self.deliver(targets, frame)
    }

    /// Deliver to one user's session.
    fn send_to_user(&mut self, user_id: Uuid, frame: &str) -> Vec<Arc<Session>> {
        let targets: Vec<Arc<Session>> = self.sessions_by_user.get(&user_id).cloned().into_iter().collect();
        self.deliver(targets, frame)
    }

    /// Non-blocking enqueue to each target. A full (or closed) queue evicts
    /// the target session: slow consumers must not stall the rest.
    fn deliver(&mut self, targets: Vec<Arc<Session>>, frame: &str) -> Vec<Arc<Session>> {
        let mut evicted = Vec::new();
        for session in targets {
            if session.send_raw(frame.to_string()).is_err() {
                self.evict(&session);
                evicted.push(session);
            }
        }
        evicted
    }

    /// Close a session and remove it from both maps.
    fn evict(&mut self, session: &Arc<Session>) {
        session.close();
        if let Some(current) = self.sessions_by_user.get(&session.user_id) {
            if Arc::ptr_eq(current, session) {
                self.sessions_by_user.remove(&session.user_id);
            }
        }
        for chat_id in session.subscriptions() {
            self.remove_subscriber(chat_id, session.user_id);
        }
    }

    /// All `(session, chat)` pairs whose typing flag expired.
    fn expired_typing(&self, ttl: Duration) -> Vec<(Arc<Session>, Uuid)> {
        let mut expired = Vec::new();
        for session in self.sessions_by_user.values() {
            for chat_id in session.take_expired_typing(ttl) {
                expired.push((session.clone(), chat_id));
            }
        }
        expired
    }

    fn close_all(&mut self) {
        for session in self.sessions_by_user.values() {
            session.close();
        }
        self.sessions_by_user.clear();
        self.subscribers_by_chat.clear();
    }
}
