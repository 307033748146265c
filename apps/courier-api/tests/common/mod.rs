use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use courier_api::auth::tokens;
use courier_api::config::Config;
use courier_api::db::kv::{KeyValueStore, MemoryKv};
use courier_api::gateway::hub::Hub;
use courier_api::models::chat::{role, Chat};
use courier_api::models::user::User;
use courier_api::store::{ChatStore, MemoryStore};
use courier_api::AppState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a real TCP server over the in-memory store.
/// Returns (addr, state, store). The server runs in the background.
pub async fn start_server() -> (SocketAddr, AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let hub = Hub::spawn(store.clone() as Arc<dyn ChatStore>);

    let state = AppState {
        store: store.clone(),
        kv,
        hub,
        config: Arc::new(Config {
            database_url: String::new(),
            port: 0,
        }),
    };

    let app = courier_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, store)
}

/// Create a user and mint an access token for them.
pub async fn seed_user(state: &AppState, username: &str) -> (User, String) {
    let user = state
        .store
        .create_user(username, username, None)
        .await
        .expect("create user");
    let token = tokens::issue_access_token(state.kv.as_ref(), user.id, &user.username)
        .await
        .expect("issue token");
    (user, token)
}

/// Create a chat whose first listed user is the owner.
pub async fn seed_chat(state: &AppState, kind: &str, members: &[&User]) -> Chat {
    let owner = members[0];
    let chat = state
        .store
        .create_chat(kind, "test chat", owner.id)
        .await
        .expect("create chat");
    for (i, user) in members.iter().enumerate() {
        let member_role = if i == 0 { role::OWNER } else { role::MEMBER };
        state
            .store
            .create_membership(chat.id, user.id, member_role)
            .await
            .expect("create membership");
    }
    chat
}

/// A connected WebSocket client that splits coalesced transport frames back
/// into individual envelopes.
pub struct TestClient {
    ws: WsStream,
    pending: VecDeque<serde_json::Value>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, token: &str) -> Self {
        let url = format!("ws://{addr}/api/v1/ws?token={token}");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("ws connect");
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    /// Attempt to connect; returns the HTTP status on rejection.
    pub async fn try_connect(addr: SocketAddr, query: &str) -> Result<Self, u16> {
        let url = format!("ws://{addr}/api/v1/ws{query}");
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => Ok(Self {
                ws,
                pending: VecDeque::new(),
            }),
            Err(tungstenite::Error::Http(response)) => Err(response.status().as_u16()),
            Err(other) => panic!("unexpected connect error: {other:?}"),
        }
    }

    pub async fn send(&mut self, value: serde_json::Value) {
        self.ws
            .send(tungstenite::Message::Text(value.to_string().into()))
            .await
            .expect("ws send");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(tungstenite::Message::Text(text.to_string().into()))
            .await
            .expect("ws send");
    }

    /// Next envelope, waiting up to 5 s. Panics on timeout or close.
    pub async fn recv(&mut self) -> serde_json::Value {
        self.recv_within(Duration::from_secs(5)).await
    }

    pub async fn recv_within(&mut self, wait: Duration) -> serde_json::Value {
        match self.next_envelope(wait).await {
            Some(value) => value,
            None => panic!("expected an envelope, connection closed or timed out"),
        }
    }

    /// Next envelope of the given type, skipping any others (presence frames
    /// from concurrent connects arrive in nondeterministic interleavings).
    pub async fn expect(&mut self, kind: &str) -> serde_json::Value {
        let deadline = time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline
                .checked_duration_since(time::Instant::now())
                .unwrap_or(Duration::ZERO);
            match self.next_envelope(remaining).await {
                Some(value) if value["type"] == kind => return value,
                Some(_) => continue,
                None => panic!("expected a {kind} envelope"),
            }
        }
    }

    /// Assert that no envelope arrives within the window.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Some(value) = self.next_envelope(wait).await {
            panic!("expected silence, got: {value}");
        }
    }

    /// Assert the server closes the connection within the window.
    pub async fn expect_close(&mut self, wait: Duration) {
        let deadline = time::Instant::now() + wait;
        loop {
            let remaining = deadline
                .checked_duration_since(time::Instant::now())
                .unwrap_or(Duration::ZERO);
            match time::timeout(remaining, self.ws.next()).await {
                Ok(Some(Ok(tungstenite::Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {
                    return
                }
                Ok(Some(Ok(_))) => continue,
                Err(_) => panic!("connection was not closed in time"),
            }
        }
    }

    async fn next_envelope(&mut self, wait: Duration) -> Option<serde_json::Value> {
        let deadline = time::Instant::now() + wait;
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Some(value);
            }
            let remaining = deadline.checked_duration_since(time::Instant::now())?;
            match time::timeout(remaining, self.ws.next()).await {
                Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
                    for line in text.split('\n').filter(|l| !l.trim().is_empty()) {
                        let value: serde_json::Value =
                            serde_json::from_str(line).expect("parse envelope");
                        self.pending.push_back(value);
                    }
                }
                Ok(Some(Ok(tungstenite::Message::Ping(_))))
                | Ok(Some(Ok(tungstenite::Message::Pong(_)))) => continue,
                Ok(Some(Ok(tungstenite::Message::Close(_)))) | Ok(None) => return None,
                Ok(Some(Ok(other))) => panic!("unexpected ws message: {other:?}"),
                Ok(Some(Err(_))) | Err(_) => return None,
            }
        }
    }
}
