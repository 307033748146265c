//! WebSocket upgrade handler and the per-connection reader/writer tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;

use crate::auth::tokens::{self, AccessTokenData};
use crate::AppState;

use super::handler;
use super::session::Session;

/// Write deadline for a single transport write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read deadline; reset by any inbound frame (a pong counts).
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence; must stay under `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Maximum inbound frame size (512 KiB). Larger frames surface as a read
/// error and terminate the session.
pub const MAX_FRAME_BYTES: usize = 512 * 1024;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// `GET /api/v1/ws?token=<bearer>` — authenticate, then upgrade into the hub.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        return unauthorized("Missing token");
    };

    let identity = match tokens::lookup_access_token(state.kv.as_ref(), &token).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return unauthorized("Invalid or expired token"),
        Err(_) => return unauthorized("Token lookup failed"),
    };

    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_connection(socket, state, identity))
        .into_response()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: AppState, identity: AccessTokenData) {
    let (ws_tx, ws_rx) = socket.split();

    let (session, out_rx) = Session::new(identity.user_id, identity.username);
    state.hub.register(session.clone()).await;

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        username = %session.username,
        "session established"
    );

    let writer = tokio::spawn(run_writer(ws_tx, out_rx, session.clone()));

    run_reader(&state, &session, ws_rx).await;

    // Reader exit: deregister (a no-op if a duplicate login already evicted
    // us) and signal the writer down.
    state.hub.deregister(session.clone()).await;
    session.close();
    let _ = writer.await;

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        "session ended"
    );
}

/// Read loop: enforce the read deadline, decode frames, dispatch intents.
async fn run_reader(state: &AppState, session: &Arc<Session>, mut ws_rx: SplitStream<WebSocket>) {
    loop {
        let message = match time::timeout(PONG_WAIT, ws_rx.next()).await {
            Err(_) => {
                tracing::debug!(session_id = %session.session_id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => handler::handle_frame(state, session, text.as_str()).await,
            Message::Binary(data) => {
                // Envelopes are JSON either way; tolerate binary framing.
                if let Ok(text) = std::str::from_utf8(&data) {
                    handler::handle_frame(state, session, text).await;
                }
            }
            // Transport pings/pongs only matter for the deadline, which the
            // frame's arrival already reset.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }

        if session.is_closed() {
            break;
        }
    }
}

/// Write loop: drain the outbound queue (coalescing bursts into one
/// transport frame), keep the connection alive with pings, and shut the
/// transport once the session is closed.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<String>,
    session: Arc<Session>,
) {
    let mut ticker = time::interval(PING_PERIOD);
    ticker.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            // Hub-initiated close: eviction, overflow, or shutdown. Drain
            // what is already queued, then close the transport.
            _ = session.closed() => {
                while let Ok(frame) = out_rx.try_recv() {
                    match time::timeout(WRITE_WAIT, ws_tx.send(Message::Text(frame.into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                let _ = time::timeout(WRITE_WAIT, ws_tx.send(Message::Close(None))).await;
                break;
            }

            frame = out_rx.recv() => {
                let Some(mut frame) = frame else {
                    let _ = time::timeout(WRITE_WAIT, ws_tx.send(Message::Close(None))).await;
                    break;
                };

                // Anything already queued rides in the same transport frame.
                while let Ok(next) = out_rx.try_recv() {
                    frame.push('\n');
                    frame.push_str(&next);
                }

                match time::timeout(WRITE_WAIT, ws_tx.send(Message::Text(frame.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws write error");
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(session_id = %session.session_id, "write deadline expired");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                match time::timeout(WRITE_WAIT, ws_tx.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        tracing::debug!(session_id = %session.session_id, "ping write failed");
                        break;
                    }
                }
            }
        }
    }

    // Make sure the reader observes the shutdown even if we broke on a write
    // error rather than a close signal.
    session.close();
    let _ = ws_tx.close().await;
}
