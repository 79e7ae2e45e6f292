//! WebSocket listener: one connection ↔ one session subscription.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::error::DecodeError;
use crate::protocol::{decode_client_message, ClientMessage, ServerMessage};
use crate::registry::SessionRegistry;
use crate::session::{ConnectionId, ConnectionReceiver, Session, SessionInfo};

pub const DEFAULT_SESSION_ID: &str = "default";
pub const TERMINAL_PATH: &str = "/api/terminal/websocket";
pub const STATUS_PATH: &str = "/api/pty";
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// The requested session id, or [`DEFAULT_SESSION_ID`] when it is missing,
/// empty, too long or contains characters outside `[A-Za-z0-9._:-]`.
pub fn session_id_or_default(requested: Option<&str>) -> String {
    match requested {
        Some(id)
            if !id.is_empty()
                && id.len() <= MAX_SESSION_ID_LEN
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')) =>
        {
            id.to_string()
        }
        _ => DEFAULT_SESSION_ID.to_string(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_terminal))
        .route(TERMINAL_PATH, get(ws_terminal))
        .route(STATUS_PATH, get(status))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub status: &'static str,
    pub message: String,
    pub session_count: usize,
    pub sessions_spawned: u64,
    pub sessions: Vec<SessionInfo>,
}

async fn status(State(state): State<AppState>) -> Json<Status> {
    let sessions = state.registry.sessions().await;
    Json(Status {
        status: "available",
        message: format!("PTY WebSocket endpoint. Connect on {TERMINAL_PATH}?sessionId=<id>"),
        session_count: sessions.len(),
        sessions_spawned: state.registry.spawn_count(),
        sessions,
    })
}

// ── Terminal socket ─────────────────────────────────────────────────

async fn ws_terminal(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session_id = session_id_or_default(params.session_id.as_deref());
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.registry, session_id))
}

async fn handle_socket(socket: WebSocket, registry: SessionRegistry, session_id: String) {
    let connection = ConnectionId::next();
    let (mut sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();

    let session = match registry.attach(&session_id, connection, tx).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(session = %session_id, %connection, error = %err, "failed to create pty session");
            let frame = ServerMessage::error(format!("Failed to create shell process: {err}"));
            let _ = sink.send(Message::Text(frame.to_json())).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    tracing::info!(session = %session_id, %connection, pid = session.pid(), "client connected");

    let mut writer = tokio::spawn(write_frames(sink, rx));

    loop {
        tokio::select! {
            // Session closed our stream (shell exited) or the peer went away.
            _ = &mut writer => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&session, &text).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_frame(&session, text).await,
                    Err(_) => tracing::debug!(%connection, "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%connection, error = %err, "websocket receive failed");
                    break;
                }
            },
        }
    }

    registry.detach(&session_id, connection).await;
    writer.abort();
    tracing::info!(session = %session_id, %connection, "client disconnected");
}

/// Drain the connection's queue onto the socket. Ends with a close frame
/// once the session drops its sender.
async fn write_frames(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: ConnectionReceiver,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(Message::Text(message.to_json())).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn handle_frame(session: &Arc<Session>, text: &str) {
    match decode_client_message(text) {
        Ok(ClientMessage::Data { data }) => session.write(&data).await,
        Ok(message @ ClientMessage::Resize { .. }) => match message.dimensions() {
            Some((cols, rows)) => session.resize(cols, rows),
            None => tracing::debug!(session = %session.id(), "ignoring resize without usable dimensions"),
        },
        Err(DecodeError::UnknownKind(kind)) => {
            tracing::warn!(session = %session.id(), kind = %kind, "unknown message type");
        }
        Err(err) => {
            tracing::warn!(session = %session.id(), error = %err, "dropping malformed frame");
        }
    }
}
