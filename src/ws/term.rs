//! `GET /quick/{id}/ssh` — native terminal endpoint — and
//! `GET /quick/{id}/monitor` — read-only observer attachment.
//!
//! Terminal traffic uses the digit-prefixed frame format from [`super`]:
//! the client sends Data/Resize/Ping frames, the bridge pumps reply with
//! coalesced Data frames, and teardown is announced with a Closed frame.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::guacamole::Protocol;
use crate::sessions::{codes, Backend, Session};
use crate::terminal::{QuickTerminal, Recorder, TermBridge};
use crate::util;
use crate::ws::{decode_resize, format_frame, parse_frame, spawn_writer, ClientConn, FrameKind};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TermQuery {
    #[serde(default)]
    pub payload: String,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
}

pub async fn term_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TermQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle(socket, state, session_id, query))
}

/// Closed-frame notification for failures before the session is registered.
async fn refuse(client: &ClientConn, reason: &str) {
    let _ = client
        .send_text(format_frame(FrameKind::Closed, reason))
        .await;
    client.send_close().await;
}

async fn handle(socket: WebSocket, state: AppState, session_id: String, query: TermQuery) {
    let (sink, mut stream) = socket.split();
    let (client, rx) = ClientConn::channel(256);
    spawn_writer(sink, rx);

    let payload = match util::decode_payload(&query.payload) {
        Ok(p) => p,
        Err(err) => {
            refuse(&client, &err.to_string()).await;
            return;
        }
    };

    let cols = query.cols.unwrap_or(80);
    let rows = query.rows.unwrap_or(24);
    let timeout = Duration::from_secs(state.config.terminal.connect_timeout_secs);

    let (terminal, channel) = match QuickTerminal::connect(&payload, cols, rows, timeout).await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "ssh connect failed");
            refuse(&client, &format!("Failed to establish SSH client: {err}")).await;
            return;
        }
    };

    let recorder = if state.config.terminal.record_sessions {
        match Recorder::create(&state.config.guacd.recording, &session_id, cols, rows).await {
            Ok(rec) => Some(Arc::new(rec)),
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "recorder unavailable");
                None
            }
        }
    } else {
        None
    };

    let session = Arc::new(Session::new(
        &session_id,
        Protocol::Ssh,
        client.clone(),
        Backend::Terminal(terminal),
        recorder.clone(),
    ));
    state.registry.add(session).await;
    tracing::info!(session_id = %session_id, host = %payload.host, "terminal session established");

    let bridge = TermBridge::spawn(
        session_id.clone(),
        channel,
        cols,
        rows,
        state.registry.clone(),
        client.clone(),
        recorder,
        Duration::from_millis(state.config.terminal.flush_interval_ms),
    );

    if client
        .send_text(format_frame(FrameKind::Connected, ""))
        .await
        .is_err()
    {
        state
            .registry
            .close_session(&session_id, codes::NORMAL, "Exited")
            .await;
        bridge.shutdown();
        return;
    }

    while let Some(msg) = stream.next().await {
        let Ok(msg) = msg else { break };
        match msg {
            Message::Text(text) => match parse_frame(&text) {
                Some((FrameKind::Data, data)) => {
                    if !bridge.write(data.as_bytes().to_vec()).await {
                        break;
                    }
                }
                Some((FrameKind::Resize, payload)) => {
                    if let Some(resize) = decode_resize(payload) {
                        bridge.resize(resize.cols, resize.rows).await;
                    }
                }
                Some((FrameKind::Ping, _)) => {
                    // The bridge echoes the Ping once the backend answers.
                    bridge.keepalive().await;
                }
                _ => {}
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state
        .registry
        .close_session(&session_id, codes::NORMAL, "Exited")
        .await;
    bridge.shutdown();
}

pub async fn monitor_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_monitor(socket, state, session_id))
}

/// Attach a read-only observer to a live session. The observer mirrors the
/// primary's Data frames until either side goes away.
async fn handle_monitor(socket: WebSocket, state: AppState, session_id: String) {
    let (sink, mut stream) = socket.split();
    let (client, rx) = ClientConn::channel(256);
    spawn_writer(sink, rx);

    let Some(session) = state.registry.get(&session_id).await else {
        refuse(&client, "NotFoundSession").await;
        return;
    };

    let observer_id = uuid::Uuid::new_v4().to_string();
    session.attach_observer(&observer_id, client).await;
    tracing::debug!(session_id = %session_id, observer_id = %observer_id, "observer attached");

    // Observers only watch; drain the socket until it closes.
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    session.detach_observer(&observer_id).await;
    tracing::debug!(session_id = %session_id, observer_id = %observer_id, "observer detached");
}
