//! `GET /quick/{id}/tunnel` — Guacamole proxy endpoint.
//!
//! The browser speaks the Guacamole client protocol over the `guacamole`
//! WebSocket subprotocol; this handler opens a guacd tunnel for the decoded
//! payload and then relays raw instructions in both directions. Inbound
//! relay runs on the socket read loop; outbound relay (guacd → browser plus
//! observer fan-out) runs on a separate pump task.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::guacamole::configuration::{self, ScreenSize, StoragePaths};
use crate::guacamole::{Protocol, Tunnel};
use crate::sessions::{close_frames, codes, Backend, Mode, Session};
use crate::util;
use crate::ws::{spawn_writer, ClientConn};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub width: String,
    #[serde(default)]
    pub height: String,
    #[serde(default)]
    pub dpi: String,
}

pub async fn tunnel_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TunnelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.protocols(["guacamole"])
        .on_upgrade(move |socket| handle(socket, state, session_id, query))
}

/// Notify the client in guacd wire form and close the socket. Used for
/// failures before a session exists in the registry.
async fn disconnect(client: &ClientConn, code: i32, reason: &str) {
    for frame in close_frames(Mode::Guacd, code, reason) {
        let _ = client.send_text(frame).await;
    }
    client.send_close().await;
}

async fn handle(socket: WebSocket, state: AppState, session_id: String, query: TunnelQuery) {
    let (sink, mut stream) = socket.split();
    let (client, rx) = ClientConn::channel(256);
    spawn_writer(sink, rx);

    let payload = match util::decode_payload(&query.payload) {
        Ok(p) => p,
        Err(err) => {
            disconnect(&client, codes::NEW_TUNNEL_ERROR, &err.to_string()).await;
            return;
        }
    };
    let protocol = match payload.protocol.parse::<Protocol>() {
        Ok(p) => p,
        Err(err) => {
            disconnect(&client, codes::NEW_TUNNEL_ERROR, &err.to_string()).await;
            return;
        }
    };

    let screen = ScreenSize {
        width: query.width,
        height: query.height,
        dpi: query.dpi,
    };
    let storage = StoragePaths {
        recording_root: state.config.guacd.recording.clone(),
        drive_root: state.config.guacd.drive.clone(),
        record_sessions: state.config.guacd.record_sessions,
    };
    let config = match configuration::build(
        &session_id,
        &payload,
        protocol,
        &screen,
        &payload.attributes,
        &storage,
    ) {
        Ok(c) => c,
        Err(err) => {
            disconnect(&client, codes::NEW_TUNNEL_ERROR, &err.to_string()).await;
            return;
        }
    };

    let tunnel = match Tunnel::open(&state.config.guacd.addr(), &config).await {
        Ok(t) => t,
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "guacd tunnel failed");
            disconnect(&client, codes::NEW_TUNNEL_ERROR, &err.to_string()).await;
            return;
        }
    };
    tracing::info!(
        session_id = %session_id,
        protocol = protocol.as_str(),
        connection_id = tunnel.connection_id(),
        "guacd session established"
    );

    let session = Arc::new(Session::new(
        &session_id,
        protocol,
        client.clone(),
        Backend::Guacd(tunnel),
        None,
    ));
    state.registry.add(session.clone()).await;

    // guacd → browser pump, with observer fan-out.
    let pump = {
        let registry = state.registry.clone();
        let session = session.clone();
        let client = client.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            let Some(tunnel) = session.tunnel() else { return };
            loop {
                match tunnel.read().await {
                    Ok(frame) => {
                        let Ok(text) = String::from_utf8(frame.to_vec()) else {
                            continue;
                        };
                        if client.send_text(text.clone()).await.is_err() {
                            registry.close_session(&id, codes::NORMAL, "Exited").await;
                            break;
                        }
                        session.broadcast(&text).await;
                    }
                    Err(_) => {
                        registry
                            .close_session(&id, codes::TUNNEL_CLOSED, "Remote connection closed")
                            .await;
                        break;
                    }
                }
            }
        })
    };

    // browser → guacd loop.
    while let Some(msg) = stream.next().await {
        let Ok(msg) = msg else { break };
        match msg {
            Message::Text(text) => {
                let Some(tunnel) = session.tunnel() else { break };
                if tunnel.write_and_flush(text.as_bytes()).await.is_err() {
                    state
                        .registry
                        .close_session(&session_id, codes::TUNNEL_CLOSED, "Remote connection closed")
                        .await;
                    pump.abort();
                    return;
                }
            }
            Message::Binary(data) => {
                let Some(tunnel) = session.tunnel() else { break };
                if tunnel.write_and_flush(&data).await.is_err() {
                    state
                        .registry
                        .close_session(&session_id, codes::TUNNEL_CLOSED, "Remote connection closed")
                        .await;
                    pump.abort();
                    return;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state
        .registry
        .close_session(&session_id, codes::NORMAL, "Exited")
        .await;
    pump.abort();
}
