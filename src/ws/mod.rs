//! WebSocket plumbing shared by the tunnel and terminal endpoints.
//!
//! The client frame format is a single ASCII digit (the frame type) followed
//! by the payload. Outbound traffic to one socket is serialized through a
//! bounded channel drained by a single writer task, so every producer — flush
//! pump, keepalive echo, observer fan-out, close notification — gets
//! frame-atomic writes without sharing a lock.

pub mod guac;
pub mod term;

use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frame types exchanged with the browser on terminal sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Closed,
    Connected,
    Data,
    Resize,
    Ping,
}

impl FrameKind {
    fn digit(self) -> char {
        match self {
            FrameKind::Closed => '0',
            FrameKind::Connected => '1',
            FrameKind::Data => '2',
            FrameKind::Resize => '3',
            FrameKind::Ping => '4',
        }
    }

    fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(FrameKind::Closed),
            '1' => Some(FrameKind::Connected),
            '2' => Some(FrameKind::Data),
            '3' => Some(FrameKind::Resize),
            '4' => Some(FrameKind::Ping),
            _ => None,
        }
    }
}

pub fn format_frame(kind: FrameKind, payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 1);
    out.push(kind.digit());
    out.push_str(payload);
    out
}

/// Split an inbound frame into type and payload. `None` for an empty frame
/// or an unknown type digit; such frames are ignored, not fatal.
pub fn parse_frame(text: &str) -> Option<(FrameKind, &str)> {
    let mut chars = text.chars();
    let kind = FrameKind::from_digit(chars.next()?)?;
    Some((kind, chars.as_str()))
}

/// Resize frame payload: base64-wrapped JSON `{"rows": .., "cols": ..}`.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct ResizePayload {
    pub rows: u32,
    pub cols: u32,
}

pub fn decode_resize(payload: &str) -> Option<ResizePayload> {
    let bytes = STANDARD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// The peer's socket is gone (writer task exited).
#[derive(Debug, Error)]
#[error("client connection closed")]
pub struct ClientGone;

/// Cheap cloneable sender for one WebSocket. All writes funnel through the
/// writer task spawned by [`spawn_writer`].
#[derive(Clone)]
pub struct ClientConn {
    tx: mpsc::Sender<Message>,
}

impl ClientConn {
    /// Create a connection plus the receiving end for its writer task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientGone> {
        self.tx
            .send(Message::Text(text.into().into()))
            .await
            .map_err(|_| ClientGone)
    }

    /// Best-effort close frame; the writer task shuts the socket down after
    /// sending it.
    pub async fn send_close(&self) {
        let _ = self.tx.send(Message::Close(None)).await;
    }
}

/// Drain `rx` into the socket sink. Exits on the first write error, after a
/// close frame, or when every [`ClientConn`] clone is dropped; closes the
/// sink on the way out.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let done = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || done {
                break;
            }
        }
        let _ = sink.close().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_format_and_parse() {
        assert_eq!(format_frame(FrameKind::Data, "ls -la\r"), "2ls -la\r");
        assert_eq!(format_frame(FrameKind::Connected, ""), "1");
        assert_eq!(parse_frame("2ls"), Some((FrameKind::Data, "ls")));
        assert_eq!(parse_frame("4"), Some((FrameKind::Ping, "")));
        assert_eq!(parse_frame(""), None);
        assert_eq!(parse_frame("9x"), None);
    }

    #[test]
    fn closed_frame_carries_reason() {
        assert_eq!(format_frame(FrameKind::Closed, "Exited"), "0Exited");
    }

    #[test]
    fn resize_payload_decodes() {
        let raw = STANDARD.encode(r#"{"rows":50,"cols":120}"#);
        assert_eq!(
            decode_resize(&raw),
            Some(ResizePayload {
                rows: 50,
                cols: 120
            })
        );
        assert_eq!(decode_resize("not-base64!"), None);
        assert_eq!(decode_resize(&STANDARD.encode("[]")), None);
    }

    #[tokio::test]
    async fn client_conn_reports_peer_gone() {
        let (conn, rx) = ClientConn::channel(4);
        conn.send_text("2hi").await.unwrap();
        drop(rx);
        assert!(conn.send_text("2bye").await.is_err());
    }
}
