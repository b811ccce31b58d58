//! Live session registry, observer fan-out, and the single teardown path.
//!
//! Every way a session can die — client hangup, backend EOF, forced
//! disconnect, server shutdown — funnels into
//! [`SessionRegistry::close_session`]. Removing the entry from the map under
//! the write lock picks exactly one winner; the winner then runs the slow
//! teardown (notify, close backend, close recorder, close socket) with the
//! lock released, and every step swallows its own errors so a dead socket
//! can never abort cleanup of the rest.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::guacamole::{Instruction, Protocol, Tunnel};
use crate::terminal::{QuickTerminal, Recorder};
use crate::ws::{format_frame, ClientConn, FrameKind};

/// Disconnect status codes surfaced to the browser client.
pub mod codes {
    pub const TUNNEL_CLOSED: i32 = -1;
    pub const NORMAL: i32 = 0;
    pub const NOT_FOUND_SESSION: i32 = 800;
    pub const NEW_TUNNEL_ERROR: i32 = 801;
    pub const FORCED_DISCONNECT: i32 = 802;
    pub const ACCESS_GATEWAY_UNAVAILABLE: i32 = 803;
    pub const ACCESS_GATEWAY_CREATE_ERROR: i32 = 804;
    pub const ASSET_NOT_ACTIVE: i32 = 805;
    pub const NEW_SSH_CLIENT_ERROR: i32 = 806;
}

/// How the session reaches its target: proxied through guacd, or bridged
/// natively to an SSH shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Guacd,
    Terminal,
}

/// The one backend handle a session owns.
pub enum Backend {
    Guacd(Tunnel),
    Terminal(QuickTerminal),
}

impl Backend {
    pub fn mode(&self) -> Mode {
        match self {
            Backend::Guacd(_) => Mode::Guacd,
            Backend::Terminal(_) => Mode::Terminal,
        }
    }

    async fn close(&self) {
        match self {
            Backend::Guacd(tunnel) => tunnel.close().await,
            Backend::Terminal(term) => term.close().await,
        }
    }
}

/// One live gateway session.
pub struct Session {
    pub id: String,
    pub protocol: Protocol,
    pub client: ClientConn,
    pub backend: Backend,
    pub recorder: Option<Arc<Recorder>>,
    observers: RwLock<HashMap<String, ClientConn>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        protocol: Protocol,
        client: ClientConn,
        backend: Backend,
        recorder: Option<Arc<Recorder>>,
    ) -> Self {
        Self {
            id: id.into(),
            protocol,
            client,
            backend,
            recorder,
            observers: RwLock::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.backend.mode()
    }

    pub fn tunnel(&self) -> Option<&Tunnel> {
        match &self.backend {
            Backend::Guacd(tunnel) => Some(tunnel),
            Backend::Terminal(_) => None,
        }
    }

    pub fn terminal(&self) -> Option<&QuickTerminal> {
        match &self.backend {
            Backend::Terminal(term) => Some(term),
            Backend::Guacd(_) => None,
        }
    }

    pub async fn attach_observer(&self, id: impl Into<String>, client: ClientConn) {
        self.observers.write().await.insert(id.into(), client);
    }

    pub async fn detach_observer(&self, id: &str) {
        self.observers.write().await.remove(id);
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Best-effort fan-out of one frame to every observer. A dead observer
    /// is skipped; it never disturbs the primary or its peers.
    pub async fn broadcast(&self, frame: &str) {
        let targets: Vec<(String, ClientConn)> = {
            let observers = self.observers.read().await;
            observers
                .iter()
                .map(|(id, conn)| (id.clone(), conn.clone()))
                .collect()
        };
        for (id, conn) in targets {
            if conn.send_text(frame).await.is_err() {
                tracing::debug!(observer_id = %id, "observer gone, skipping");
            }
        }
    }
}

/// Close notification frames for one connection, in send order.
pub fn close_frames(mode: Mode, code: i32, reason: &str) -> Vec<String> {
    match mode {
        Mode::Guacd => vec![
            Instruction::new("error", vec![reason.to_owned(), code.to_string()]).encode(),
            Instruction::new("disconnect", vec![]).encode(),
        ],
        Mode::Terminal => vec![format_frame(FrameKind::Closed, reason)],
    }
}

/// Cloneable handle to the session map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session: Arc<Session>) {
        let mut map = self.inner.write().await;
        if map.insert(session.id.clone(), session).is_some() {
            tracing::warn!("replaced existing session with the same id");
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// Close a session. Returns `true` for the caller that actually tore it
    /// down; every other concurrent or repeated call gets `false`.
    pub async fn close_session(&self, id: &str, code: i32, reason: &str) -> bool {
        // The map remove decides the winner; teardown runs without the lock.
        let session = { self.inner.write().await.remove(id) };
        let Some(session) = session else {
            return false;
        };
        tracing::info!(session_id = %id, code, reason, "closing session");

        let frames = close_frames(session.mode(), code, reason);
        for frame in &frames {
            let _ = session.client.send_text(frame.clone()).await;
        }

        let observers: Vec<ClientConn> = {
            let mut map = session.observers.write().await;
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in observers {
            for frame in &frames {
                let _ = conn.send_text(frame.clone()).await;
            }
            conn.send_close().await;
        }

        session.backend.close().await;
        if let Some(recorder) = &session.recorder {
            recorder.close().await;
        }
        session.client.send_close().await;
        true
    }

    /// Close every live session; used at shutdown.
    pub async fn clear(&self, code: i32, reason: &str) {
        for id in self.ids().await {
            self.close_session(&id, code, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    async fn guacd_session(id: &str) -> (Arc<Session>, mpsc::Receiver<Message>, TcpStream) {
        let (server, client_stream) = tcp_pair().await;
        let (conn, rx) = ClientConn::channel(32);
        let session = Arc::new(Session::new(
            id,
            Protocol::Ssh,
            conn,
            Backend::Guacd(Tunnel::from_stream_unhandshaked(client_stream)),
            None,
        ));
        (session, rx, server)
    }

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_wins_once() {
        let registry = SessionRegistry::new();
        let (session, _rx, _srv) = guacd_session("ssh_1").await;
        registry.add(session).await;
        assert_eq!(registry.count().await, 1);

        assert!(registry.close_session("ssh_1", codes::NORMAL, "Exited").await);
        assert!(!registry.close_session("ssh_1", codes::NORMAL, "Exited").await);
        assert!(registry.get("ssh_1").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_close_has_a_single_winner() {
        let registry = SessionRegistry::new();
        let (session, _rx, _srv) = guacd_session("ssh_2").await;
        registry.add(session).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = registry.clone();
            handles.push(tokio::spawn(async move {
                reg.close_session("ssh_2", codes::FORCED_DISCONNECT, "Forced")
                    .await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn guacd_close_sends_error_then_disconnect_then_ws_close() {
        let registry = SessionRegistry::new();
        let (session, mut rx, _srv) = guacd_session("ssh_3").await;
        registry.add(session).await;
        registry
            .close_session("ssh_3", codes::FORCED_DISCONNECT, "Forced disconnect")
            .await;

        assert_eq!(
            text(rx.recv().await.unwrap()),
            "5.error,17.Forced disconnect,3.802;"
        );
        assert_eq!(text(rx.recv().await.unwrap()), "10.disconnect;");
        assert!(matches!(rx.recv().await.unwrap(), Message::Close(_)));
    }

    #[test]
    fn terminal_close_frame_is_reason_prefixed() {
        let frames = close_frames(Mode::Terminal, codes::NORMAL, "Exited");
        assert_eq!(frames, vec!["0Exited".to_owned()]);
    }

    #[tokio::test]
    async fn dead_observer_does_not_disturb_the_rest() {
        let (session, mut primary_rx, _srv) = guacd_session("ssh_4").await;

        let (alive, mut alive_rx) = ClientConn::channel(8);
        let (dead, dead_rx) = ClientConn::channel(8);
        drop(dead_rx);
        session.attach_observer("obs-alive", alive).await;
        session.attach_observer("obs-dead", dead).await;

        session.broadcast("2hello").await;
        assert_eq!(text(alive_rx.recv().await.unwrap()), "2hello");
        // Primary never sees fan-out traffic.
        assert!(primary_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn observers_are_notified_and_dropped_on_close() {
        let registry = SessionRegistry::new();
        let (session, _rx, _srv) = guacd_session("ssh_5").await;
        let (obs, mut obs_rx) = ClientConn::channel(8);
        session.attach_observer("obs-1", obs).await;
        registry.add(session.clone()).await;

        registry.close_session("ssh_5", codes::NORMAL, "Exited").await;
        assert_eq!(text(obs_rx.recv().await.unwrap()), "5.error,6.Exited,1.0;");
        assert_eq!(text(obs_rx.recv().await.unwrap()), "10.disconnect;");
        assert!(matches!(obs_rx.recv().await.unwrap(), Message::Close(_)));
        assert_eq!(session.observer_count().await, 0);
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let registry = SessionRegistry::new();
        let (a, _rx_a, _srv_a) = guacd_session("ssh_6").await;
        let (b, _rx_b, _srv_b) = guacd_session("rdp_7").await;
        registry.add(a).await;
        registry.add(b).await;
        registry.clear(codes::NORMAL, "Server shutting down").await;
        assert_eq!(registry.count().await, 0);
    }
}
