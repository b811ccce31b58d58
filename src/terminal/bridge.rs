//! Pumps between the SSH shell channel and the browser WebSocket.
//!
//! Two tasks per session, tied together by one cancellation token:
//!
//! - the *channel pump* owns the russh channel outright. It decodes backend
//!   bytes into code points and forwards them to the flush pump, and it
//!   services inbound commands (keystrokes, resize, keepalive) so all channel
//!   I/O has a single owner.
//! - the *flush pump* buffers decoded output and, on every flush tick,
//!   sends the whole buffer as exactly one Data frame, feeds the recorder,
//!   and fans the frame out to observers.
//!
//! Invalid byte sequences from the backend are replaced with a `@`
//! placeholder so one bad byte cannot corrupt the client's decoder state.
//! Output still buffered when the session is torn down is discarded.

use std::sync::Arc;
use std::time::Duration;

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Recorder;
use crate::sessions::{codes, SessionRegistry};
use crate::ws::{format_frame, ClientConn, FrameKind};

/// Placeholder emitted for each undecodable byte sequence.
const INVALID_PLACEHOLDER: char = '@';

/// Default coalescing window; overridable via `[terminal] flush_interval_ms`.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(60);

/// One decoded unit of backend output.
#[derive(Debug, PartialEq, Eq)]
pub enum TermUnit {
    Rune(char),
    Invalid,
}

/// Incremental UTF-8 decoder. Multibyte sequences split across reads are
/// held back until complete; definitively invalid sequences come out as
/// [`TermUnit::Invalid`].
#[derive(Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<TermUnit> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.extend(valid.chars().map(TermUnit::Rune));
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending[..valid_len]) {
                        out.extend(valid.chars().map(TermUnit::Rune));
                    }
                    match err.error_len() {
                        Some(bad) => {
                            out.push(TermUnit::Invalid);
                            self.pending.drain(..valid_len + bad);
                        }
                        None => {
                            // Incomplete tail; keep it for the next read.
                            self.pending.drain(..valid_len);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

/// Inbound commands serviced by the channel pump.
#[derive(Debug)]
pub enum TermCommand {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Keepalive,
}

/// Handle to a running bridge. Command submission fails (returns `false`)
/// once the bridge has shut down.
pub struct TermBridge {
    cmd_tx: mpsc::Sender<TermCommand>,
    cancel: CancellationToken,
}

impl TermBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        session_id: String,
        channel: Channel<Msg>,
        cols: u32,
        rows: u32,
        registry: SessionRegistry,
        client: ClientConn,
        recorder: Option<Arc<Recorder>>,
        flush_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (data_tx, data_rx) = mpsc::channel(256);

        tokio::spawn(channel_pump(
            session_id.clone(),
            channel,
            cols,
            rows,
            cmd_rx,
            data_tx,
            registry.clone(),
            client.clone(),
            cancel.clone(),
        ));
        tokio::spawn(flush_pump(
            session_id,
            data_rx,
            registry,
            client,
            recorder,
            cancel.clone(),
            flush_interval,
        ));

        Self { cmd_tx, cancel }
    }

    pub async fn write(&self, bytes: Vec<u8>) -> bool {
        self.cmd_tx.send(TermCommand::Data(bytes)).await.is_ok()
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> bool {
        self.cmd_tx
            .send(TermCommand::Resize { cols, rows })
            .await
            .is_ok()
    }

    pub async fn keepalive(&self) -> bool {
        self.cmd_tx.send(TermCommand::Keepalive).await.is_ok()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

enum PumpEvent {
    Cancelled,
    Command(Option<TermCommand>),
    Channel(Option<ChannelMsg>),
}

#[allow(clippy::too_many_arguments)]
async fn channel_pump(
    session_id: String,
    mut channel: Channel<Msg>,
    mut cols: u32,
    mut rows: u32,
    mut cmd_rx: mpsc::Receiver<TermCommand>,
    data_tx: mpsc::Sender<Vec<TermUnit>>,
    registry: SessionRegistry,
    client: ClientConn,
    cancel: CancellationToken,
) {
    let mut decoder = Utf8Decoder::default();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => PumpEvent::Cancelled,
            cmd = cmd_rx.recv() => PumpEvent::Command(cmd),
            msg = channel.wait() => PumpEvent::Channel(msg),
        };
        match event {
            PumpEvent::Cancelled | PumpEvent::Command(None) => break,
            PumpEvent::Command(Some(TermCommand::Data(bytes))) => {
                if channel.data(&bytes[..]).await.is_err() {
                    registry
                        .close_session(&session_id, codes::TUNNEL_CLOSED, "Remote connection closed")
                        .await;
                    break;
                }
            }
            PumpEvent::Command(Some(TermCommand::Resize { cols: c, rows: r })) => {
                cols = c;
                rows = r;
                // Resize failures are not fatal; the shell keeps running.
                if let Err(err) = channel.window_change(cols, rows, 0, 0).await {
                    tracing::debug!(session_id = %session_id, error = %err, "window change failed");
                }
            }
            PumpEvent::Command(Some(TermCommand::Keepalive)) => {
                // Zero-delta window change: proves the transport is alive
                // without disturbing the shell.
                if channel.window_change(cols, rows, 0, 0).await.is_err() {
                    registry
                        .close_session(&session_id, codes::TUNNEL_CLOSED, "Remote connection closed")
                        .await;
                    break;
                }
                let _ = client.send_text(format_frame(FrameKind::Ping, "")).await;
            }
            PumpEvent::Channel(Some(ChannelMsg::Data { data })) => {
                let units = decoder.push(&data);
                if !units.is_empty() && data_tx.send(units).await.is_err() {
                    break;
                }
            }
            PumpEvent::Channel(Some(ChannelMsg::ExtendedData { data, .. })) => {
                let units = decoder.push(&data);
                if !units.is_empty() && data_tx.send(units).await.is_err() {
                    break;
                }
            }
            PumpEvent::Channel(Some(ChannelMsg::ExitStatus { exit_status })) => {
                tracing::debug!(session_id = %session_id, exit_status, "shell exited");
            }
            PumpEvent::Channel(Some(ChannelMsg::Eof | ChannelMsg::Close) | None) => {
                registry
                    .close_session(&session_id, codes::NORMAL, "Exited")
                    .await;
                break;
            }
            PumpEvent::Channel(Some(_)) => {}
        }
    }
    cancel.cancel();
}

async fn flush_pump(
    session_id: String,
    mut data_rx: mpsc::Receiver<Vec<TermUnit>>,
    registry: SessionRegistry,
    client: ClientConn,
    recorder: Option<Arc<Recorder>>,
    cancel: CancellationToken,
    flush_interval: Duration,
) {
    let mut buf = String::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            units = data_rx.recv() => match units {
                Some(units) => {
                    for unit in units {
                        match unit {
                            TermUnit::Rune(c) => buf.push(c),
                            TermUnit::Invalid => buf.push(INVALID_PLACEHOLDER),
                        }
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if buf.is_empty() {
                    continue;
                }
                let chunk = std::mem::take(&mut buf);
                let frame = format_frame(FrameKind::Data, &chunk);
                if client.send_text(frame.clone()).await.is_err() {
                    registry
                        .close_session(&session_id, codes::NORMAL, "Exited")
                        .await;
                    break;
                }
                if let Some(rec) = &recorder {
                    rec.write(&chunk).await;
                }
                if let Some(session) = registry.get(&session_id).await {
                    session.broadcast(&frame).await;
                }
            }
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runes(units: &[TermUnit]) -> String {
        units
            .iter()
            .map(|u| match u {
                TermUnit::Rune(c) => *c,
                TermUnit::Invalid => INVALID_PLACEHOLDER,
            })
            .collect()
    }

    #[test]
    fn decoder_passes_ascii_through() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(runes(&dec.push(b"hello")), "hello");
    }

    #[test]
    fn decoder_replaces_invalid_bytes_in_place() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(runes(&dec.push(b"ab\xffcd")), "ab@cd");
        // Orphaned continuation byte.
        assert_eq!(runes(&dec.push(b"\x80x")), "@x");
    }

    #[test]
    fn decoder_holds_split_multibyte_sequences() {
        let mut dec = Utf8Decoder::default();
        let euro = "€".as_bytes(); // e2 82 ac
        assert_eq!(runes(&dec.push(&euro[..1])), "");
        assert_eq!(runes(&dec.push(&euro[1..2])), "");
        assert_eq!(runes(&dec.push(&euro[2..])), "€");
    }

    #[test]
    fn decoder_flushes_valid_prefix_before_invalid() {
        let mut dec = Utf8Decoder::default();
        // Truncated 3-byte sequence followed by ascii: the two lead bytes
        // are definitively invalid once 'x' arrives.
        assert_eq!(runes(&dec.push(b"ok\xe2\x82")), "ok");
        assert_eq!(runes(&dec.push(b"x")), "@x");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_coalesces_one_frame_per_tick() {
        let registry = SessionRegistry::new();
        let (client, mut rx) = ClientConn::channel(16);
        let (data_tx, data_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(flush_pump(
            "ssh_t".to_owned(),
            data_rx,
            registry,
            client,
            None,
            cancel.clone(),
            Duration::from_millis(60),
        ));

        // Several writes inside one window come out as a single Data frame.
        data_tx
            .send(vec![TermUnit::Rune('a'), TermUnit::Rune('b')])
            .await
            .unwrap();
        data_tx.send(vec![TermUnit::Invalid]).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.into_text().unwrap().as_str(), "2ab@");

        data_tx.send(vec![TermUnit::Rune('c')]).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.into_text().unwrap().as_str(), "2c");
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_unflushed_output() {
        let registry = SessionRegistry::new();
        let (client, mut rx) = ClientConn::channel(16);
        let (data_tx, data_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(flush_pump(
            "ssh_t".to_owned(),
            data_rx,
            registry,
            client.clone(),
            None,
            cancel.clone(),
            Duration::from_millis(60),
        ));

        data_tx.send(vec![TermUnit::Rune('x')]).await.unwrap();
        cancel.cancel();
        pump.await.unwrap();
        drop(client);
        assert!(rx.recv().await.is_none(), "buffered output must be dropped");
    }
}
