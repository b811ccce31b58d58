//! TCP tunnel to the guacd daemon.
//!
//! [`Tunnel::open`] dials guacd and walks the connection handshake:
//! `select` → `args` → `size`/`audio`/`video`/`image` → `connect` → `ready`.
//! After that the tunnel is a plain relay: [`Tunnel::read`] yields one raw
//! framed instruction at a time and [`Tunnel::write_and_flush`] forwards
//! client bytes verbatim. Read and write halves are locked independently so
//! the relay pump and the WebSocket loop never serialize against each other.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::instruction::{frame_length, FramingError, Instruction};
use super::{params, Configuration, VERSION};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("guacd i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("guacd framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("guacd refused the connection: {message} (code {code})")]
    Backend { message: String, code: String },
    #[error("guacd handshake violation: expected {expected:?}, got {got:?}")]
    Protocol { expected: &'static str, got: String },
    #[error("tunnel is closed")]
    Closed,
}

#[derive(Debug)]
struct TunnelReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl TunnelReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    async fn fill(&mut self) -> Result<(), ConnectError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.half.read(&mut chunk).await?;
        if n == 0 {
            return Err(ConnectError::Closed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn read_instruction(&mut self) -> Result<Instruction, ConnectError> {
        loop {
            if let Some((ins, used)) = Instruction::decode(&self.buf)? {
                self.buf.advance(used);
                return Ok(ins);
            }
            self.fill().await?;
        }
    }

    /// One whole framed instruction, undecoded. The relay path forwards
    /// these bytes to the browser as-is.
    async fn read_frame(&mut self) -> Result<Bytes, ConnectError> {
        loop {
            if let Some(len) = frame_length(&self.buf)? {
                return Ok(self.buf.split_to(len).freeze());
            }
            self.fill().await?;
        }
    }
}

/// An established guacd connection.
#[derive(Debug)]
pub struct Tunnel {
    connection_id: String,
    reader: Mutex<TunnelReader>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Dial guacd at `addr` and perform the full handshake for `config`.
    pub async fn open(addr: &str, config: &Configuration) -> Result<Self, ConnectError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = TunnelReader::new(read_half);
        let mut writer = write_half;

        send(
            &mut writer,
            &Instruction::new("select", vec![config.protocol.as_str().to_owned()]),
        )
        .await?;

        let args = expect(&mut reader, "args").await?;

        send(
            &mut writer,
            &Instruction::new(
                "size",
                vec![
                    config.get(params::WIDTH).to_owned(),
                    config.get(params::HEIGHT).to_owned(),
                    config.get(params::DPI).to_owned(),
                ],
            ),
        )
        .await?;
        send(&mut writer, &Instruction::new("audio", vec![])).await?;
        send(&mut writer, &Instruction::new("video", vec![])).await?;
        send(&mut writer, &Instruction::new("image", vec![])).await?;

        // guacd advertises its protocol version as args[0], then the argument
        // names it wants values for, in order. Unknown names get "".
        let mut connect_args = vec![VERSION.to_owned()];
        for name in args.args.iter().skip(1) {
            connect_args.push(lookup_parameter(config, name));
        }
        send(&mut writer, &Instruction::new("connect", connect_args)).await?;

        let ready = expect(&mut reader, "ready").await?;
        let connection_id = ready.arg(0).to_owned();
        tracing::debug!(connection_id = %connection_id, "guacd tunnel established");

        Ok(Self {
            connection_id,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        })
    }

    /// The connection id guacd assigned during the handshake.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Read one raw framed instruction from guacd.
    pub async fn read(&self) -> Result<Bytes, ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::Closed);
        }
        self.reader.lock().await.read_frame().await
    }

    /// Forward client bytes to guacd.
    pub async fn write_and_flush(&self, data: &[u8]) -> Result<(), ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the tunnel. Safe to call from several tasks; only the first
    /// call shuts the socket down, later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(error = %err, "guacd socket shutdown failed");
        }
    }

    /// Wrap an already-connected stream without a handshake. Lets the
    /// session registry tests drive teardown against a plain socket pair.
    #[cfg(test)]
    pub(crate) fn from_stream_unhandshaked(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            connection_id: String::new(),
            reader: Mutex::new(TunnelReader::new(read_half)),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, ins: &Instruction) -> Result<(), ConnectError> {
    writer.write_all(ins.encode().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next instruction and require `expected`. An `error` instruction
/// from guacd aborts with the backend's own message and status code.
async fn expect(reader: &mut TunnelReader, expected: &'static str) -> Result<Instruction, ConnectError> {
    let ins = reader.read_instruction().await?;
    if ins.opcode == "error" {
        return Err(ConnectError::Backend {
            message: ins.arg(0).to_owned(),
            code: ins.arg(1).to_owned(),
        });
    }
    if ins.opcode != expected {
        return Err(ConnectError::Protocol {
            expected,
            got: ins.opcode,
        });
    }
    Ok(ins)
}

/// Find the configuration value for a guacd-advertised argument name.
/// Names are matched with `-`/`_` stripped and case folded, since guacd
/// versions disagree on separators.
fn lookup_parameter(config: &Configuration, name: &str) -> String {
    let wanted = normalize(name);
    config
        .parameters
        .iter()
        .find(|(k, _)| normalize(k) == wanted)
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guacamole::Protocol;
    use tokio::net::TcpListener;

    async fn read_ins(stream: &mut TcpStream, buf: &mut BytesMut) -> Instruction {
        loop {
            if let Some((ins, used)) = Instruction::decode(buf).unwrap() {
                buf.advance(used);
                return ins;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer hung up mid-instruction");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_ins(stream: &mut TcpStream, ins: &Instruction) {
        stream.write_all(ins.encode().as_bytes()).await.unwrap();
    }

    fn ssh_config() -> Configuration {
        let mut cfg = Configuration::new(Protocol::Ssh);
        cfg.set(params::HOSTNAME, "10.0.0.5");
        cfg.set(params::PORT, "22");
        cfg.set(params::USERNAME, "alice");
        cfg.set(params::WIDTH, "1024");
        cfg.set(params::HEIGHT, "768");
        cfg.set(params::DPI, "96");
        cfg
    }

    /// Scripted guacd: walks the handshake and hands back the raw stream.
    async fn fake_guacd(listener: TcpListener) -> (TcpStream, BytesMut) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();

        let select = read_ins(&mut stream, &mut buf).await;
        assert_eq!(select.opcode, "select");
        assert_eq!(select.arg(0), "ssh");

        write_ins(
            &mut stream,
            &Instruction::new(
                "args",
                vec![
                    VERSION.to_owned(),
                    "hostname".to_owned(),
                    "port".to_owned(),
                    "username".to_owned(),
                    "color_scheme".to_owned(),
                ],
            ),
        )
        .await;

        for expected in ["size", "audio", "video", "image"] {
            let ins = read_ins(&mut stream, &mut buf).await;
            assert_eq!(ins.opcode, expected);
        }

        let connect = read_ins(&mut stream, &mut buf).await;
        assert_eq!(connect.opcode, "connect");
        assert_eq!(connect.arg(0), VERSION);
        assert_eq!(connect.arg(1), "10.0.0.5");
        assert_eq!(connect.arg(2), "22");
        assert_eq!(connect.arg(3), "alice");

        write_ins(&mut stream, &Instruction::new("ready", vec!["$c0".to_owned()])).await;
        (stream, buf)
    }

    #[tokio::test]
    async fn handshake_negotiates_and_retains_connection_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(fake_guacd(listener));

        let mut cfg = ssh_config();
        // Separator-insensitive match: guacd asked for "color_scheme".
        cfg.set(params::COLOR_SCHEME, "gray-black");
        let tunnel = Tunnel::open(&addr, &cfg).await.unwrap();
        assert_eq!(tunnel.connection_id(), "$c0");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_error_carries_backend_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let _ = read_ins(&mut stream, &mut buf).await;
            write_ins(
                &mut stream,
                &Instruction::new("error", vec!["no such protocol".to_owned(), "519".to_owned()]),
            )
            .await;
        });

        match Tunnel::open(&addr, &ssh_config()).await {
            Err(ConnectError::Backend { message, code }) => {
                assert_eq!(message, "no such protocol");
                assert_eq!(code, "519");
            }
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_reads_one_frame_at_a_time() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = fake_guacd(listener).await;
            // Two instructions in one TCP segment.
            let blob = format!(
                "{}{}",
                Instruction::new("sync", vec!["42".to_owned()]).encode(),
                Instruction::new("nop", vec![]).encode()
            );
            stream.write_all(blob.as_bytes()).await.unwrap();
            stream
        });

        let tunnel = Tunnel::open(&addr, &ssh_config()).await.unwrap();
        let first = tunnel.read().await.unwrap();
        assert_eq!(&first[..], b"4.sync,2.42;");
        let second = tunnel.read().await.unwrap();
        assert_eq!(&second[..], b"3.nop;");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(fake_guacd(listener));

        let tunnel = Tunnel::open(&addr, &ssh_config()).await.unwrap();
        tunnel.close().await;
        tunnel.close().await;
        assert!(tunnel.is_closed());
        assert!(matches!(
            tunnel.write_and_flush(b"3.nop;").await,
            Err(ConnectError::Closed)
        ));
        drop(server.await.unwrap());
    }
}
