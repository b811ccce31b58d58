//! Raw SSH terminal backend.
//!
//! [`QuickTerminal`] owns the authenticated russh session; the interactive
//! shell channel itself is handed to the bridge pumps in [`bridge`], which
//! keep a single owner for all channel I/O. The SFTP subsystem channel used
//! by the file-management routes is opened lazily and cached.

pub mod bridge;
pub mod recorder;

pub use bridge::TermBridge;
pub use recorder::Recorder;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::util::ConnectPayload;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("private key rejected: {0}")]
    Key(#[from] russh_keys::Error),
    #[error("authentication rejected for user {0:?}")]
    AuthFailed(String),
    #[error("sftp subsystem failed: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error("connection to {0} timed out")]
    Timeout(String),
}

/// Accepts any host key. Targets are supplied ad hoc by the browser client;
/// there is no key store to pin against.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH session backing one gateway session.
pub struct QuickTerminal {
    handle: Handle<ClientHandler>,
    sftp: OnceCell<SftpSession>,
    closed: AtomicBool,
}

impl QuickTerminal {
    /// Dial and authenticate, then open the interactive shell channel with a
    /// pty of the requested geometry. The channel is returned separately so
    /// the bridge can own it outright.
    pub async fn connect(
        payload: &ConnectPayload,
        cols: u32,
        rows: u32,
        timeout: Duration,
    ) -> Result<(Self, Channel<Msg>), TerminalError> {
        let config = Arc::new(client::Config::default());
        let target = format!("{}:{}", payload.host, payload.port);

        let connecting = client::connect(
            config,
            (payload.host.as_str(), payload.port),
            ClientHandler,
        );
        let mut handle = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| TerminalError::Timeout(target))??;

        let authenticated = if payload.private_key.is_empty() {
            handle
                .authenticate_password(&payload.username, &payload.password)
                .await?
        } else {
            let passphrase = if payload.passphrase.is_empty() {
                None
            } else {
                Some(payload.passphrase.as_str())
            };
            let pair = russh_keys::decode_secret_key(&payload.private_key, passphrase)?;
            handle
                .authenticate_publickey(&payload.username, Arc::new(pair))
                .await?
        };
        if !authenticated {
            return Err(TerminalError::AuthFailed(payload.username.clone()));
        }

        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;

        Ok((
            Self {
                handle,
                sftp: OnceCell::new(),
                closed: AtomicBool::new(false),
            },
            channel,
        ))
    }

    /// SFTP session over this connection, opened on first use.
    pub async fn sftp(&self) -> Result<&SftpSession, TerminalError> {
        self.sftp
            .get_or_try_init(|| async {
                let channel = self.handle.channel_open_session().await?;
                channel.request_subsystem(true, "sftp").await?;
                Ok(SftpSession::new(channel.into_stream()).await?)
            })
            .await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Disconnect the SSH transport. First caller wins; later calls no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!(error = %err, "ssh disconnect failed");
        }
    }
}
