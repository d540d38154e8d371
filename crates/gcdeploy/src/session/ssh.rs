//! SSH transport for the remote shell.

use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::ssh_key::HashAlg;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, Pty};
use tracing::{debug, info};

use super::remote::{ChannelEvent, SessionError, ShellChannel, DEFAULT_COLS, DEFAULT_ROWS};
use super::ConnectError;
use crate::credentials::AuthHandle;
use crate::resolver::ConnectionEndpoint;

/// Terminal type requested for the remote pseudo-terminal.
const TERM: &str = "xterm-256color";

/// Terminal speed advertised in the PTY modes.
const TERMINAL_SPEED: u32 = 14400;

/// Transport settings for [`open_shell`].
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub port: u16,
    pub connect_timeout: Duration,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout: Duration::from_secs(15),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Accepts every host key and logs its fingerprint.
struct HostKeyLogger {
    host: String,
}

impl client::Handler for HostKeyLogger {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        info!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "Accepting host key"
        );
        Ok(true)
    }
}

/// An interactive shell channel on an SSH connection.
pub struct SshChannel {
    handle: client::Handle<HostKeyLogger>,
    channel: russh::Channel<client::Msg>,
}

impl ShellChannel for SshChannel {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, SessionError> {
        loop {
            let Some(msg) = self.channel.wait().await else {
                return Ok(None);
            };
            match msg {
                ChannelMsg::Data { ref data } => {
                    return Ok(Some(ChannelEvent::Stdout(data.to_vec())));
                }
                ChannelMsg::ExtendedData { ref data, .. } => {
                    return Ok(Some(ChannelEvent::Stderr(data.to_vec())));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Ok(Some(ChannelEvent::ExitStatus(exit_status)));
                }
                ChannelMsg::Eof => return Ok(Some(ChannelEvent::Eof)),
                ChannelMsg::Close => return Ok(None),
                other => debug!(?other, "Ignoring channel message"),
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        self.channel.data(data).await?;
        Ok(data.len())
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.channel
            .window_change(u32::from(cols), u32::from(rows), 0, 0)
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.eof().await {
            debug!(error = %e, "Failed to send EOF");
        }
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Failed to close channel");
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(error = %e, "Failed to disconnect");
        }
    }
}

/// Connects to `endpoint`, authenticates with `auth`, allocates a PTY and
/// starts an interactive shell.
pub async fn open_shell(
    endpoint: &ConnectionEndpoint,
    auth: &AuthHandle,
    options: &SshOptions,
) -> Result<SshChannel, ConnectError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    });

    let address = format!("{}:{}", endpoint.address, options.port);
    info!(address = %address, user = %endpoint.login_user, "Connecting");

    let handler = HostKeyLogger {
        host: endpoint.address.clone(),
    };
    let connect = client::connect(config, (endpoint.address.as_str(), options.port), handler);
    let mut handle = tokio::time::timeout(options.connect_timeout, connect)
        .await
        .map_err(|_| ConnectError::Timeout(address.clone()))?
        .map_err(|source| ConnectError::Dial {
            address: address.clone(),
            source,
        })?;

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(ConnectError::Channel)?
        .flatten();
    let auth_result = handle
        .authenticate_publickey(
            endpoint.login_user.clone(),
            PrivateKeyWithHashAlg::new(auth.key(), hash_alg),
        )
        .await
        .map_err(ConnectError::Channel)?;

    if !auth_result.success() {
        return Err(ConnectError::AuthRejected {
            user: endpoint.login_user.clone(),
            address,
        });
    }
    debug!(fingerprint = %auth.fingerprint(), "Authenticated");

    let channel = handle
        .channel_open_session()
        .await
        .map_err(ConnectError::Channel)?;
    channel
        .request_pty(
            false,
            TERM,
            u32::from(options.cols),
            u32::from(options.rows),
            0,
            0,
            &[
                (Pty::ECHO, 1),
                (Pty::TTY_OP_ISPEED, TERMINAL_SPEED),
                (Pty::TTY_OP_OSPEED, TERMINAL_SPEED),
            ],
        )
        .await
        .map_err(ConnectError::Channel)?;
    channel
        .request_shell(false)
        .await
        .map_err(ConnectError::Channel)?;

    info!(address = %address, "Remote shell started");
    Ok(SshChannel { handle, channel })
}
