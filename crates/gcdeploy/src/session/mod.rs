//! Remote and local execution targets.
//!
//! This module provides:
//! - Remote shell sessions over SSH, driven by a pump task
//! - The local command runner
//! - The bounded output queue both feed into
//! - [`Connector`], the seam the orchestrator uses to open a remote session

pub mod local;
pub mod queue;
pub mod remote;
pub mod ssh;

pub use local::{InvocationId, LocalCommandError, LocalEvent, LocalRunner};
pub use queue::{OutputQueue, QueueStats};
pub use remote::{ChannelEvent, RemoteEvent, RemoteSession, SessionError, ShellChannel};
pub use ssh::{open_shell, SshChannel, SshOptions};

use std::future::Future;
use std::path::PathBuf;

use secrecy::SecretString;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::credentials::{self, CredentialError};
use crate::resolver::{ConnectionEndpoint, ConnectionResolver, InstanceDescriptor, ResolveError};

/// Errors that prevent a remote session from starting.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to get instance details: {0}")]
    Resolve(#[from] ResolveError),

    #[error("failed to load SSH key: {0}")]
    Credentials(#[from] CredentialError),

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: russh::Error,
    },

    #[error("authentication rejected for {user}@{address}")]
    AuthRejected { user: String, address: String },

    #[error("failed to open terminal session: {0}")]
    Channel(#[source] russh::Error),

    #[error("connection task failed: {0}")]
    Task(String),
}

impl ConnectError {
    /// Whether the operator should be asked for a key passphrase.
    pub fn needs_passphrase(&self) -> bool {
        matches!(self, ConnectError::Credentials(e) if e.needs_passphrase())
    }
}

/// A freshly opened remote session.
pub struct Connected {
    pub session: RemoteSession,
    pub endpoint: ConnectionEndpoint,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Opens the remote session for the orchestrator.
///
/// Every call is a fresh attempt: the endpoint is resolved again and the key
/// is loaded with `passphrase`.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        passphrase: SecretString,
        output: OutputQueue<RemoteEvent>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Connected, ConnectError>> + Send;
}

/// Resolves the instance, loads the key and opens an SSH shell.
pub struct SshConnector<R> {
    resolver: R,
    instance: InstanceDescriptor,
    key_path: PathBuf,
    options: SshOptions,
}

impl<R: ConnectionResolver> SshConnector<R> {
    pub fn new(
        resolver: R,
        instance: InstanceDescriptor,
        key_path: PathBuf,
        options: SshOptions,
    ) -> Self {
        Self {
            resolver,
            instance,
            key_path,
            options,
        }
    }
}

impl<R: ConnectionResolver + 'static> Connector for SshConnector<R> {
    async fn connect(
        &self,
        passphrase: SecretString,
        output: OutputQueue<RemoteEvent>,
        cancel: CancellationToken,
    ) -> Result<Connected, ConnectError> {
        let endpoint = self.resolver.resolve(&self.instance).await?;
        info!(
            instance = %endpoint.name,
            address = %endpoint.address,
            status = %endpoint.status,
            "Resolved instance"
        );

        // Key decryption is CPU bound.
        let key_path = self.key_path.clone();
        let auth = tokio::task::spawn_blocking(move || credentials::load(&key_path, &passphrase))
            .await
            .map_err(|e| ConnectError::Task(e.to_string()))??;

        let channel = open_shell(&endpoint, &auth, &self.options).await?;
        let session = RemoteSession::attach(channel, output, cancel);
        Ok(Connected { session, endpoint })
    }
}
