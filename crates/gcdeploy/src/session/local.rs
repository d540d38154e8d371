//! Local command runner.
//!
//! Each submitted line runs in a fresh `$SHELL -c` process. Output from both
//! pipes is forwarded to one channel, and a single `Finished` event follows
//! once the process has exited and both pipes are drained.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::MAX_CHUNK_SIZE;

/// Identifies one local command invocation.
pub type InvocationId = u64;

/// Errors reported for a local command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocalCommandError {
    #[error("a local command is already running")]
    Busy,

    #[error("failed to start {shell}: {reason}")]
    SpawnFailed { shell: String, reason: String },

    #[error("exit status {0}")]
    NonZeroExit(i32),

    #[error("terminated by signal {0}")]
    Signaled(i32),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("cancelled")]
    Cancelled,
}

/// Events delivered to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Output {
        id: InvocationId,
        data: Vec<u8>,
    },
    Finished {
        id: InvocationId,
        result: Result<(), LocalCommandError>,
    },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: InvocationId,
    pid: Option<u32>,
}

/// Runs one local command at a time.
pub struct LocalRunner {
    shell: String,
    output: mpsc::Sender<LocalEvent>,
    cancel: CancellationToken,
    next_id: InvocationId,
    in_flight: Option<InFlight>,
}

impl LocalRunner {
    pub fn new(
        shell: impl Into<String>,
        output: mpsc::Sender<LocalEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shell: shell.into(),
            output,
            cancel,
            next_id: 1,
            in_flight: None,
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// The invocation currently running, if any.
    pub fn in_flight(&self) -> Option<InvocationId> {
        self.in_flight.map(|f| f.id)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Starts `command` and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(&mut self, command: &str) -> Result<InvocationId, LocalCommandError> {
        if self.in_flight.is_some() {
            return Err(LocalCommandError::Busy);
        }

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LocalCommandError::SpawnFailed {
                shell: self.shell.clone(),
                reason: e.to_string(),
            })?;

        let id = self.next_id;
        self.next_id += 1;
        let pid = child.id();
        self.in_flight = Some(InFlight { id, pid });

        info!(invocation = id, pid, command, "Running local command");
        tokio::spawn(supervise(id, child, self.output.clone(), self.cancel.clone()));
        Ok(id)
    }

    /// Marks `id` as finished. Called when its `Finished` event is handled.
    pub fn complete(&mut self, id: InvocationId) {
        if self.in_flight.is_some_and(|f| f.id == id) {
            self.in_flight = None;
        }
    }

    /// Sends SIGINT to the running command's process group.
    ///
    /// Returns false when nothing is running.
    pub fn interrupt(&self) -> Result<bool, LocalCommandError> {
        let Some(InFlight { id, pid: Some(pid) }) = self.in_flight else {
            return Ok(false);
        };
        let pid = i32::try_from(pid).map_err(|e| LocalCommandError::Io(e.to_string()))?;
        debug!(invocation = id, pid, "Interrupting local command");
        killpg(Pid::from_raw(pid), Signal::SIGINT)
            .map_err(|e| LocalCommandError::Io(e.to_string()))?;
        Ok(true)
    }
}

async fn supervise(
    id: InvocationId,
    mut child: Child,
    output: mpsc::Sender<LocalEvent>,
    cancel: CancellationToken,
) {
    let readers: Vec<_> = [
        child
            .stdout
            .take()
            .map(|s| tokio::spawn(forward_stream(id, s, output.clone(), cancel.clone()))),
        child
            .stderr
            .take()
            .map(|s| tokio::spawn(forward_stream(id, s, output.clone(), cancel.clone()))),
    ]
    .into_iter()
    .flatten()
    .collect();

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| LocalCommandError::Io(e.to_string())),
        _ = cancel.cancelled() => {
            kill_group(id, &mut child);
            if let Err(e) = child.wait().await {
                debug!(invocation = id, error = %e, "Failed to reap local command");
            }
            Err(LocalCommandError::Cancelled)
        }
    };

    for reader in readers {
        if let Err(e) = reader.await {
            warn!(invocation = id, error = %e, "Output reader failed");
        }
    }

    let result = status.and_then(|status| {
        if status.success() {
            Ok(())
        } else if let Some(code) = status.code() {
            Err(LocalCommandError::NonZeroExit(code))
        } else {
            Err(LocalCommandError::Signaled(status.signal().unwrap_or_default()))
        }
    });

    match &result {
        Ok(()) => debug!(invocation = id, "Local command finished"),
        Err(e) => info!(invocation = id, error = %e, "Local command failed"),
    }
    if output.send(LocalEvent::Finished { id, result }).await.is_err() {
        debug!(invocation = id, "Local output channel closed");
    }
}

/// Kills every process the command started, not just the shell.
fn kill_group(id: InvocationId, child: &mut Child) {
    let group = child.id().and_then(|pid| i32::try_from(pid).ok());
    let result = match group {
        Some(pid) => killpg(Pid::from_raw(pid), Signal::SIGKILL).map_err(|e| e.to_string()),
        None => child.start_kill().map_err(|e| e.to_string()),
    };
    if let Err(e) = result {
        debug!(invocation = id, error = %e, "Failed to kill local command");
    }
}

async fn forward_stream<R: AsyncRead + Unpin>(
    id: InvocationId,
    mut reader: R,
    output: mpsc::Sender<LocalEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(invocation = id, error = %e, "Local read error");
                    break;
                }
            },
        };

        let event = LocalEvent::Output {
            id,
            data: buf[..n].to_vec(),
        };
        if output.send(event).await.is_err() {
            break;
        }
    }
}
