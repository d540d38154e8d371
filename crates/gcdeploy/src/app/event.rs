//! Events handled by the control loop.

use crossterm::event::KeyEvent;

use crate::session::{ConnectError, Connected};

/// Everything the control loop reacts to besides stream output.
///
/// Stream output arrives on its own bounded channels and is drained on each
/// tick; these events come from the terminal and from timer and connection
/// tasks the orchestrator spawns.
#[derive(Debug)]
pub enum AppEvent {
    /// A key press from the terminal.
    Key(KeyEvent),
    /// New remote PTY size, already computed from the pane layout.
    Resize { cols: u16, rows: u16 },
    /// A connection attempt finished.
    Connected(Box<Result<Connected, ConnectError>>),
    /// The remote shell has had time to print its prompt.
    ShellReady,
    /// The settle delay after remote step `index` elapsed.
    RemoteStepSettled { index: usize },
    /// Stop the orchestrator.
    Quit,
}

/// Remote connection lifecycle, for the status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingPassphrase,
    Connected,
    Failed(String),
    Closed,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingPassphrase => "passphrase required",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed(_) => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}
