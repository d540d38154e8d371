//! # gcdeploy
//!
//! Dual-shell session orchestrator for Compute Engine instances.
//!
//! ## Overview
//!
//! gcdeploy opens a persistent interactive shell on a remote instance while
//! keeping a local shell available next to it, and can drive an ordered list
//! of deployment steps across both before handing control back to the
//! operator.
//!
//! - **Credential loading**: SSH keys, with encrypted keys prompting for a passphrase
//! - **Address resolution**: `gcloud` lookup of the instance's external address
//! - **Remote session**: SSH pseudo-terminal driven by a background pump
//! - **Local runner**: one `$SHELL -c` process per command
//! - **Deployment sequencer**: strictly ordered steps with failure propagation
//! - **User interface**: side-by-side panes in a ratatui TUI
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                App (single-threaded control loop)         │
//! │   local buffer     remote buffer     log     sequencer    │
//! └─────────▲──────────────────▲──────────────────────────────┘
//!           │ bounded channel  │ bounded, lossy queue
//! ┌─────────┴────────┐  ┌──────┴───────────────────────────────┐
//! │   LocalRunner    │  │  RemoteSession pump ── ShellChannel   │
//! │  stdout/stderr   │  │                         (SSH)         │
//! └──────────────────┘  └──────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: `.gcd.toml` discovery, loading and validation
//! - [`credentials`]: Private key loading
//! - [`resolver`]: Instance address lookup
//! - [`session`]: Remote session, SSH transport, local runner
//! - [`deploy`]: Deployment plan and sequencer
//! - [`app`]: The orchestrator state and control loop
//! - [`ui`]: Rendering and terminal handling

pub mod app;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod resolver;
pub mod session;
pub mod ui;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export credential types for convenience
pub use credentials::{AuthHandle, CredentialError};

// Re-export resolver types for convenience
pub use resolver::{
    ConfiguredResolver, ConnectionEndpoint, ConnectionResolver, GcloudResolver,
    InstanceDescriptor, ResolveError, StaticResolver,
};

// Re-export session types for convenience
pub use session::{
    ConnectError, Connected, Connector, LocalCommandError, LocalEvent, LocalRunner, RemoteEvent,
    RemoteSession, SessionError, ShellChannel, SshConnector,
};

// Re-export deployment types for convenience
pub use deploy::{
    DeploymentCursor, DeploymentPlan, DeploymentStep, Dispatch, Sequencer, SequencerError,
    SequencerState, Target,
};

// Re-export orchestrator types for convenience
pub use app::{App, AppEvent, AppSettings, ConnectionState};
