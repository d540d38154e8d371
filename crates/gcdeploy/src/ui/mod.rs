//! Terminal user interface.
//!
//! This module renders the orchestrator state with ratatui and drives the
//! control loop from terminal input.

pub mod render;
pub mod tui;
pub mod wrap;

// Re-export main types for convenience
pub use render::{draw, layout, remote_pty_size, FrameLayout, LOCAL_COLOR, REMOTE_COLOR};
pub use tui::{run, Tui};
