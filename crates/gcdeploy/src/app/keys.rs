//! Key bindings.
//!
//! Keys are translated to [`Action`]s first so the orchestrator never looks
//! at raw key codes.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Lines scrolled by PageUp/PageDown.
pub const PAGE_SCROLL: u16 = 10;

/// Which shell the command line talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellMode {
    #[default]
    Remote,
    Local,
}

impl ShellMode {
    pub fn toggle(self) -> Self {
        match self {
            ShellMode::Remote => ShellMode::Local,
            ShellMode::Local => ShellMode::Remote,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ShellMode::Remote => "REMOTE",
            ShellMode::Local => "LOCAL",
        }
    }
}

/// Vim-like editing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditMode {
    #[default]
    Insert,
    Normal,
}

impl EditMode {
    pub fn label(&self) -> &'static str {
        match self {
            EditMode::Insert => "INSERT",
            EditMode::Normal => "NORMAL",
        }
    }
}

/// What a key press asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    EnterNormal,
    EnterInsert,
    ToggleShell,
    Submit,
    Cancel,
    Interrupt,
    HistoryPrev,
    HistoryNext,
    Insert(char),
    Backspace,
    Delete,
    Left,
    Right,
    Home,
    End,
    ScrollUp(u16),
    ScrollDown(u16),
    ScrollBottom,
    None,
}

/// Maps a key press to an action. `prompting` is set while the passphrase
/// prompt owns the command line.
pub fn map_key(key: KeyEvent, mode: EditMode, prompting: bool) -> Action {
    if key.kind != KeyEventKind::Press {
        return Action::None;
    }

    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    if ctrl && key.code == KeyCode::Char('c') {
        return if prompting {
            Action::Cancel
        } else {
            Action::Interrupt
        };
    }

    if prompting {
        return match key.code {
            KeyCode::Enter => Action::Submit,
            KeyCode::Esc => Action::Cancel,
            KeyCode::Backspace => Action::Backspace,
            KeyCode::Delete => Action::Delete,
            KeyCode::Left => Action::Left,
            KeyCode::Right => Action::Right,
            KeyCode::Home => Action::Home,
            KeyCode::End => Action::End,
            KeyCode::Char(c) if !ctrl => Action::Insert(c),
            _ => Action::None,
        };
    }

    match key.code {
        KeyCode::BackTab => return Action::ToggleShell,
        KeyCode::PageUp => return Action::ScrollUp(PAGE_SCROLL),
        KeyCode::PageDown => return Action::ScrollDown(PAGE_SCROLL),
        _ => {}
    }

    match mode {
        EditMode::Insert => match key.code {
            KeyCode::Esc => Action::EnterNormal,
            KeyCode::Enter => Action::Submit,
            KeyCode::Up => Action::HistoryPrev,
            KeyCode::Down => Action::HistoryNext,
            KeyCode::Backspace => Action::Backspace,
            KeyCode::Delete => Action::Delete,
            KeyCode::Left => Action::Left,
            KeyCode::Right => Action::Right,
            KeyCode::Home => Action::Home,
            KeyCode::End => Action::End,
            KeyCode::Char(c) if !ctrl => Action::Insert(c),
            _ => Action::None,
        },
        EditMode::Normal => match key.code {
            KeyCode::Char('i') | KeyCode::Char('a') | KeyCode::Enter => Action::EnterInsert,
            KeyCode::Char('q') => Action::Quit,
            KeyCode::Char('j') | KeyCode::Down => Action::ScrollDown(1),
            KeyCode::Char('k') | KeyCode::Up => Action::ScrollUp(1),
            KeyCode::Char('G') | KeyCode::End => Action::ScrollBottom,
            _ => Action::None,
        },
    }
}
