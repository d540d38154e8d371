//! Content buffers shown by the panes.
//!
//! Both buffers are written only by the control loop. Rendering borrows them
//! immutably.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;

use crate::ui::wrap;

/// Maximum number of entries kept in the log pane.
pub const LOG_CAPACITY: usize = 500;

/// Append-only text accumulated from a byte stream.
///
/// Bytes are decoded as UTF-8. A multi-byte sequence split across two chunks
/// is held back until the rest of it arrives.
#[derive(Debug, Default, Clone)]
pub struct ContentBuffer {
    text: String,
    pending: Vec<u8>,
    revision: u64,
    view: RefCell<WrappedView>,
}

/// Wrapped lines for one pane width.
///
/// Newline-terminated text is wrapped once and kept; only the unterminated
/// tail is wrapped again on each frame.
#[derive(Debug, Default, Clone)]
struct WrappedView {
    width: u16,
    /// Byte offset in `text` up to which `lines` is built.
    committed: usize,
    lines: Vec<String>,
    max_scroll: usize,
}

impl ContentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from a stream.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.pending.extend_from_slice(bytes);

        let mut consumed = 0;
        while consumed < self.pending.len() {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(s) => {
                    self.text.push_str(s);
                    consumed = self.pending.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text.push_str(&String::from_utf8_lossy(
                        &self.pending[consumed..consumed + valid],
                    ));
                    consumed += valid;
                    match e.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            consumed += len;
                        }
                        // incomplete sequence at the end, wait for more bytes
                        None => break,
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        self.revision += 1;
    }

    /// Appends text followed by a newline, starting a new line first if the
    /// buffer does not end with one.
    pub fn push_line(&mut self, line: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.text.push('\n');
        self.revision += 1;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Incremented on every change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The wrapped lines a pane `width` columns wide and `height` rows tall
    /// shows when scrolled `scroll` lines up from the bottom.
    ///
    /// `scroll` is clamped so the pane never scrolls past the first line.
    pub fn visible_lines(&self, width: u16, height: u16, scroll: u16) -> Vec<String> {
        let mut view = self.view.borrow_mut();
        if view.width != width {
            *view = WrappedView {
                width,
                ..WrappedView::default()
            };
        }

        let end = self.text.rfind('\n').map_or(0, |i| i + 1);
        if end > view.committed {
            let start = view.committed;
            for line in self.text[start..end].split_inclusive('\n') {
                let wrapped = wrap::wrap_lines(line, width);
                if wrapped.is_empty() {
                    view.lines.push(String::new());
                } else {
                    view.lines.extend(wrapped);
                }
            }
            view.committed = end;
        }
        let tail = wrap::wrap_lines(&self.text[end..], width);

        let total = view.lines.len() + tail.len();
        let visible = usize::from(height);
        view.max_scroll = total.saturating_sub(visible);

        let bottom = total - usize::from(scroll).min(view.max_scroll);
        let top = bottom.saturating_sub(visible);
        view.lines
            .iter()
            .chain(tail.iter())
            .skip(top)
            .take(bottom - top)
            .cloned()
            .collect()
    }

    /// Furthest scroll offset as of the last [`visible_lines`] call.
    ///
    /// [`visible_lines`]: ContentBuffer::visible_lines
    pub fn max_scroll(&self) -> u16 {
        u16::try_from(self.view.borrow().max_scroll).unwrap_or(u16::MAX)
    }
}

/// Severity tag of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Error,
    Step,
    Debug,
}

impl LogLevel {
    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Info => "[INFO]",
            LogLevel::Success => "[SUCCESS]",
            LogLevel::Error => "[ERROR]",
            LogLevel::Step => "[STEP]",
            LogLevel::Debug => "[DEBUG]",
        }
    }
}

/// One line in the log pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level.tag(), self.message)
    }
}

/// Bounded operator log. The oldest entries fall off the front.
///
/// Every entry is also emitted through `tracing`. Debug entries only reach
/// the pane when `show_debug` is set.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    show_debug: bool,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_CAPACITY, false)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize, show_debug: bool) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(LOG_CAPACITY)),
            capacity: capacity.max(1),
            show_debug,
        }
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!(target: "gcdeploy::log", "{}", message),
            LogLevel::Debug => tracing::debug!(target: "gcdeploy::log", "{}", message),
            _ => tracing::info!(target: "gcdeploy::log", tag = level.tag(), "{}", message),
        }

        if level == LogLevel::Debug && !self.show_debug {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry { level, message });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Success, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    pub fn step(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Step, message);
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Debug, message);
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Whether any entry's message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }
}
