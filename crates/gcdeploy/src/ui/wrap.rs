//! Terminal text normalization and line wrapping.
//!
//! Shell output carries escape sequences and carriage returns meant for a
//! real terminal. The panes are plain text, so sequences are stripped and
//! lines are wrapped on word boundaries. Words are never broken, which keeps
//! long URLs intact and clickable.

use std::sync::LazyLock;

use regex::Regex;

/// CSI sequences, OSC sequences (BEL or ST terminated) and two-byte escapes.
static ANSI_ESCAPE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").ok()
});

const TAB: &str = "    ";

/// Strips escape sequences and normalizes line endings.
///
/// `\r\n` and bare `\r` become `\n`; tabs become four spaces; other control
/// characters are dropped.
pub fn normalize(text: &str) -> String {
    let stripped = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, ""),
        None => text.into(),
    };

    let mut out = String::with_capacity(stripped.len());
    let mut chars = stripped.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            '\n' => out.push('\n'),
            '\t' => out.push_str(TAB),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// Normalizes `text` and wraps it to `width` columns.
///
/// A trailing newline does not produce an empty last line.
pub fn wrap_lines(text: &str, width: u16) -> Vec<String> {
    let width = usize::from(width.max(1));
    let normalized = normalize(text);
    let body = normalized.strip_suffix('\n').unwrap_or(&normalized);
    if body.is_empty() {
        return Vec::new();
    }

    let options = textwrap::Options::new(width)
        .break_words(false)
        .word_separator(textwrap::WordSeparator::AsciiSpace)
        .word_splitter(textwrap::WordSplitter::NoHyphenation);
    let mut lines = Vec::new();
    for line in body.split('\n') {
        if line.is_empty() {
            lines.push(String::new());
            continue;
        }
        lines.extend(
            textwrap::wrap(line, &options)
                .into_iter()
                .map(|l| l.into_owned()),
        );
    }
    lines
}
