//! Command line editing and history.

/// Single-line text input with a cursor.
///
/// The cursor is a char index, so multi-byte input edits correctly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InputLine {
    text: String,
    cursor: usize,
}

impl InputLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Replaces the contents and moves the cursor to the end.
    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.cursor = self.text.chars().count();
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.cursor = 0;
    }

    /// Returns the contents and clears the line.
    pub fn take(&mut self) -> String {
        self.cursor = 0;
        std::mem::take(&mut self.text)
    }

    pub fn insert(&mut self, c: char) {
        let at = self.byte_index(self.cursor);
        self.text.insert(at, c);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.cursor -= 1;
        let at = self.byte_index(self.cursor);
        self.text.remove(at);
    }

    pub fn delete(&mut self) {
        if self.cursor >= self.text.chars().count() {
            return;
        }
        let at = self.byte_index(self.cursor);
        self.text.remove(at);
    }

    pub fn left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.text.chars().count());
    }

    pub fn home(&mut self) {
        self.cursor = 0;
    }

    pub fn end(&mut self) {
        self.cursor = self.text.chars().count();
    }

    /// Text to display, with every character replaced by `*` when masked.
    pub fn display(&self, masked: bool) -> String {
        if masked {
            "*".repeat(self.text.chars().count())
        } else {
            self.text.clone()
        }
    }

    fn byte_index(&self, char_index: usize) -> usize {
        self.text
            .char_indices()
            .nth(char_index)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len())
    }
}

/// Submitted command history, walked with Up/Down.
#[derive(Debug, Default, Clone)]
pub struct History {
    entries: Vec<String>,
    position: Option<usize>,
    draft: String,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a submitted line. Blank lines and immediate repeats are skipped.
    pub fn push(&mut self, entry: &str) {
        self.position = None;
        self.draft.clear();
        if entry.trim().is_empty() || self.entries.last().is_some_and(|last| last == entry) {
            return;
        }
        self.entries.push(entry.to_string());
    }

    /// Moves to the previous (older) entry. `current` is kept as the draft
    /// when leaving the bottom of the history.
    pub fn prev(&mut self, current: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let next = match self.position {
            None => {
                self.draft = current.to_string();
                self.entries.len() - 1
            }
            Some(0) => 0,
            Some(i) => i - 1,
        };
        self.position = Some(next);
        self.entries.get(next).map(String::as_str)
    }

    /// Moves to the next (newer) entry, returning to the draft at the end.
    pub fn next(&mut self) -> Option<&str> {
        let i = self.position?;
        if i + 1 < self.entries.len() {
            self.position = Some(i + 1);
            self.entries.get(i + 1).map(String::as_str)
        } else {
            self.position = None;
            Some(self.draft.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_edit() {
        let mut line = InputLine::new();
        for c in "lss".chars() {
            line.insert(c);
        }
        line.backspace();
        assert_eq!(line.as_str(), "ls");

        line.home();
        line.insert('#');
        assert_eq!(line.as_str(), "#ls");
        assert_eq!(line.cursor(), 1);

        line.delete();
        assert_eq!(line.as_str(), "#s");

        line.end();
        line.right();
        assert_eq!(line.cursor(), 2);
        line.left();
        line.left();
        line.left();
        assert_eq!(line.cursor(), 0);
        line.backspace();
        assert_eq!(line.as_str(), "#s");
    }

    #[test]
    fn test_multibyte_editing() {
        let mut line = InputLine::new();
        line.set("héllo");
        assert_eq!(line.cursor(), 5);
        line.left();
        line.left();
        line.left();
        line.backspace();
        assert_eq!(line.as_str(), "hllo");
    }

    #[test]
    fn test_take_clears() {
        let mut line = InputLine::new();
        line.set("echo hi");
        assert_eq!(line.take(), "echo hi");
        assert!(line.is_empty());
        assert_eq!(line.cursor(), 0);
    }

    #[test]
    fn test_masked_display() {
        let mut line = InputLine::new();
        line.set("sécret");
        assert_eq!(line.display(true), "******");
        assert_eq!(line.display(false), "sécret");
    }

    #[test]
    fn test_history_walk() {
        let mut history = History::new();
        history.push("ls");
        history.push("pwd");
        history.push("pwd");
        history.push("   ");
        assert_eq!(history.len(), 2);

        assert_eq!(history.prev("draft"), Some("pwd"));
        assert_eq!(history.prev("ignored"), Some("ls"));
        assert_eq!(history.prev("ignored"), Some("ls"));
        assert_eq!(history.next(), Some("pwd"));
        assert_eq!(history.next(), Some("draft"));
        assert_eq!(history.next(), None);
    }

    #[test]
    fn test_history_empty() {
        let mut history = History::new();
        assert_eq!(history.prev("x"), None);
        assert_eq!(history.next(), None);
    }
}
