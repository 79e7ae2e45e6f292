//! Line assembly from raw terminal keystrokes.
//!
//! Tracks what the user is typing at the prompt: insertion at a cursor,
//! backspace/delete, the usual readline control keys, arrow-key cursor
//! movement and history recall. Purely local state; it never writes to the
//! terminal.

const MAX_HISTORY: usize = 1000;
/// Longest CSI parameter run kept; longer sequences are discarded.
const MAX_CSI_PARAMS: usize = 32;

/// Result of feeding keystrokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditEvent {
    /// Enter was pressed; carries the line as edited.
    Submit(String),
    /// Ctrl-C discarded the line.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Escape {
    Ground,
    Esc,
    /// `ESC [` plus parameter bytes seen so far.
    Csi(String),
    /// CSI whose parameters exceeded the cap; skipped up to its final byte.
    CsiOverflow,
    /// `ESC O`
    Ss3,
}

#[derive(Debug, Clone)]
pub struct LineEditor {
    buffer: Vec<char>,
    cursor: usize,
    history: Vec<String>,
    /// Index into `history` while browsing it.
    browsing: Option<usize>,
    /// Line being edited before history browsing started.
    draft: Vec<char>,
    escape: Escape,
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new()
    }
}

impl LineEditor {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            history: Vec::new(),
            browsing: None,
            draft: Vec::new(),
            escape: Escape::Ground,
        }
    }

    pub fn line(&self) -> String {
        self.buffer.iter().collect()
    }

    /// Cursor position in characters.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Feed raw input. Escape sequences may be split across calls.
    pub fn feed(&mut self, input: &str) -> Vec<EditEvent> {
        let mut events = Vec::new();
        for ch in input.chars() {
            if let Some(event) = self.key(ch) {
                events.push(event);
            }
        }
        events
    }

    fn key(&mut self, ch: char) -> Option<EditEvent> {
        match std::mem::replace(&mut self.escape, Escape::Ground) {
            Escape::Ground => {}
            Escape::Esc => {
                match ch {
                    '[' => self.escape = Escape::Csi(String::new()),
                    'O' => self.escape = Escape::Ss3,
                    'b' => self.word_left(),
                    'f' => self.word_right(),
                    _ => {}
                }
                return None;
            }
            Escape::Csi(mut params) => {
                if is_csi_param(ch) {
                    self.escape = if params.len() < MAX_CSI_PARAMS {
                        params.push(ch);
                        Escape::Csi(params)
                    } else {
                        Escape::CsiOverflow
                    };
                } else {
                    self.csi(&params, ch);
                }
                return None;
            }
            Escape::CsiOverflow => {
                if is_csi_param(ch) {
                    self.escape = Escape::CsiOverflow;
                }
                return None;
            }
            Escape::Ss3 => {
                self.csi("", ch);
                return None;
            }
        }

        match ch {
            '\r' | '\n' => return Some(self.submit()),
            '\x03' => {
                self.clear();
                return Some(EditEvent::Cancel);
            }
            '\x1b' => self.escape = Escape::Esc,
            '\x7f' | '\x08' => self.backspace(),
            '\x04' => self.delete(),
            '\x01' => self.cursor = 0,
            '\x05' => self.cursor = self.buffer.len(),
            '\x02' => self.left(),
            '\x06' => self.right(),
            '\x0b' => self.buffer.truncate(self.cursor),
            '\x15' => {
                self.buffer.drain(..self.cursor);
                self.cursor = 0;
            }
            '\x17' => self.delete_word_back(),
            '\x10' => self.history_prev(),
            '\x0e' => self.history_next(),
            c if c.is_control() => {}
            c => {
                self.buffer.insert(self.cursor, c);
                self.cursor += 1;
            }
        }
        None
    }

    fn csi(&mut self, params: &str, final_byte: char) {
        match (params, final_byte) {
            (_, 'A') => self.history_prev(),
            (_, 'B') => self.history_next(),
            ("1;5" | "1;3", 'C') => self.word_right(),
            ("1;5" | "1;3", 'D') => self.word_left(),
            (_, 'C') => self.right(),
            (_, 'D') => self.left(),
            (_, 'H') | ("1" | "7", '~') => self.cursor = 0,
            (_, 'F') | ("4" | "8", '~') => self.cursor = self.buffer.len(),
            ("3", '~') => self.delete(),
            _ => {}
        }
    }

    fn submit(&mut self) -> EditEvent {
        let line = self.line();
        if !line.trim().is_empty() && self.history.last() != Some(&line) {
            self.history.push(line.clone());
            if self.history.len() > MAX_HISTORY {
                self.history.remove(0);
            }
        }
        self.clear();
        EditEvent::Submit(line)
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.browsing = None;
        self.draft.clear();
    }

    fn left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    fn right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.buffer.len());
    }

    fn word_left(&mut self) {
        while self.cursor > 0 && self.buffer[self.cursor - 1].is_whitespace() {
            self.cursor -= 1;
        }
        while self.cursor > 0 && !self.buffer[self.cursor - 1].is_whitespace() {
            self.cursor -= 1;
        }
    }

    fn word_right(&mut self) {
        let len = self.buffer.len();
        while self.cursor < len && self.buffer[self.cursor].is_whitespace() {
            self.cursor += 1;
        }
        while self.cursor < len && !self.buffer[self.cursor].is_whitespace() {
            self.cursor += 1;
        }
    }

    fn backspace(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            self.buffer.remove(self.cursor);
        }
    }

    fn delete(&mut self) {
        if self.cursor < self.buffer.len() {
            self.buffer.remove(self.cursor);
        }
    }

    fn delete_word_back(&mut self) {
        let end = self.cursor;
        self.word_left();
        self.buffer.drain(self.cursor..end);
    }

    fn history_prev(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let index = match self.browsing {
            None => {
                self.draft = std::mem::take(&mut self.buffer);
                self.history.len() - 1
            }
            Some(i) => i.saturating_sub(1),
        };
        self.load_history(index);
    }

    fn history_next(&mut self) {
        let Some(i) = self.browsing else {
            return;
        };
        if i + 1 < self.history.len() {
            self.load_history(i + 1);
        } else {
            self.browsing = None;
            self.buffer = std::mem::take(&mut self.draft);
            self.cursor = self.buffer.len();
        }
    }

    fn load_history(&mut self, index: usize) {
        self.browsing = Some(index);
        self.buffer = self.history[index].chars().collect();
        self.cursor = self.buffer.len();
    }
}

fn is_csi_param(ch: char) -> bool {
    ('\x20'..='\x3f').contains(&ch)
}
