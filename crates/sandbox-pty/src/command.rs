//! Command detection over a session's input stream.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::line_editor::{EditEvent, LineEditor};
use crate::protocol::ServerMessage;

/// A command line the user submitted to a session's shell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command: String,
    pub cwd: String,
    pub timestamp: DateTime<Utc>,
}

impl CommandRecord {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Command {
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Feeds keystrokes through a [`LineEditor`] and reports every non-blank
/// submitted line.
#[derive(Debug, Default)]
pub struct CommandDetector {
    editor: LineEditor,
}

impl CommandDetector {
    pub fn observe(&mut self, input: &str) -> Vec<String> {
        self.editor
            .feed(input)
            .into_iter()
            .filter_map(|event| match event {
                EditEvent::Submit(line) => {
                    let line = line.trim();
                    (!line.is_empty()).then(|| line.to_string())
                }
                EditEvent::Cancel => None,
            })
            .collect()
    }

    /// Partially typed line.
    pub fn pending(&self) -> String {
        self.editor.line()
    }
}
