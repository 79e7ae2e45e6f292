//! Error types shared across the multiplexer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the PTY layer.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("shell not found or not executable: {0}")]
    ShellNotFound(String),

    #[error("working directory is not a directory: {}", .0.display())]
    InvalidCwd(PathBuf),

    #[error("argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("forkpty failed: {0}")]
    Fork(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures raised while attaching a connection to a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn shell for session {session_id}: {source}")]
    Spawn {
        session_id: String,
        #[source]
        source: PtyError,
    },

    #[error("session {session_id} closed before the connection could join")]
    Closed { session_id: String },
}

/// Inbound frame that could not be turned into a control message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has no \"type\" field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownKind(String),
}
