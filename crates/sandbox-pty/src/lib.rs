//! Terminal session multiplexer.
//!
//! One PTY-backed shell per session id, shared by any number of WebSocket
//! connections. Output is fanned out to every connection in order; input and
//! resizes from any connection go straight to the shell. The shell outlives
//! its connections and is torn down when it exits.

pub mod command;
pub mod config;
pub mod error;
pub mod line_editor;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{DecodeError, PtyError, SessionError};
pub use protocol::{ClientMessage, ServerMessage};
pub use pty::{ExitStatus, PtyProcess, SpawnOptions};
pub use registry::{IdlePolicy, RegistryConfig, SessionRegistry};
pub use session::{ConnectionId, Session, SessionInfo};
pub use transport::{router, serve, AppState};
