//! A live shell and the connections watching it.
//!
//! `Session` owns the [`PtyProcess`] and the subscriber set used for
//! fan-out. Subscribers are unbounded senders, so delivery never waits on a
//! slow peer; a send that fails means the peer is gone and it is dropped
//! from the set on the spot.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::command::{CommandDetector, CommandRecord};
use crate::protocol::ServerMessage;
use crate::pty::PtyProcess;

/// Outbound half of a connection as seen by the broadcaster.
pub type ConnectionSender = mpsc::UnboundedSender<Arc<ServerMessage>>;
pub type ConnectionReceiver = mpsc::UnboundedReceiver<Arc<ServerMessage>>;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Subscriber set state after a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Membership {
    /// False when the connection was already gone.
    pub removed: bool,
    pub remaining: usize,
    pub epoch: u64,
}

#[derive(Debug, Default)]
struct Subscribers {
    senders: HashMap<ConnectionId, ConnectionSender>,
    /// Set once `exit` has gone out; no further subscribers are accepted.
    closed: bool,
    /// Bumped on every membership change.
    epoch: u64,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub pid: u32,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_command: Option<CommandRecord>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    pty: PtyProcess,
    created_at: DateTime<Utc>,
    subscribers: Mutex<Subscribers>,
    detector: Option<Mutex<CommandDetector>>,
    last_command: Mutex<Option<CommandRecord>>,
}

impl Session {
    pub(crate) fn new(id: String, pty: PtyProcess, detect_commands: bool) -> Self {
        Self {
            id,
            pty,
            created_at: Utc::now(),
            subscribers: Mutex::new(Subscribers::default()),
            detector: detect_commands.then(|| Mutex::new(CommandDetector::default())),
            last_command: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pty(&self) -> &PtyProcess {
        &self.pty
    }

    pub fn pid(&self) -> u32 {
        self.pty.pid()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn connection_count(&self) -> usize {
        self.subscribers.lock().await.senders.len()
    }

    pub async fn last_command(&self) -> Option<CommandRecord> {
        self.last_command.lock().await.clone()
    }

    pub async fn info(&self) -> SessionInfo {
        let (cols, rows) = self.pty.size();
        SessionInfo {
            id: self.id.clone(),
            pid: self.pid(),
            shell: self.pty.shell().display().to_string(),
            cwd: self.pty.current_dir().display().to_string(),
            cols,
            rows,
            created_at: self.created_at,
            connections: self.connection_count().await,
            last_command: self.last_command().await,
        }
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Queue `ready` to the new subscriber and add it to the set. Returns
    /// false if the session already shut down.
    pub(crate) async fn subscribe(&self, connection: ConnectionId, sender: ConnectionSender) -> bool {
        let mut subs = self.subscribers.lock().await;
        if subs.closed {
            return false;
        }
        if sender.send(Arc::new(ServerMessage::Ready)).is_err() {
            return true;
        }
        subs.senders.insert(connection, sender);
        subs.epoch += 1;
        true
    }

    /// Remove a subscriber, reporting what is left either way.
    pub(crate) async fn unsubscribe(&self, connection: ConnectionId) -> Membership {
        let mut subs = self.subscribers.lock().await;
        let removed = subs.senders.remove(&connection).is_some();
        if removed {
            subs.epoch += 1;
        }
        Membership {
            removed,
            remaining: subs.senders.len(),
            epoch: subs.epoch,
        }
    }

    /// True while nobody has joined or left since `epoch` and the set is empty.
    pub(crate) async fn idle_since(&self, epoch: u64) -> bool {
        let subs = self.subscribers.lock().await;
        !subs.closed && subs.senders.is_empty() && subs.epoch == epoch
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    /// Deliver `message` to every subscriber. Peers whose receiver is gone
    /// are detached.
    pub async fn broadcast(&self, message: ServerMessage) {
        let mut subs = self.subscribers.lock().await;
        if subs.closed {
            return;
        }
        deliver(&self.id, &mut subs, Arc::new(message));
    }

    /// Send a final message, then drop every sender so the connections close.
    pub(crate) async fn close(&self, last: ServerMessage) {
        let mut subs = self.subscribers.lock().await;
        if subs.closed {
            return;
        }
        deliver(&self.id, &mut subs, Arc::new(last));
        subs.closed = true;
        subs.senders.clear();
        subs.epoch += 1;
    }

    // ── Input ───────────────────────────────────────────────────────

    /// Forward keystrokes to the shell. Errors are logged, never raised.
    pub async fn write(&self, data: &str) {
        if let Err(err) = self.pty.write(data.as_bytes()).await {
            tracing::warn!(session = %self.id, error = %err, "pty write failed");
        }
        if let Some(detector) = &self.detector {
            let commands = detector.lock().await.observe(data);
            for command in commands {
                self.record_command(command).await;
            }
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        match self.pty.resize(cols, rows) {
            Ok(()) => tracing::debug!(session = %self.id, cols, rows, "resized pty"),
            Err(err) => tracing::warn!(session = %self.id, cols, rows, error = %err, "pty resize failed"),
        }
    }

    async fn record_command(&self, command: String) {
        let record = CommandRecord {
            command,
            cwd: self.pty.current_dir().display().to_string(),
            timestamp: Utc::now(),
        };
        tracing::info!(
            target: "sandbox_pty::command",
            session = %self.id,
            command = %record.command,
            cwd = %record.cwd,
            "command submitted"
        );
        self.broadcast(record.to_message()).await;
        *self.last_command.lock().await = Some(record);
    }
}

fn deliver(session_id: &str, subs: &mut Subscribers, message: Arc<ServerMessage>) {
    let before = subs.senders.len();
    subs.senders.retain(|connection, sender| {
        let alive = sender.send(Arc::clone(&message)).is_ok();
        if !alive {
            tracing::debug!(session = %session_id, %connection, "dropping dead subscriber");
        }
        alive
    });
    if subs.senders.len() != before {
        subs.epoch += 1;
    }
}
