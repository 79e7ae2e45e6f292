//! Session id → live session, with spawn-on-first-attach.
//!
//! All membership changes go through one map-level lock; PTY I/O never
//! takes it. Lock order is always map, then a session's subscriber set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Instant};

use crate::error::SessionError;
use crate::protocol::{ServerMessage, Utf8Decoder};
use crate::pty::{ExitStatus, PtyEvents, PtyProcess, SpawnOptions};
use crate::session::{ConnectionId, ConnectionSender, Session, SessionInfo};

/// How long to keep forwarding output after the child has been reaped.
const EXIT_DRAIN: Duration = Duration::from_millis(100);
/// Grace between hangup and SIGKILL for an idle-evicted shell.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// What happens to a session nobody is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Keep the shell until it exits on its own.
    #[default]
    Never,
    /// Hang up the shell once it has had no connections for this long.
    After(Duration),
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub spawn: SpawnOptions,
    pub idle: IdlePolicy,
    pub detect_commands: bool,
}

#[derive(Debug)]
struct Inner {
    config: RegistryConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    spawned: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                spawned: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Join `session_id`, spawning its shell if there is none.
    ///
    /// Concurrent attaches for the same unseen id spawn exactly one shell.
    /// On success `ready` is already queued on `sender`, ahead of any output.
    pub async fn attach(
        &self,
        session_id: &str,
        connection: ConnectionId,
        sender: ConnectionSender,
    ) -> Result<Arc<Session>, SessionError> {
        // The map lock is held until the subscriber is recorded: an exiting
        // session leaves the map before it closes, so none can join late.
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(existing) = sessions.get(session_id).cloned() {
            if existing.subscribe(connection, sender.clone()).await {
                drop(sessions);
                tracing::debug!(session = %session_id, %connection, pid = existing.pid(), "connection attached");
                return Ok(existing);
            }
            tracing::warn!(session = %session_id, pid = existing.pid(), "replacing closed session");
            sessions.remove(session_id);
        }

        let session = self.spawn_session(session_id)?;
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        if !session.subscribe(connection, sender).await {
            sessions.remove(session_id);
            return Err(SessionError::Closed {
                session_id: session_id.to_string(),
            });
        }
        drop(sessions);

        tracing::debug!(session = %session_id, %connection, pid = session.pid(), "connection attached");
        Ok(session)
    }

    /// Leave `session_id`. The shell keeps running. Detaching twice is a no-op.
    pub async fn detach(&self, session_id: &str, connection: ConnectionId) {
        let Some(session) = self.get(session_id).await else {
            return;
        };
        let membership = session.unsubscribe(connection).await;
        if membership.removed {
            tracing::debug!(session = %session_id, %connection, remaining = membership.remaining, "connection detached");
        }
        // The broadcaster may already have dropped a dead peer, so arm on
        // an empty set even when this call removed nothing.
        if membership.remaining == 0 {
            self.arm_idle_timer(&session, membership.epoch);
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Status snapshot of every live session, ordered by id.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Total shells spawned over the registry's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawned.load(Ordering::Relaxed)
    }

    /// Hang up every shell. Their exits still reach attached connections.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            tracing::info!(session = %session.id(), pid = session.pid(), "killing pty session");
            session.pty().kill();
        }
    }

    fn spawn_session(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        let (pty, events) =
            PtyProcess::spawn(&self.inner.config.spawn).map_err(|source| SessionError::Spawn {
                session_id: session_id.to_string(),
                source,
            })?;
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);

        let session = Arc::new(Session::new(
            session_id.to_string(),
            pty,
            self.inner.config.detect_commands,
        ));
        tracing::info!(session = %session_id, pid = session.pid(), shell = %session.pty().shell().display(), "created pty session");

        tokio::spawn(pump(self.clone(), Arc::clone(&session), events));
        Ok(session)
    }

    /// Remove `session` if it is still the registered instance, then send
    /// `exit` to its subscribers and close them.
    async fn on_exit(&self, session: &Arc<Session>, status: ExitStatus) {
        {
            let mut sessions = self.inner.sessions.lock().await;
            if sessions
                .get(session.id())
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(session.id());
            }
        }
        let execution_time = session.pty().uptime().as_millis() as u64;
        tracing::info!(
            session = %session.id(),
            pid = session.pid(),
            code = status.code,
            signal = ?status.signal,
            execution_time_ms = execution_time,
            "pty process exited"
        );
        session
            .close(ServerMessage::Exit {
                code: status.code,
                signal: status.signal,
                execution_time: Some(execution_time),
            })
            .await;
    }

    fn arm_idle_timer(&self, session: &Arc<Session>, epoch: u64) {
        let IdlePolicy::After(grace) = self.inner.config.idle else {
            return;
        };
        let registry = self.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            time::sleep(grace).await;
            {
                // Same lock as `attach`: nobody can join between the idle
                // check and the eviction.
                let mut sessions = registry.inner.sessions.lock().await;
                let current = sessions
                    .get(session.id())
                    .is_some_and(|current| Arc::ptr_eq(current, &session));
                if !current || !session.idle_since(epoch).await {
                    return;
                }
                sessions.remove(session.id());
                tracing::info!(session = %session.id(), idle_ms = grace.as_millis() as u64, "evicting idle session");
                session.pty().kill();
            }
            time::sleep(KILL_GRACE).await;
            if !session.pty().has_exited() {
                tracing::warn!(session = %session.id(), "idle shell ignored hangup, killing");
                session.pty().force_kill();
            }
        });
    }
}

/// Per-session output pump: the only producer of `data` frames, so every
/// subscriber sees chunks in PTY order. Ends with the exit broadcast.
async fn pump(registry: SessionRegistry, session: Arc<Session>, events: PtyEvents) {
    let PtyEvents { mut output, mut exit } = events;
    let mut decoder = Utf8Decoder::default();

    let status = loop {
        tokio::select! {
            // Exit first: a background job that keeps printing must not
            // hold back the exit report.
            biased;
            status = &mut exit => {
                drain_after_exit(&session, &mut decoder, &mut output).await;
                break status.unwrap_or(ExitStatus::UNKNOWN);
            }
            chunk = output.recv() => match chunk {
                Some(bytes) => forward(&session, &mut decoder, &bytes).await,
                None => break (&mut exit).await.unwrap_or(ExitStatus::UNKNOWN),
            },
        }
    };

    let tail = decoder.finish();
    if !tail.is_empty() {
        session.broadcast(ServerMessage::data(tail)).await;
    }
    registry.on_exit(&session, status).await;
}

/// Forward output still in flight when the child was reaped, up to a fixed
/// deadline. A job holding the slave open may keep printing forever.
async fn drain_after_exit(
    session: &Session,
    decoder: &mut Utf8Decoder,
    output: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let deadline = Instant::now() + EXIT_DRAIN;
    while let Ok(Some(bytes)) = time::timeout_at(deadline, output.recv()).await {
        forward(session, decoder, &bytes).await;
    }
}

async fn forward(session: &Session, decoder: &mut Utf8Decoder, bytes: &[u8]) {
    let text = decoder.decode(bytes);
    if !text.is_empty() {
        session.broadcast(ServerMessage::data(text)).await;
    }
}
