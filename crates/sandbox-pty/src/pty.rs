//! One child shell attached to a pseudo-terminal.
//!
//! `PtyProcess::spawn` forks the child with `forkpty`, then exposes the
//! master side as an ordered output channel plus a one-shot exit
//! notification. Writes and resizes go straight to the master fd.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::PtyError;

const READ_CHUNK: usize = 64 * 1024;
const TERM: &str = "xterm-256color";
const DEFAULT_LANG: &str = "en_US.UTF-8";
const FALLBACK_SHELL: &str = "/bin/bash";

// ── Spawn options ───────────────────────────────────────────────────

/// Everything needed to start a shell.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Applied on top of the inherited environment, after the forced terminal variables.
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            args: Vec::new(),
            cwd: default_cwd(),
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }
}

impl SpawnOptions {
    /// Inherited environment with the terminal variables forced.
    fn environment(&self, shell: &Path) -> BTreeMap<OsString, OsString> {
        let mut env: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
        env.insert("TERM".into(), TERM.into());
        env.insert("SHELL".into(), shell.as_os_str().to_owned());
        env.entry("LANG".into()).or_insert_with(|| DEFAULT_LANG.into());
        if let Some(home) = std::env::var_os("HOME") {
            env.insert("HOME".into(), home);
        }
        for (key, value) in &self.env {
            env.insert(key.into(), value.into());
        }
        env
    }
}

/// `$SHELL`, or bash when unset.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// `$HOME`, then the server's current directory, then `/`.
pub fn default_cwd() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Locate `program` either as a path or on `$PATH`.
fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn cstring(value: &OsStr) -> Result<CString, PtyError> {
    CString::new(value.as_bytes())
        .map_err(|_| PtyError::InvalidArgument(value.to_string_lossy().into_owned()))
}

// ── Exit status ─────────────────────────────────────────────────────

/// How the child terminated. Signal deaths report `code = 128 + signo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub(crate) const UNKNOWN: Self = Self {
        code: -1,
        signal: None,
    };

    fn from_wait(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self { code, signal: None },
            WaitStatus::Signaled(_, sig, _) => Self {
                code: 128 + sig as i32,
                signal: Some(sig as i32),
            },
            _ => Self::UNKNOWN,
        }
    }
}

/// Block until `pid` terminates.
fn reap(pid: Pid) -> ExitStatus {
    loop {
        match waitpid(pid, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return ExitStatus::from_wait(status)
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(err) => {
                tracing::warn!(pid = pid.as_raw(), error = %err, "waitpid failed");
                return ExitStatus::UNKNOWN;
            }
        }
    }
}

// ── Process handle ──────────────────────────────────────────────────

/// Receiving half of a spawned PTY.
#[derive(Debug)]
pub struct PtyEvents {
    /// Output chunks in the order the master produced them. Closes on EOF.
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Fires once when the child has been reaped.
    pub exit: oneshot::Receiver<ExitStatus>,
}

#[derive(Debug)]
pub struct PtyProcess {
    pid: Pid,
    master: Arc<AsyncFd<OwnedFd>>,
    exited: Arc<AtomicBool>,
    /// `cols << 16 | rows`
    size: AtomicU32,
    write_lock: Mutex<()>,
    shell: PathBuf,
    cwd: PathBuf,
    started: Instant,
    reader: JoinHandle<()>,
}

impl PtyProcess {
    /// Fork a shell on a new PTY. Must be called inside a tokio runtime.
    ///
    /// This is the one blocking call in the crate: the fork/exec cost is paid
    /// once per session.
    pub fn spawn(options: &SpawnOptions) -> Result<(Self, PtyEvents), PtyError> {
        let shell = resolve_program(&options.shell)
            .ok_or_else(|| PtyError::ShellNotFound(options.shell.clone()))?;
        if !options.cwd.is_dir() {
            return Err(PtyError::InvalidCwd(options.cwd.clone()));
        }

        // The child may only run async-signal-safe code, so every buffer it
        // touches is built here.
        let c_shell = cstring(shell.as_os_str())?;
        let c_cwd = cstring(options.cwd.as_os_str())?;
        let mut argv = vec![c_shell.clone()];
        for arg in &options.args {
            argv.push(cstring(OsStr::new(arg))?);
        }
        let mut envp = Vec::new();
        for (key, value) in options.environment(&shell) {
            if key.is_empty() || key.as_bytes().contains(&b'=') {
                continue;
            }
            let mut pair = key;
            pair.push("=");
            pair.push(value);
            envp.push(cstring(&pair)?);
        }
        let argv_ptrs: Vec<*const libc::c_char> = argv
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs: Vec<*const libc::c_char> = envp
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let winsize = Winsize {
            ws_row: options.rows,
            ws_col: options.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: the child branch calls only chdir, signal, execve and _exit
        // on pointers prepared above.
        let (master, pid) = match unsafe { forkpty(Some(&winsize), None::<&nix::sys::termios::Termios>)? } {
            ForkptyResult::Parent { child, master } => (master, child),
            ForkptyResult::Child => unsafe {
                libc::chdir(c_cwd.as_ptr());
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                libc::execve(c_shell.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                libc::_exit(127);
            },
        };

        let master = match register_master(master) {
            Ok(fd) => Arc::new(fd),
            Err(err) => {
                let _ = kill(pid, Signal::SIGKILL);
                tokio::task::spawn_blocking(move || reap(pid));
                return Err(err.into());
            }
        };

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_output(Arc::clone(&master), output_tx));
        tokio::spawn(wait_for_exit(pid, Arc::clone(&exited), exit_tx));

        tracing::debug!(pid = pid.as_raw(), shell = %shell.display(), cwd = %options.cwd.display(), "spawned pty");

        let process = Self {
            pid,
            master,
            exited,
            size: AtomicU32::new(pack_size(options.cols, options.rows)),
            write_lock: Mutex::new(()),
            shell,
            cwd: options.cwd.clone(),
            started: Instant::now(),
            reader,
        };
        Ok((
            process,
            PtyEvents {
                output: output_rx,
                exit: exit_rx,
            },
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Current `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        unpack_size(self.size.load(Ordering::Relaxed))
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// The shell's live working directory where the OS exposes it,
    /// otherwise the directory it was started in.
    pub fn current_dir(&self) -> PathBuf {
        #[cfg(target_os = "linux")]
        if let Ok(dir) = std::fs::read_link(format!("/proc/{}/cwd", self.pid)) {
            return dir;
        }
        self.cwd.clone()
    }

    /// Write raw bytes to the shell's input. A no-op once the child is gone.
    ///
    /// Waits for the master to become writable without blocking the runtime;
    /// one call's bytes are never interleaved with another call's.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let _serial = self.write_lock.lock().await;
        let mut remaining = data;
        while !remaining.is_empty() {
            if self.has_exited() {
                return Ok(());
            }
            let mut guard = self.master.writable().await?;
            match guard.try_io(|fd| unistd::write(fd.get_ref(), remaining).map_err(io::Error::from)) {
                Ok(Ok(n)) => remaining = &remaining[n..],
                // Slave side already closed: the exit notification is on its way.
                Ok(Err(err)) if err.raw_os_error() == Some(libc::EIO) => return Ok(()),
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Set the window size. A no-op once the child is gone.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads a winsize through a valid pointer on an fd we own.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.size.store(pack_size(cols, rows), Ordering::Relaxed);
        Ok(())
    }

    /// Hang up the shell, as closing a real terminal would.
    pub fn kill(&self) {
        self.signal(Signal::SIGHUP);
    }

    /// SIGKILL, for shells that ignore a hangup.
    pub fn force_kill(&self) {
        self.signal(Signal::SIGKILL);
    }

    fn signal(&self, signal: Signal) {
        if self.has_exited() {
            return;
        }
        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                tracing::warn!(pid = self.pid.as_raw(), %signal, error = %err, "failed to signal pty child")
            }
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // The reaper thread only returns once the child is gone.
        self.signal(Signal::SIGKILL);
        self.reader.abort();
    }
}

fn register_master(master: OwnedFd) -> io::Result<AsyncFd<OwnedFd>> {
    let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
    AsyncFd::new(master)
}

fn pack_size(cols: u16, rows: u16) -> u32 {
    (u32::from(cols) << 16) | u32::from(rows)
}

fn unpack_size(packed: u32) -> (u16, u16) {
    ((packed >> 16) as u16, packed as u16)
}

// ── Background tasks ────────────────────────────────────────────────

async fn read_output(master: Arc<AsyncFd<OwnedFd>>, output: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(_) => break,
        };
        match guard.try_io(|fd| unistd::read(fd.get_ref().as_raw_fd(), &mut buf).map_err(io::Error::from)) {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if output.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            // Linux reports a closed slave as EIO rather than EOF.
            Ok(Err(err)) if err.raw_os_error() == Some(libc::EIO) => break,
            Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "pty read failed");
                break;
            }
            Err(_would_block) => continue,
        }
    }
}

async fn wait_for_exit(pid: Pid, exited: Arc<AtomicBool>, notify: oneshot::Sender<ExitStatus>) {
    let status = tokio::task::spawn_blocking(move || reap(pid))
        .await
        .unwrap_or(ExitStatus::UNKNOWN);
    exited.store(true, Ordering::Release);
    let _ = notify.send(status);
}
