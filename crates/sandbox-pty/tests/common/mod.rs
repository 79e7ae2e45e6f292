//! Reusable harness for sandbox-pty integration tests.
//!
//! Starts the router in-process on an ephemeral port and drives it with a
//! real WebSocket client speaking the JSON control protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sandbox_pty::{AppState, RegistryConfig, ServerMessage, SessionRegistry, SpawnOptions};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(10);

// ── TestServer ──────────────────────────────────────────────────────

/// In-process server. Aborted on drop; shells die with their sessions.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: SessionRegistry,
    pub home: TempDir,
    task: JoinHandle<std::io::Result<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub async fn connect(&self, session_id: &str) -> WsClient {
        connect(&self.ws_url(&format!("/api/terminal/websocket?sessionId={session_id}"))).await
    }

    /// Plain HTTP GET; returns the response body.
    pub async fn get(&self, path: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.expect("connect");
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.addr
        );
        stream.write_all(request.as_bytes()).await.expect("write request");
        let mut response = String::new();
        timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .expect("response timed out")
            .expect("read response");
        let (head, body) = response.split_once("\r\n\r\n").expect("http response");
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");
        body.to_string()
    }
}

/// Spawn options for a quiet `/bin/sh` in a scratch directory.
pub fn sh_options(home: &TempDir) -> SpawnOptions {
    SpawnOptions {
        shell: "/bin/sh".to_string(),
        cwd: home.path().to_path_buf(),
        env: vec![("PS1".to_string(), "$ ".to_string())],
        ..SpawnOptions::default()
    }
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(|_| {}).await
}

/// Start a server after letting the caller adjust the registry config.
pub async fn spawn_server_with(configure: impl FnOnce(&mut RegistryConfig)) -> TestServer {
    let home = tempfile::tempdir().expect("tempdir");
    let mut config = RegistryConfig {
        spawn: sh_options(&home),
        ..RegistryConfig::default()
    };
    configure(&mut config);

    let registry = SessionRegistry::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(sandbox_pty::serve(
        listener,
        AppState::new(registry.clone()),
        std::future::pending(),
    ));

    TestServer {
        addr,
        registry,
        home,
        task,
    }
}

// ── WsClient ────────────────────────────────────────────────────────

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

pub async fn connect(url: &str) -> WsClient {
    let (stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .unwrap_or_else(|err| panic!("failed to connect to {url}: {err}"));
    WsClient { stream }
}

impl WsClient {
    pub async fn send_text(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .expect("send frame");
    }

    pub async fn send_binary(&mut self, bytes: &[u8]) {
        self.stream
            .send(Message::Binary(bytes.to_vec()))
            .await
            .expect("send frame");
    }

    pub async fn send_json(&mut self, value: serde_json::Value) {
        self.send_text(&value.to_string()).await;
    }

    /// Keystrokes for the shell.
    pub async fn send_data(&mut self, data: &str) {
        self.send_json(json!({ "type": "data", "data": data })).await;
    }

    pub async fn send_resize(&mut self, cols: u16, rows: u16) {
        self.send_json(json!({ "type": "resize", "cols": cols, "rows": rows }))
            .await;
    }

    /// Next control message, or `None` on close, disconnect or timeout.
    pub async fn recv_frame(&mut self, wait: Duration) -> Option<ServerMessage> {
        let deadline = Instant::now() + wait;
        loop {
            let frame = timeout(deadline.saturating_duration_since(Instant::now()), self.stream.next())
                .await
                .ok()??;
            match frame.ok()? {
                Message::Text(text) => {
                    return Some(serde_json::from_str(&text).unwrap_or_else(|err| {
                        panic!("server sent an undecodable frame {text:?}: {err}")
                    }))
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Skip messages until one matches `want`.
    pub async fn wait_for_message(
        &mut self,
        wait: Duration,
        want: impl Fn(&ServerMessage) -> bool,
    ) -> Option<ServerMessage> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_frame(remaining).await {
                Some(msg) if want(&msg) => return Some(msg),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Accumulate `data` output until it contains `needle`. Panics on timeout.
    pub async fn wait_for_output(&mut self, needle: &str) -> String {
        let deadline = Instant::now() + WAIT;
        let mut output = String::new();
        while !output.contains(needle) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_frame(remaining).await {
                Some(ServerMessage::Data { data }) => output.push_str(&data),
                Some(_) => {}
                None => panic!("no {needle:?} before close/timeout; output so far: {output:?}"),
            }
        }
        output
    }

    /// Every message until the server closes the socket or `wait` elapses.
    pub async fn collect_frames(&mut self, wait: Duration) -> Vec<ServerMessage> {
        let deadline = Instant::now() + wait;
        let mut frames = Vec::new();
        while let Some(msg) = self
            .recv_frame(deadline.saturating_duration_since(Instant::now()))
            .await
        {
            frames.push(msg);
        }
        frames
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

pub fn exits(frames: &[ServerMessage]) -> Vec<&ServerMessage> {
    frames
        .iter()
        .filter(|m| matches!(m, ServerMessage::Exit { .. }))
        .collect()
}
