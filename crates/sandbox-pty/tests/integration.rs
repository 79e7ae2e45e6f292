//! End-to-end tests: real WebSocket clients against an in-process server
//! with real shells behind it.

mod common;

use std::time::Duration;

use common::*;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sandbox_pty::{IdlePolicy, ServerMessage};
use serde_json::{json, Value};

fn is_exit(msg: &ServerMessage) -> bool {
    matches!(msg, ServerMessage::Exit { .. })
}

// ── Shared session scenario ─────────────────────────────────────────

#[tokio::test]
async fn two_clients_share_one_shell_until_it_is_killed() {
    let server = spawn_server().await;

    let mut a = server.connect("s1").await;
    assert_eq!(a.recv_frame(WAIT).await, Some(ServerMessage::Ready));

    a.send_resize(100, 30).await;
    a.send_data("echo hi\r").await;
    a.wait_for_output("hi\r\n").await;

    let session = server.registry.get("s1").await.expect("session s1");
    assert_eq!(session.pty().size(), (100, 30));

    let mut b = server.connect("s1").await;
    assert_eq!(b.recv_frame(WAIT).await, Some(ServerMessage::Ready));
    assert_eq!(server.registry.spawn_count(), 1);

    b.send_data("echo from_b\r").await;
    a.wait_for_output("from_b\r\n").await;
    b.wait_for_output("from_b\r\n").await;

    kill(Pid::from_raw(session.pid() as i32), Signal::SIGKILL).unwrap();

    for client in [&mut a, &mut b] {
        let frames = client.collect_frames(WAIT).await;
        let exits = exits(&frames);
        assert_eq!(exits.len(), 1, "frames: {frames:?}");
        assert!(matches!(
            exits[0],
            ServerMessage::Exit { code: 137, signal: Some(9), execution_time: Some(_) }
        ));
    }
    assert!(server.registry.get("s1").await.is_none());
}

#[tokio::test]
async fn exit_closes_connections_and_next_attach_respawns() {
    let server = spawn_server().await;
    let mut a = server.connect("cycle").await;
    a.recv_frame(WAIT).await;
    let first_pid = server.registry.get("cycle").await.unwrap().pid();

    a.send_data("exit 3\r").await;
    let exit = a.wait_for_message(WAIT, is_exit).await.expect("exit frame");
    assert!(matches!(exit, ServerMessage::Exit { code: 3, signal: None, .. }));
    assert_eq!(a.recv_frame(WAIT).await, None);

    let mut b = server.connect("cycle").await;
    assert_eq!(b.recv_frame(WAIT).await, Some(ServerMessage::Ready));
    let second = server.registry.get("cycle").await.unwrap();
    assert_ne!(second.pid(), first_pid);
    assert_eq!(server.registry.spawn_count(), 2);
}

#[tokio::test]
async fn disconnect_keeps_shell_for_reconnect() {
    let server = spawn_server().await;
    let mut a = server.connect("persist").await;
    a.recv_frame(WAIT).await;
    a.send_data("export MARK=kept_value\r").await;
    a.send_data("echo set\r").await;
    a.wait_for_output("set\r\n").await;
    let pid = server.registry.get("persist").await.unwrap().pid();
    a.close().await;

    let mut b = server.connect("persist").await;
    assert_eq!(b.recv_frame(WAIT).await, Some(ServerMessage::Ready));
    b.send_data("echo $MARK\r").await;
    b.wait_for_output("kept_value\r\n").await;
    assert_eq!(server.registry.get("persist").await.unwrap().pid(), pid);
    assert_eq!(server.registry.spawn_count(), 1);
}

#[tokio::test]
async fn sessions_are_isolated_by_id() {
    let server = spawn_server().await;
    let mut a = server.connect("left").await;
    let mut b = server.connect("right").await;
    a.recv_frame(WAIT).await;
    b.recv_frame(WAIT).await;

    a.send_data("echo only_left\r").await;
    a.wait_for_output("only_left\r\n").await;
    b.send_data("echo only_right\r").await;
    let output = b.wait_for_output("only_right\r\n").await;
    assert!(!output.contains("only_left"));
    assert_eq!(server.registry.spawn_count(), 2);
}

// ── Protocol edges ──────────────────────────────────────────────────

#[tokio::test]
async fn missing_or_invalid_session_id_uses_default() {
    let server = spawn_server().await;
    let mut a = connect(&server.ws_url("/")).await;
    let mut b = server.connect("bad%20id").await;
    assert_eq!(a.recv_frame(WAIT).await, Some(ServerMessage::Ready));
    assert_eq!(b.recv_frame(WAIT).await, Some(ServerMessage::Ready));

    assert_eq!(server.registry.session_count().await, 1);
    let session = server.registry.get("default").await.expect("default session");
    assert_eq!(session.connection_count().await, 2);
}

#[tokio::test]
async fn input_alias_and_binary_frames_reach_shell() {
    let server = spawn_server().await;
    let mut a = server.connect("alias").await;
    a.recv_frame(WAIT).await;

    a.send_json(json!({ "type": "input", "data": "echo via_input\r" })).await;
    a.wait_for_output("via_input\r\n").await;

    a.send_binary(br#"{"type":"data","data":"echo via_binary\r"}"#).await;
    a.wait_for_output("via_binary\r\n").await;
}

#[tokio::test]
async fn unknown_and_malformed_frames_leave_connection_open() {
    let server = spawn_server().await;
    let mut a = server.connect("noise").await;
    a.recv_frame(WAIT).await;

    a.send_text("not json at all").await;
    a.send_json(json!({ "type": "ping" })).await;
    a.send_json(json!({ "data": "no type" })).await;
    a.send_json(json!({ "type": "resize", "cols": 0, "rows": 10 })).await;
    a.send_json(json!({ "type": "resize", "cols": 120 })).await;

    a.send_data("echo still_open\r").await;
    a.wait_for_output("still_open\r\n").await;
    let session = server.registry.get("noise").await.unwrap();
    assert_eq!(session.pty().size(), (80, 24));
}

#[tokio::test]
async fn resize_is_visible_to_the_shell() {
    let server = spawn_server().await;
    let mut a = server.connect("size").await;
    a.recv_frame(WAIT).await;
    a.send_resize(132, 43).await;
    a.send_data("stty size\r").await;
    a.wait_for_output("43 132").await;
}

#[tokio::test]
async fn spawn_failure_sends_error_then_closes() {
    let server = spawn_server_with(|config| {
        config.spawn.shell = "/nonexistent/shell".to_string();
    })
    .await;
    let mut a = server.connect("broken").await;

    match a.recv_frame(WAIT).await {
        Some(ServerMessage::Error { message }) => {
            assert!(message.starts_with("Failed to create shell process"), "{message}");
        }
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(a.recv_frame(WAIT).await, None);
    assert_eq!(server.registry.session_count().await, 0);
    assert_eq!(server.registry.spawn_count(), 0);
}

#[tokio::test]
async fn command_detection_broadcasts_submitted_lines() {
    let server = spawn_server_with(|config| config.detect_commands = true).await;
    let mut a = server.connect("cmds").await;
    let mut b = server.connect("cmds").await;
    a.recv_frame(WAIT).await;
    b.recv_frame(WAIT).await;

    // Typo fixed with backspace before submitting.
    a.send_data("echo detcted").await;
    a.send_data("\x7f\x7f\x7f\x7fected\r").await;

    for client in [&mut a, &mut b] {
        let msg = client
            .wait_for_message(WAIT, |m| matches!(m, ServerMessage::Command { .. }))
            .await
            .expect("command frame");
        match msg {
            ServerMessage::Command { command, cwd, .. } => {
                assert_eq!(command, "echo detected");
                assert!(!cwd.is_empty());
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn idle_shell_is_evicted_when_enabled() {
    let server = spawn_server_with(|config| {
        config.idle = IdlePolicy::After(Duration::from_millis(200));
    })
    .await;
    let mut a = server.connect("idle").await;
    a.recv_frame(WAIT).await;
    a.close().await;

    let deadline = tokio::time::Instant::now() + WAIT;
    while server.registry.get("idle").await.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "idle session never evicted");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ── Status endpoint ─────────────────────────────────────────────────

#[tokio::test]
async fn status_lists_live_sessions() {
    let server = spawn_server().await;
    let mut a = server.connect("status-1").await;
    a.recv_frame(WAIT).await;

    let body: Value = serde_json::from_str(&server.get("/api/pty").await).unwrap();
    assert_eq!(body["status"], "available");
    assert_eq!(body["sessionCount"], 1);
    assert_eq!(body["sessionsSpawned"], 1);
    let session = &body["sessions"][0];
    assert_eq!(session["id"], "status-1");
    assert_eq!(session["connections"], 1);
    assert_eq!(session["cols"], 80);
    assert!(session["pid"].as_u64().unwrap() > 0);
}
