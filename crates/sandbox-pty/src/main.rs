//! `sandbox-pty` server entry point.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sandbox_pty::{AppState, Config, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandbox_pty=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    let registry = SessionRegistry::new(config.registry_config());
    let state = AppState {
        registry: registry.clone(),
        max_message_size: config.max_message_size,
    };

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        shell = %registry.config().spawn.shell,
        cwd = %registry.config().spawn.cwd.display(),
        idle = ?registry.config().idle,
        detect_commands = registry.config().detect_commands,
        "pty server listening"
    );

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let on_signal = registry.clone();
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("shutting down pty server");
        // Shells go first so attached connections get their exit and close.
        on_signal.shutdown().await;
    };

    sandbox_pty::serve(listener, state, shutdown)
        .await
        .context("server error")?;

    registry.shutdown().await;
    Ok(())
}
