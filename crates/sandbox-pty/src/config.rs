//! Command-line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::pty::{default_cwd, default_shell, SpawnOptions};
use crate::registry::{IdlePolicy, RegistryConfig};
use crate::transport::DEFAULT_MAX_MESSAGE_SIZE;

#[derive(Debug, Clone, Parser)]
#[command(name = "sandbox-pty")]
#[command(about = "Multiplex PTY shell sessions over WebSocket")]
#[command(version)]
pub struct Config {
    /// Address to bind to
    #[arg(long, env = "SANDBOX_PTY_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "SANDBOX_PTY_PORT", default_value_t = 3701)]
    pub port: u16,

    /// Shell to spawn per session [default: $SHELL, or /bin/bash]
    #[arg(long, env = "SANDBOX_PTY_SHELL")]
    pub shell: Option<String>,

    /// Extra arguments passed to the shell
    #[arg(long = "shell-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub shell_args: Vec<String>,

    /// Working directory for new shells [default: $HOME]
    #[arg(long, env = "SANDBOX_PTY_CWD")]
    pub cwd: Option<PathBuf>,

    /// Initial terminal width
    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    /// Initial terminal height
    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    /// Extra environment for shells, as KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Hang up shells that have had no connection for this many seconds
    #[arg(long, env = "SANDBOX_PTY_IDLE_TIMEOUT")]
    pub idle_timeout_secs: Option<u64>,

    /// Emit `command` events for lines submitted at the prompt
    #[arg(long, env = "SANDBOX_PTY_DETECT_COMMANDS")]
    pub detect_commands: bool,

    /// Largest inbound WebSocket message, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,
}

impl Config {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            spawn: SpawnOptions {
                shell: self.shell.clone().unwrap_or_else(default_shell),
                args: self.shell_args.clone(),
                cwd: self.cwd.clone().unwrap_or_else(default_cwd),
                env: self.env.clone(),
                cols: self.cols.max(1),
                rows: self.rows.max(1),
            },
            idle: match self.idle_timeout_secs {
                Some(secs) if secs > 0 => IdlePolicy::After(Duration::from_secs(secs)),
                _ => IdlePolicy::Never,
            },
            detect_commands: self.detect_commands,
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
