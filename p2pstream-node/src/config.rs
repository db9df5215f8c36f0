//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Node configuration. File: ~/.config/p2pstream/config.toml or /etc/p2pstream/config.toml
/// (or the path given with `--config`).
/// Env overrides: P2PSTREAM_DISCOVERY_PORT, P2PSTREAM_TRANSPORT_PORT, P2PSTREAM_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session TCP port; 0 picks an ephemeral port and advertises it (default 0).
    #[serde(default)]
    pub transport_port: u16,
    /// Run multicast discovery. Off means peers only arrive through `Node::peer_found`
    /// or inbound connections.
    #[serde(default = "default_true")]
    pub discovery: bool,
    #[serde(default = "default_alias_interval_ms")]
    pub alias_interval_ms: u64,
    /// Callee side: unanswered dials are declined after this long.
    #[serde(default = "default_answer_timeout_ms")]
    pub answer_timeout_ms: u64,
    /// Caller side: give up waiting for an answer after this long.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Capacity of the application message stream; slow observers lag and skip.
    #[serde(default = "default_message_queue_size")]
    pub message_queue_size: usize,
    /// Default tracing filter when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_true() -> bool {
    true
}
fn default_alias_interval_ms() -> u64 {
    p2pstream_core::protocol::ALIAS_INTERVAL.as_millis() as u64
}
fn default_answer_timeout_ms() -> u64 {
    p2pstream_core::call::ANSWER_TIMEOUT.as_millis() as u64
}
fn default_dial_timeout_ms() -> u64 {
    p2pstream_core::call::DIAL_TIMEOUT.as_millis() as u64
}
fn default_message_queue_size() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: 0,
            discovery: true,
            alias_interval_ms: default_alias_interval_ms(),
            answer_timeout_ms: default_answer_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            message_queue_size: default_message_queue_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn alias_interval(&self) -> Duration {
        Duration::from_millis(self.alias_interval_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: default, then config file (explicit path, or the first default path that exists),
/// then env vars. A missing default file is fine; an explicit path must exist and parse.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("P2PSTREAM_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("P2PSTREAM_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(level) = var("P2PSTREAM_LOG") {
        c.log_level = level;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/p2pstream/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2pstream/config.toml"));
    out
}
