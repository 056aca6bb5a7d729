//! Server configuration.
//!
//! [`ServerConfig`] is the value handed to [`HxServer::new`](crate::HxServer::new);
//! it replaces any process-wide upgrader settings so several independently
//! configured servers can live in one process. [`HostConfig`] is what the
//! host binary builds from an optional TOML file plus CLI overrides.

use hx_core::{HxError, HxResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// WebSocket handshake and buffer settings, applied per mount point.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeConfig {
    /// Write buffer size in bytes. Reads use tungstenite's own buffer.
    pub write_buffer_size: usize,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Allowed `Origin` header values. `"*"` allows any origin (including a
    /// missing header); an empty list allows none.
    pub allowed_origins: Vec<String>,
    /// Maximum concurrently upgraded connections on this mount.
    pub max_connections: usize,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: default_buffer_size(),
            max_message_size: default_max_message_size(),
            allowed_origins: vec!["*".to_string()],
            max_connections: default_max_connections(),
        }
    }
}

/// Runtime configuration of one [`HxServer`](crate::HxServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub upgrade: UpgradeConfig,
    /// Upper bound on a single handler invocation. `None` = unbounded.
    pub handler_timeout: Option<Duration>,
    /// Close connections that send nothing for this long. `None` = never.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            upgrade: UpgradeConfig::default(),
            handler_timeout: Some(Duration::from_millis(default_handler_timeout_ms())),
            idle_timeout: None,
        }
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upgrade: UpgradeConfig,
    #[serde(default)]
    pub timeouts: TimeoutSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_mount")]
    pub mount: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            mount: default_mount(),
        }
    }
}

/// `[timeouts]` section of the config TOML. Zero disables a timeout.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_ms: u64,
    #[serde(default)]
    pub idle_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            handler_ms: default_handler_timeout_ms(),
            idle_secs: 0,
        }
    }
}

fn default_buffer_size() -> usize {
    250_000
}
fn default_max_message_size() -> usize {
    16 << 20
}
fn default_max_connections() -> usize {
    10_000
}
fn default_handler_timeout_ms() -> u64 {
    30_000
}
fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_mount() -> String {
    "/ws".to_string()
}

/// Resolved host configuration (file + CLI overrides applied).
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bind: SocketAddr,
    pub mount: String,
    pub server: ServerConfig,
}

impl HostConfig {
    /// Load config from a TOML file (if it exists), then apply CLI overrides.
    ///
    /// # Arguments
    ///
    /// * `config_path` - TOML file; `~` is expanded and a missing file means defaults.
    /// * `cli_bind`, `cli_mount`, `cli_idle_secs` - override the file when set.
    ///
    /// # Errors
    ///
    /// - [`HxError::Io`] if the file exists but cannot be read.
    /// - [`HxError::Config`] if it does not parse, the bind address is
    ///   invalid, or the mount path does not start with `/`.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_mount: Option<&str>,
        cli_idle_secs: Option<u64>,
    ) -> HxResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_bind, cli_mount, cli_idle_secs)
    }

    /// Merge a parsed config file with CLI overrides.
    pub fn resolve(
        file_config: ConfigFile,
        cli_bind: Option<&str>,
        cli_mount: Option<&str>,
        cli_idle_secs: Option<u64>,
    ) -> HxResult<Self> {
        let bind_str = cli_bind
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.bind);
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|e| HxError::Config(format!("invalid bind address {bind_str:?}: {e}")))?;

        let mount = cli_mount
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.mount);
        if !mount.starts_with('/') {
            return Err(HxError::Config(format!(
                "mount path must start with '/': {mount:?}"
            )));
        }

        let idle_secs = cli_idle_secs.unwrap_or(file_config.timeouts.idle_secs);

        Ok(Self {
            bind,
            mount,
            server: ServerConfig {
                upgrade: file_config.upgrade,
                handler_timeout: nonzero(Duration::from_millis(file_config.timeouts.handler_ms)),
                idle_timeout: nonzero(Duration::from_secs(idle_secs)),
            },
        })
    }
}

/// Parse config TOML text.
pub fn parse_config(content: &str) -> HxResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| HxError::Config(format!("config parse error: {e}")))
}

fn nonzero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
