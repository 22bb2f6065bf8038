//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use wsmux_core::{MuxError, MuxResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// PEM certificate path. Providing cert + key enables TLS.
    pub tls_cert: Option<String>,
    /// PEM private key path.
    pub tls_key: Option<String>,
    /// PEM CA bundle. Providing this enables client-certificate auth.
    pub tls_ca: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls_cert: None,
            tls_key: None,
            tls_ca: None,
        }
    }
}

/// `[gateway]` section of the config TOML: per-session splicing limits.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Maximum accumulated bytes of any client message.
    #[serde(default = "default_frame_size_limit")]
    pub frame_size_limit: u64,
    /// Upstream read timeout in seconds (bounds the dial handshake read).
    #[serde(default = "default_io_timeout")]
    pub read_timeout: u64,
    /// Socket write timeout in seconds.
    #[serde(default = "default_io_timeout")]
    pub write_timeout: u64,
    /// Upper bound on client-requested dial timeouts, in seconds.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    /// Hostnames dial-out is allowed to reach. Empty = allow all.
    #[serde(default)]
    pub allowed_hostnames: Vec<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            frame_size_limit: default_frame_size_limit(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
            dial_timeout: default_dial_timeout(),
            allowed_hostnames: Vec::new(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_frame_size_limit() -> u64 {
    5 * 1024 * 1024
}
fn default_io_timeout() -> u64 {
    5
}
fn default_dial_timeout() -> u64 {
    10
}

/// Immutable per-session configuration snapshot, shared by every socket a
/// session owns.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum accumulated bytes of any client message (RPC payloads and
    /// joined fragments). Exceeding it closes the offending socket with 1009.
    pub frame_size_limit: u64,
    /// Bounds the dial handshake response read. Frame-header reads are never
    /// deadline-bounded so sessions can idle.
    pub read_timeout: Duration,
    /// Deadline applied to every socket write.
    pub write_timeout: Duration,
    /// Upper bound on client-requested dial timeouts.
    pub dial_timeout: Duration,
    /// Case-insensitive exact-match hostname allowlist for `connect`.
    /// Empty = allow all.
    pub hostname_allowlist: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewaySection::default().resolve()
    }
}

impl GatewaySection {
    fn resolve(self) -> GatewayConfig {
        GatewayConfig {
            frame_size_limit: self.frame_size_limit,
            read_timeout: Duration::from_secs(self.read_timeout),
            write_timeout: Duration::from_secs(self.write_timeout),
            dial_timeout: Duration::from_secs(self.dial_timeout),
            hostname_allowlist: self.allowed_hostnames,
        }
    }
}

/// Resolved server configuration (file values with CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_ca: Option<PathBuf>,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing config file is not an error; defaults are used. CLI
    /// arguments, when `Some`, take precedence over the file values.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_tls_cert: Option<&str>,
        cli_tls_key: Option<&str>,
        cli_tls_ca: Option<&str>,
        cli_frame_size_limit: Option<u64>,
        cli_read_timeout: Option<u64>,
        cli_write_timeout: Option<u64>,
        cli_dial_timeout: Option<u64>,
        cli_allowed_hostnames: &[String],
    ) -> MuxResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| MuxError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let mut gateway = file_config.gateway;
        if let Some(v) = cli_frame_size_limit {
            gateway.frame_size_limit = v;
        }
        if let Some(v) = cli_read_timeout {
            gateway.read_timeout = v;
        }
        if let Some(v) = cli_write_timeout {
            gateway.write_timeout = v;
        }
        if let Some(v) = cli_dial_timeout {
            gateway.dial_timeout = v;
        }
        if !cli_allowed_hostnames.is_empty() {
            gateway.allowed_hostnames = cli_allowed_hostnames.to_vec();
        }

        Ok(Self {
            listen: cli_listen
                .map(|s| s.to_string())
                .unwrap_or(file_config.server.listen),
            tls_cert: pick_path(cli_tls_cert, file_config.server.tls_cert),
            tls_key: pick_path(cli_tls_key, file_config.server.tls_key),
            tls_ca: pick_path(cli_tls_ca, file_config.server.tls_ca),
            gateway: gateway.resolve(),
        })
    }
}

fn pick_path(cli: Option<&str>, file: Option<String>) -> Option<PathBuf> {
    cli.map(|s| s.to_string())
        .or(file)
        .map(|s| expand_tilde_str(&s))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
