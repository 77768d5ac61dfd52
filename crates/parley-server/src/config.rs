//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file
//! - Environment variables (`PARLEY__<SECTION>__<FIELD>`)
//! - Command line arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use parley_core::{ExpirerConfig, GatewayConfig, LivenessConfig};
use parley_transport::{TcpConfig, WebSocketConfig};

/// Default config file locations, first match wins.
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port (discovery API, and the WebSocket endpoint).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Which transport adapter to run.
    #[serde(default)]
    pub server_type: ServerType,

    /// Shared key every peer must present.
    #[serde(default = "default_key")]
    pub key: String,

    /// Path of the WebSocket endpoint.
    #[serde(default = "default_path")]
    pub path: String,

    /// Port of the raw socket listener.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Expose the list of registered ids over HTTP.
    #[serde(default)]
    pub allow_discovery: bool,

    /// Keep disconnected identities registered until they time out.
    #[serde(default = "default_true")]
    pub retain_disconnected: bool,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Liveness sweeper configuration.
    #[serde(default)]
    pub liveness: LivenessSettings,

    /// Pending queue configuration.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport adapter selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// WebSocket upgrade on the HTTP port.
    #[default]
    Websocket,
    /// Length-prefixed frames on a plain TCP port.
    Tcp,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of registered identities.
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Raw socket handshake deadline in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Liveness sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessSettings {
    /// Delay between sweeps in milliseconds.
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Idle time before eviction in milliseconds.
    #[serde(default = "default_alive_timeout")]
    pub alive_timeout_ms: u64,
}

/// Pending queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Time a buffered message may wait, in milliseconds.
    #[serde(default = "default_expire_timeout")]
    pub expire_timeout_ms: u64,

    /// Delay between expiry passes in milliseconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Tell senders when their buffered messages expire.
    #[serde(default = "default_true")]
    pub notify_expired: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_key() -> String {
    "parley".to_string()
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_tcp_port() -> u16 {
    9001
}

fn default_true() -> bool {
    true
}

fn default_concurrent_limit() -> usize {
    5000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_handshake_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_check_interval() -> u64 {
    300
}

fn default_alive_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_expire_timeout() -> u64 {
    5_000
}

fn default_cleanup_interval() -> u64 {
    1_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_type: ServerType::default(),
            key: default_key(),
            path: default_path(),
            tcp_port: default_tcp_port(),
            allow_discovery: false,
            retain_disconnected: true,
            limits: LimitsConfig::default(),
            liveness: LivenessSettings::default(),
            queue: QueueSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: default_concurrent_limit(),
            max_message_size: default_max_message_size(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval(),
            alive_timeout_ms: default_alive_timeout(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            expire_timeout_ms: default_expire_timeout(),
            cleanup_interval_ms: default_cleanup_interval(),
            notify_expired: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the first default location that exists,
    /// then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(
                    config::File::from(path).format(config::FileFormat::Toml),
                );
            }
            None => {
                for candidate in &CONFIG_PATHS {
                    let expanded = shellexpand::tilde(candidate);
                    let candidate = Path::new(expanded.as_ref());
                    if candidate.exists() {
                        builder = builder.add_source(
                            config::File::from(candidate).format(config::FileFormat::Toml),
                        );
                        break;
                    }
                }
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// HTTP socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Raw socket listener address.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        let mut addr = self.bind_addr()?;
        addr.set_port(self.tcp_port);
        Ok(addr)
    }

    #[must_use]
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            key: self.key.clone(),
            concurrent_limit: self.limits.concurrent_limit,
            retain_disconnected: self.retain_disconnected,
        }
    }

    #[must_use]
    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            check_interval: Duration::from_millis(self.liveness.check_interval_ms),
            alive_timeout: Duration::from_millis(self.liveness.alive_timeout_ms),
        }
    }

    #[must_use]
    pub fn expirer(&self) -> ExpirerConfig {
        ExpirerConfig {
            cleanup_interval: Duration::from_millis(self.queue.cleanup_interval_ms),
            ttl: Duration::from_millis(self.queue.expire_timeout_ms),
            notify_expired: self.queue.notify_expired,
        }
    }

    #[must_use]
    pub fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig {
            path: self.path.clone(),
            max_message_size: self.limits.max_message_size,
        }
    }

    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn tcp(&self) -> Result<TcpConfig> {
        Ok(TcpConfig {
            bind_addr: self.tcp_addr()?,
            max_message_size: self.limits.max_message_size,
            handshake_timeout: Duration::from_millis(self.limits.handshake_timeout_ms),
        })
    }
}
