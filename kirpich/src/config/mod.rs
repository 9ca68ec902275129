//! Configuration system for the Kirpich client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/kirpich/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    outbound: OutboundFileConfig,
    sync: SyncFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    endpoint: Option<String>,
    api_url: Option<String>,
    email: Option<String>,
    connect_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    outbox_capacity: Option<usize>,
    request_timeout_secs: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    factor: Option<f64>,
    max_delay_secs: Option<u64>,
    jitter: Option<f64>,
    max_attempts: Option<u32>,
    stability_threshold_secs: Option<u64>,
}

/// `[outbound]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OutboundFileConfig {
    route: Option<SendRoute>,
    send_timeout_secs: Option<u64>,
    max_message_size: Option<usize>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    event_buffer: Option<usize>,
    max_frame_size: Option<usize>,
    max_tracked_ids: Option<usize>,
    notifications: Option<bool>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnection backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay, in `0.0..=1.0`.
    pub jitter: f64,
    /// Consecutive failed attempts after which `RetriesExhausted` is
    /// reported once. Reconnection continues regardless.
    pub max_attempts: Option<u32>,
    /// A link that stays up this long resets the backoff schedule.
    pub stability_threshold: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: Some(10),
            stability_threshold: Duration::from_secs(30),
        }
    }
}

/// Settings for the persistent realtime connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Upper bound for a single connect attempt.
    pub connect_timeout: Duration,
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval: Duration,
    /// A link with no inbound traffic for this long is treated as lost.
    pub idle_timeout: Duration,
    /// Frames held while not connected; the oldest is dropped on overflow.
    pub outbox_capacity: usize,
    /// Backoff schedule.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            outbox_capacity: 100,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// How outgoing messages reach the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SendRoute {
    /// As a frame over the realtime connection, confirmed by an `ack`.
    #[default]
    Realtime,
    /// As a REST request, confirmed by the response.
    Request,
}

/// Optimistic send settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundConfig {
    pub route: SendRoute,
    /// Time a single attempt may stay pending before it is marked failed.
    pub send_timeout: Duration,
    /// Largest accepted message body in bytes.
    pub max_message_size: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            route: SendRoute::Realtime,
            send_timeout: Duration::from_secs(15),
            max_message_size: kirpich_proto::message::MAX_MESSAGE_SIZE,
        }
    }
}

/// Router and state settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Capacity of the `SyncEvent` channel handed to the UI.
    pub event_buffer: usize,
    /// Inbound frames larger than this are dropped.
    pub max_frame_size: usize,
    /// Message ids remembered per chat for unread deduplication.
    pub max_tracked_ids: usize,
    /// Forward incoming messages to the backend notify endpoint.
    pub notifications: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            max_frame_size: kirpich_proto::codec::DEFAULT_MAX_FRAME_SIZE,
            max_tracked_ids: 10_000,
            notifications: false,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    // -- Network --
    /// Realtime WebSocket endpoint (e.g. `ws://127.0.0.1:9100/ws`).
    pub endpoint: Option<String>,
    /// Base URL of the REST API (e.g. `http://127.0.0.1:9100`).
    pub api_url: Option<String>,
    /// Account used for login.
    pub email: Option<String>,
    /// Password used for login. CLI or environment only.
    pub password: Option<String>,
    /// Timeout applied to each REST request.
    pub request_timeout: Duration,

    pub connection: ConnectionConfig,
    pub outbound: OutboundConfig,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_url: None,
            email: None,
            password: None,
            request_timeout: Duration::from_secs(15),
            connection: ConnectionConfig::default(),
            outbound: OutboundConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Everything needed to log in and open the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTarget {
    pub endpoint: String,
    pub api_url: String,
    pub email: String,
    pub password: String,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path (`~/.config/kirpich/config.toml`)
    /// is tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Out-of-range numbers are clamped to
    /// the nearest usable value.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let net = &file.network;
        let rc = &file.reconnect;

        let reconnect = ReconnectConfig {
            base_delay: rc
                .base_delay_ms
                .map_or(defaults.connection.reconnect.base_delay, Duration::from_millis),
            factor: rc
                .factor
                .filter(|f| f.is_finite())
                .map_or(defaults.connection.reconnect.factor, |f| f.max(1.0)),
            max_delay: rc
                .max_delay_secs
                .map_or(defaults.connection.reconnect.max_delay, Duration::from_secs),
            jitter: rc
                .jitter
                .filter(|j| j.is_finite())
                .map_or(defaults.connection.reconnect.jitter, |j| j.clamp(0.0, 1.0)),
            max_attempts: match rc.max_attempts {
                Some(0) => None,
                Some(n) => Some(n),
                None => defaults.connection.reconnect.max_attempts,
            },
            stability_threshold: rc.stability_threshold_secs.map_or(
                defaults.connection.reconnect.stability_threshold,
                Duration::from_secs,
            ),
        };

        Self {
            endpoint: cli.endpoint.clone().or_else(|| net.endpoint.clone()),
            api_url: cli.api_url.clone().or_else(|| net.api_url.clone()),
            email: cli.email.clone().or_else(|| net.email.clone()),
            password: cli.password.clone(),
            request_timeout: net
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            connection: ConnectionConfig {
                connect_timeout: net
                    .connect_timeout_secs
                    .map_or(defaults.connection.connect_timeout, Duration::from_secs),
                heartbeat_interval: net
                    .heartbeat_interval_secs
                    .filter(|s| *s > 0)
                    .map_or(defaults.connection.heartbeat_interval, Duration::from_secs),
                idle_timeout: net
                    .idle_timeout_secs
                    .map_or(defaults.connection.idle_timeout, Duration::from_secs),
                outbox_capacity: net
                    .outbox_capacity
                    .map_or(defaults.connection.outbox_capacity, |c| c.max(1)),
                reconnect,
            },
            outbound: OutboundConfig {
                route: cli
                    .route
                    .or(file.outbound.route)
                    .unwrap_or(defaults.outbound.route),
                send_timeout: file
                    .outbound
                    .send_timeout_secs
                    .map_or(defaults.outbound.send_timeout, Duration::from_secs),
                max_message_size: file
                    .outbound
                    .max_message_size
                    .unwrap_or(defaults.outbound.max_message_size),
            },
            sync: SyncConfig {
                event_buffer: file
                    .sync
                    .event_buffer
                    .map_or(defaults.sync.event_buffer, |b| b.max(1)),
                max_frame_size: file
                    .sync
                    .max_frame_size
                    .unwrap_or(defaults.sync.max_frame_size),
                max_tracked_ids: file
                    .sync
                    .max_tracked_ids
                    .map_or(defaults.sync.max_tracked_ids, |n| n.max(1)),
                notifications: file
                    .sync
                    .notifications
                    .unwrap_or(defaults.sync.notifications),
            },
        }
    }

    /// Returns the login and connection target if every required field is
    /// present.
    #[must_use]
    pub fn account_target(&self) -> Option<AccountTarget> {
        Some(AccountTarget {
            endpoint: self.endpoint.clone()?,
            api_url: self.api_url.clone()?,
            email: self.email.clone().filter(|e| !e.is_empty())?,
            password: self.password.clone()?,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Realtime sync client for Kirpich chats")]
pub struct CliArgs {
    /// WebSocket URL of the realtime endpoint.
    #[arg(long, env = "KIRPICH_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Base URL of the REST API.
    #[arg(long, env = "KIRPICH_API_URL")]
    pub api_url: Option<String>,

    /// Account email.
    #[arg(long, env = "KIRPICH_EMAIL")]
    pub email: Option<String>,

    /// Account password.
    #[arg(long, env = "KIRPICH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// How outgoing messages are delivered.
    #[arg(long, value_enum)]
    pub route: Option<SendRoute>,

    /// Path to config file (default: `~/.config/kirpich/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "KIRPICH_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/kirpich.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("kirpich").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
