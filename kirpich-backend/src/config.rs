//! Configuration for the development backend.
//!
//! Priority (highest first): CLI arguments, environment variables (via
//! clap `env`), TOML file (`~/.config/kirpich-backend/config.toml`),
//! compiled defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading backend configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BackendConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
    token_ttl_secs: Option<u64>,
    chats: Option<Vec<String>>,
}

/// CLI arguments for the backend.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Kirpich development backend")]
pub struct BackendCliArgs {
    /// Address to bind to.
    #[arg(short, long, env = "KIRPICH_BACKEND_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/kirpich-backend/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum realtime frame size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Token lifetime in seconds; 0 disables expiry.
    #[arg(long)]
    pub token_ttl_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "KIRPICH_BACKEND_LOG")]
    pub log_level: String,
}

/// Fully resolved backend configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub bind_addr: String,
    pub max_frame_size: usize,
    /// `None` means tokens never expire.
    pub token_ttl: Option<Duration>,
    /// Chat titles created at startup.
    pub chats: Vec<String>,
    pub log_level: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            max_frame_size: kirpich_proto::codec::DEFAULT_MAX_FRAME_SIZE,
            token_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            chats: vec!["General".to_string()],
            log_level: "info".to_string(),
        }
    }
}

impl BackendConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file is missing, or a
    /// config file cannot be read or parsed.
    pub fn load(cli: &BackendCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    fn resolve(cli: &BackendCliArgs, file: &BackendConfigFile) -> Self {
        let defaults = Self::default();
        let ttl_secs = cli.token_ttl_secs.or(file.server.token_ttl_secs);

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            token_ttl: match ttl_secs {
                None => defaults.token_ttl,
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
            },
            chats: file.server.chats.clone().unwrap_or(defaults.chats),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<BackendConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(BackendConfigFile::default());
        };
        config_dir.join("kirpich-backend").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackendConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
