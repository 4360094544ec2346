//! Configuration module
//!
//! Handles loading and saving simbridge configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::coordinator::CoordinatorConfig;
use crate::env::ImageShape;
use crate::network::Endpoint;
use crate::protocol::{DEFAULT_PORT, DEFAULT_PROXY_PORT};
use crate::session::{ResyncPolicy, RetryPolicy, SessionTimeouts, DEFAULT_MAX_ATTEMPTS};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Simulation service addresses
    #[serde(default)]
    pub server: ServerConfig,

    /// Experiment identity and episode counts
    #[serde(default)]
    pub experiment: ExperimentConfig,

    /// Mission start retries and poll cadences
    #[serde(default)]
    pub retry: RetryConfig,

    /// Service restart on resync
    #[serde(default)]
    pub resync: ResyncConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Observation image shape
    #[serde(default)]
    pub observation: ObservationConfig,

    /// Proxy bridge settings
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Simulation service addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Head node address
    #[serde(default = "default_address")]
    pub address: String,
    /// Head node command port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address of the other roles' services (default: the head's)
    pub secondary_address: Option<String>,
    /// Base command port of the other roles' services (default: `port`)
    pub secondary_port: Option<u16>,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            secondary_address: None,
            secondary_port: None,
        }
    }
}

/// Experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment unique id (generated if not set)
    pub unique_id: Option<String>,
    /// Episode count roles start from
    #[serde(default)]
    pub start_episode: u64,
    /// Episodes each role runs
    #[serde(default = "default_episodes")]
    pub episodes: u64,
    /// Rebuild sessions every this many episodes, 0 = never
    #[serde(default)]
    pub resync: u64,
}

fn default_episodes() -> u64 {
    1
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            unique_id: None,
            start_episode: 0,
            episodes: default_episodes(),
            resync: 0,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between mission start attempts in ms
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
    /// Delay between begin checks in ms
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Delay between integrated server lookups in ms
    #[serde(default = "default_find_interval")]
    pub find_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff() -> u64 {
    2000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_find_interval() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
            poll_interval_ms: default_poll_interval(),
            find_interval_ms: default_find_interval(),
        }
    }
}

/// Resync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Ask the service to restart at each resync
    #[serde(default)]
    pub exit_service: bool,
    /// Wait after the exit request in ms
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    #[serde(default = "default_status_attempts")]
    pub status_attempts: u32,
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
}

fn default_settle() -> u64 {
    60_000
}

fn default_status_attempts() -> u32 {
    30
}

fn default_status_interval() -> u64 {
    10_000
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            exit_service: false,
            settle_ms: default_settle(),
            status_attempts: default_status_attempts(),
            status_interval_ms: default_status_interval(),
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,
    /// Reply timeout in ms (not set: wait forever)
    pub reply_ms: Option<u64>,
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout(),
            reply_ms: None,
        }
    }
}

/// Observation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationConfig {
    #[serde(default = "default_side")]
    pub height: u32,
    #[serde(default = "default_side")]
    pub width: u32,
    /// 3 for RGB, 4 with depth
    #[serde(default = "default_depth")]
    pub depth: u32,
}

fn default_side() -> u32 {
    84
}

fn default_depth() -> u32 {
    3
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            height: default_side(),
            width: default_side(),
            depth: default_depth(),
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// Mission file used when a client sends an empty config
    pub mission: Option<PathBuf>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_proxy_port(),
            mission: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("simbridge/config.toml")),
            Some(PathBuf::from("./simbridge.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values no session could run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.observation_shape().is_empty() {
            return Err(ConfigError::Invalid("observation shape must not be empty".into()));
        }
        if self.timeouts.reply_ms == Some(0) {
            return Err(ConfigError::Invalid("timeouts.reply_ms must be positive".into()));
        }
        Ok(())
    }

    /// Get the experiment id, generating one if not set
    pub fn experiment_id(&self) -> String {
        self.experiment
            .unique_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn server_endpoint(&self) -> Endpoint {
        Endpoint::new(self.server.address.clone(), self.server.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: Duration::from_millis(self.retry.backoff_ms),
            poll_interval: Duration::from_millis(self.retry.poll_interval_ms),
            find_interval: Duration::from_millis(self.retry.find_interval_ms),
        }
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(self.timeouts.connect_ms),
            reply: self.timeouts.reply_ms.map(Duration::from_millis),
        }
    }

    pub fn resync_policy(&self) -> ResyncPolicy {
        ResyncPolicy {
            period: self.experiment.resync,
            exit_service: self.resync.exit_service,
            settle: Duration::from_millis(self.resync.settle_ms),
            status_attempts: self.resync.status_attempts,
            status_interval: Duration::from_millis(self.resync.status_interval_ms),
        }
    }

    pub fn observation_shape(&self) -> ImageShape {
        ImageShape::new(
            self.observation.height,
            self.observation.width,
            self.observation.depth,
        )
    }

    /// Settings for a multi-role run
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::new(self.server_endpoint(), self.experiment_id());
        config.secondary_address = self.server.secondary_address.clone();
        config.secondary_port = self.server.secondary_port;
        config.start_episode = self.experiment.start_episode;
        config.episodes = self.experiment.episodes;
        config.resync = self.resync_policy();
        config.retry = self.retry_policy();
        config.timeouts = self.session_timeouts();
        config.shape = self.observation_shape();
        config
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerConfig {
            secondary_port: Some(DEFAULT_PORT + 1),
            ..Default::default()
        },
        experiment: ExperimentConfig {
            unique_id: Some("my-experiment".to_string()),
            episodes: 10,
            resync: 5,
            ..Default::default()
        },
        timeouts: TimeoutConfig {
            reply_ms: Some(120_000),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
