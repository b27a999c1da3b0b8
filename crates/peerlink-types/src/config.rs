//! Driver configuration.
//!
//! Every field has a default, so an empty TOML document (or no file at all)
//! yields a usable loopback driver.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default maximum frame body size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default number of inbound messages buffered before readers apply backpressure.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Errors loading or validating a [`DriverConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value the driver cannot run with.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for a driver instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Address the receiving listener binds. Port 0 picks an ephemeral port.
    pub listen_addr: SocketAddr,
    /// Host advertised to peers instead of the bound IP (needed when
    /// binding a wildcard interface).
    pub advertise_host: Option<String>,
    /// Largest accepted frame body, in bytes.
    pub max_message_size: usize,
    /// Inbound messages buffered ahead of the consumer.
    pub inbox_capacity: usize,
    /// Upper bound on dialling a peer, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            advertise_host: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            connect_timeout_ms: 5_000,
        }
    }
}

impl DriverConfig {
    /// Preset for drivers talking over loopback or a LAN.
    pub fn local_network() -> Self {
        Self {
            connect_timeout_ms: 500,
            ..Self::default()
        }
    }

    /// Dial timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject values that would make the driver unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be greater than zero".into(),
            ));
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must fit the 4-byte length prefix (max {})",
                u32::MAX
            )));
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "inbox_capacity must be greater than zero".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be greater than zero".into(),
            ));
        }
        if matches!(&self.advertise_host, Some(host) if host.trim().is_empty()) {
            return Err(ConfigError::Invalid("advertise_host is empty".into()));
        }
        Ok(())
    }
}
