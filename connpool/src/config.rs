//! Pool configuration files.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use connpool_core::Network;
use serde::Deserialize;

use crate::pool::DEFAULT_MAX_IDLE_CONNS;

/// Errors raised while loading a [`PoolConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The contents are not valid TOML for a pool config.
    #[error("failed to parse pool config")]
    Parse(#[from] toml::de::Error),

    /// The config parsed but makes no sense.
    #[error("invalid pool config: {0}")]
    Invalid(String),
}

/// Endpoint and limits for one pool.
///
/// ```toml
/// network = "tcp"
/// address = "127.0.0.1:6379"
/// max_idle_conns = 4
/// max_open_conns = 16
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Transport, `tcp` unless set.
    #[serde(default)]
    pub network: Network,

    /// e.g. "127.0.0.1:6379", or a socket path for `unix`
    pub address: String,

    /// Idle connections kept for reuse.
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,

    /// Open connections allowed at once, `0` for no limit.
    #[serde(default)]
    pub max_open_conns: usize,
}

fn default_max_idle_conns() -> usize {
    DEFAULT_MAX_IDLE_CONNS
}

impl PoolConfig {
    /// Config for `address` over `network` with default limits.
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_open_conns: 0,
        }
    }

    /// Read and validate a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    /// Reject configs a pool cannot be built from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("`address` must not be empty".into()));
        }
        Ok(())
    }
}

impl FromStr for PoolConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}
