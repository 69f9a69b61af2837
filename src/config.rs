//! Connection target and batch tuning.
//!
//! Values can be built in code (`Config::default()` plus the setters) or loaded
//! from a TOML file with optional `[connect]` and `[dispatch]` tables:
//!
//! ```toml
//! [connect]
//! host = "127.0.0.1"
//! port = 3306
//! user = "root"
//!
//! [dispatch]
//! limit = 20
//! timeout = 20.0   # seconds, millisecond precision
//! block_tv = 1.0   # seconds, millisecond precision
//! ```
//!
//! Out-of-range numbers are not errors: they leave the default in place.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_BLOCK_INTERVAL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DBNAME, DEFAULT_HOST, DEFAULT_LIMIT,
    DEFAULT_PORT, DEFAULT_TIMEOUT, DEFAULT_USER,
};

/// Errors from loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Where and as whom the TCP driver connects.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub host: String,
    pub user: String,
    pub passwd: String,
    pub dbname: String,
    pub port: u16,
    /// Bound on TCP connect plus handshake.
    pub connect_timeout: Duration,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            user: DEFAULT_USER.to_string(),
            passwd: String::new(),
            dbname: DEFAULT_DBNAME.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConnectParams {
    /// `host:port` string for address resolution.
    pub fn addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Batch sizing and time budget for a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Max queued requests per batch. Always > 0.
    pub limit: usize,
    /// Global batch deadline, measured from the end of submission.
    pub timeout: Duration,
    /// Max block time of one readiness poll.
    pub block_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            timeout: DEFAULT_TIMEOUT,
            block_interval: DEFAULT_BLOCK_INTERVAL,
        }
    }
}

impl DispatchConfig {
    /// Set the queue limit. Zero keeps the current value.
    pub fn with_limit(mut self, limit: usize) -> Self {
        if limit > 0 {
            self.limit = limit;
        }
        self
    }

    /// Set the batch deadline in fractional seconds. Non-positive values keep the current value.
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            self.timeout = secs_to_millis(secs);
        }
        self
    }

    /// Set the per-poll block time in fractional seconds. Negative values keep the current value.
    pub fn with_block_secs(mut self, secs: f64) -> Self {
        if secs.is_finite() && secs >= 0.0 {
            self.block_interval = secs_to_millis(secs);
        }
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// Truncates to whole milliseconds.
fn secs_to_millis(secs: f64) -> Duration {
    Duration::from_millis((secs * 1000.0) as u64)
}

/// Everything the CLI and benches need to run a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub connect: ConnectParams,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    connect: ConnectSection,
    dispatch: DispatchSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConnectSection {
    host: Option<String>,
    user: Option<String>,
    passwd: Option<String>,
    dbname: Option<String>,
    port: Option<u16>,
    connect_timeout: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DispatchSection {
    limit: Option<i64>,
    timeout: Option<f64>,
    block_tv: Option<f64>,
}

impl Config {
    /// Load a TOML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(text)?;
        Ok(file.into())
    }
}

impl From<FileConfig> for Config {
    fn from(file: FileConfig) -> Self {
        let mut connect = ConnectParams::default();
        let c = file.connect;
        if let Some(host) = c.host {
            connect.host = host;
        }
        if let Some(user) = c.user {
            connect.user = user;
        }
        if let Some(passwd) = c.passwd {
            connect.passwd = passwd;
        }
        if let Some(dbname) = c.dbname {
            connect.dbname = dbname;
        }
        if let Some(port) = c.port {
            connect.port = port;
        }
        if let Some(secs) = c.connect_timeout.filter(|s| s.is_finite() && *s > 0.0) {
            connect.connect_timeout = secs_to_millis(secs);
        }

        let d = file.dispatch;
        let mut dispatch = DispatchConfig::default();
        if let Some(limit) = d.limit.filter(|l| *l > 0) {
            dispatch = dispatch.with_limit(limit as usize);
        }
        if let Some(secs) = d.timeout {
            dispatch = dispatch.with_timeout_secs(secs);
        }
        if let Some(secs) = d.block_tv {
            dispatch = dispatch.with_block_secs(secs);
        }

        Config { connect, dispatch }
    }
}
