//! Configuration for the `rackgate` binary

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::PoolOptions;

/// Top-level configuration for the proxy.
///
/// # Security Warning
///
/// The `config` path is handed to worker processes which execute whatever
/// runtime it describes. Configuration files must be protected with
/// appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Runtime configuration file handed to every worker
    pub config: PathBuf,

    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool settings
    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port to listen on (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Number of workers (default: 1)
    #[serde(default = "default_size")]
    pub size: usize,

    /// Idle timeout in seconds before a worker is asked to quit
    pub idle_secs: Option<u64>,

    /// Working directory for worker processes
    pub cwd: Option<PathBuf>,

    /// Environment variables passed to worker processes
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Run workers with `--debug`
    #[serde(default)]
    pub debug: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: default_size(),
            idle_secs: None,
            cwd: None,
            env: HashMap::new(),
            debug: false,
        }
    }
}

impl PoolSettings {
    pub fn to_options(&self) -> PoolOptions {
        PoolOptions {
            size: self.size,
            idle: self.idle_secs.map(Duration::from_secs),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            debug: self.debug,
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_size() -> usize {
    1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.size == 0 {
            anyhow::bail!("pool.size must be at least 1");
        }
        Ok(())
    }
}
