//! Daemon configuration persisted as `config.json` in the storage root.
//!
//! The daemon reads it once at startup. Changing it requires a restart.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fs::operations::atomic_write;

pub const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_PORT: u16 = 10101;
pub const DEFAULT_LIMIT: usize = 8;
pub const MIN_LIMIT: usize = 1;
pub const MAX_LIMIT: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_limit")]
    pub max_tracked_processes: usize,
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            max_tracked_processes: default_limit(),
        }
    }
}

impl Config {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Keeps the limit inside the range the daemon supports.
    pub fn normalized(self) -> Self {
        Self {
            max_tracked_processes: clamp_limit(self.max_tracked_processes),
            ..self
        }
    }
}

pub fn clamp_limit(limit: usize) -> usize {
    limit.clamp(MIN_LIMIT, MAX_LIMIT)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE_NAME)
}

/// Load config from the storage root, returning defaults if the file is missing or invalid.
pub fn load_config(root: &Path) -> Config {
    let path = config_path(root);
    match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str::<Config>(&contents) {
            Ok(config) => config.normalized(),
            Err(e) => {
                warn!("Config at {path:?} is malformed, using defaults: {e}");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

pub fn save_config(root: &Path, config: &Config) -> Result<(), std::io::Error> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    atomic_write(&config_path(root), json.as_bytes())
}
