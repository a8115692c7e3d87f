use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DB_ENV: &str = "SPEND_GRAPH_DB";
pub const ADDR_ENV: &str = "SPEND_GRAPH_ADDR";
pub const LOG_ENV: &str = "SPEND_GRAPH_LOG";

pub const DEFAULT_DB_PATH: &str = "spend-graph.db";
pub const DEFAULT_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Configuration loaded from environment variables
///
/// Command-line flags in the binaries take precedence over these values.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            bind_addr: default_addr(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (the environment, or a map in tests)
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_path = non_empty(DB_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let bind_addr = match non_empty(ADDR_ENV) {
            Some(addr) => addr
                .parse()
                .map_err(|e| anyhow::anyhow!("{} is not a socket address ({:?}): {}", ADDR_ENV, addr, e))?,
            None => default_addr(),
        };

        let log_filter = non_empty(LOG_ENV).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Config {
            database_path,
            bind_addr,
            log_filter,
        })
    }
}
