//! Configuration for the gridbase write path

use serde::{Deserialize, Serialize};

/// Connection and batching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Database connection URL (postgres://, mysql:// or sqlite:)
    pub database_url: String,

    /// Number of records written per chunk by the batch coordinator
    #[serde(default = "default_calc_chunk_size")]
    pub calc_chunk_size: usize,

    /// Upper bound on bind parameters in one staging insert statement
    #[serde(default = "default_max_bind_params")]
    pub max_bind_params: usize,

    /// Maximum database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections kept in pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Database connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Enable SQL query logging
    #[serde(default)]
    pub enable_sql_logging: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            calc_chunk_size: default_calc_chunk_size(),
            max_bind_params: default_max_bind_params(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_secs: default_connection_timeout(),
            enable_sql_logging: false,
        }
    }
}

impl GridConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }
}

fn default_calc_chunk_size() -> usize {
    1000
}

fn default_max_bind_params() -> usize {
    30_000
}

fn default_max_connections() -> u32 {
    50
}

fn default_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    30
}
