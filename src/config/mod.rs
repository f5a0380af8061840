/// Configuration management for the stagestore service
///
/// Handles server configuration, the session manifest location, batch limits and
/// startup cleanup behavior. Every value can be overridden through a `STAGESTORE_*`
/// environment variable.

use crate::storage::writer::{BatchLimits, MAX_BYTES_PER_BATCH, MAX_TUPLES_PER_BATCH};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Store list used when STAGESTORE_STORES is unset
const DEFAULT_STORES: &str = "memory";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Checkpoint storage configuration
    pub storage: StorageConfig,
    /// Startup sweep configuration
    pub cleanup: CleanupConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the session manifest (sessions.db)
    pub data_dir: PathBuf,
    /// Physical stores the engine exposes; the first one is the fallback default
    pub stores: Vec<String>,
    /// Byte budget of one flushed batch
    pub max_batch_bytes: usize,
    /// Row ceiling of one flushed batch
    pub max_batch_rows: usize,
    /// Default page size of paged relational reads
    pub page_size: usize,
    /// How long a schema lock may be waited for before reporting a deadlock
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Also drop namespaces whose names merely look like checkpoint namespaces
    pub name_shape_sweep: bool,
}

impl StorageConfig {
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_bytes: self.max_batch_bytes,
            max_rows: self.max_batch_rows,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("STAGESTORE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("STAGESTORE_PORT", 3005),
            },
            storage: StorageConfig {
                data_dir: std::env::var("STAGESTORE_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string())
                    .into(),
                stores: std::env::var("STAGESTORE_STORES")
                    .unwrap_or_else(|_| DEFAULT_STORES.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                max_batch_bytes: env_or("STAGESTORE_MAX_BATCH_BYTES", MAX_BYTES_PER_BATCH),
                max_batch_rows: env_or("STAGESTORE_MAX_BATCH_ROWS", MAX_TUPLES_PER_BATCH),
                page_size: env_or("STAGESTORE_PAGE_SIZE", 1_000),
                lock_timeout_ms: env_or("STAGESTORE_LOCK_TIMEOUT_MS", 10_000),
            },
            cleanup: CleanupConfig {
                name_shape_sweep: env_or("STAGESTORE_NAME_SHAPE_SWEEP", false),
            },
        }
    }
}
