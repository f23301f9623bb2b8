//! Configuration for relay-storage

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay-storage")
}

/// How upload handles are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandleStrategy {
    /// Handle is the SHA-256 digest of the content; identical uploads share a handle
    Content,
    /// Handle is a monotonic timestamp token; every upload gets a fresh handle
    Time,
}

/// Which technology backs the metadata index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Sled,
    Sqlite,
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for stored files, staging area and index
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Address the HTTP API binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Base URL used to build retrieval links returned from uploads
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Largest accepted object in bytes
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: u64,

    /// Seconds an object stays retrievable after upload
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Seconds between retention sweep passes
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Handle derivation, fixed for a deployment
    #[serde(default = "default_handle_strategy")]
    pub handle_strategy: HandleStrategy,

    /// Metadata index backend
    #[serde(default = "default_index_backend")]
    pub index_backend: IndexBackend,

    /// Reject uploads that carry no Content-Length header
    #[serde(default)]
    pub require_content_length: bool,

    /// Bearer token for /admin routes (admin routes disabled when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_object_bytes() -> u64 {
    4_000_000
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    100
}

fn default_handle_strategy() -> HandleStrategy {
    HandleStrategy::Content
}

fn default_index_backend() -> IndexBackend {
    IndexBackend::Sled
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            bind_address: default_bind_address(),
            http_port: default_http_port(),
            public_url: default_public_url(),
            max_object_bytes: default_max_object_bytes(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            handle_strategy: default_handle_strategy(),
            index_backend: default_index_backend(),
            require_content_length: false,
            admin_token: None,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject knob combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_object_bytes == 0 {
            return Err(RelayError::Config("max_object_bytes must be positive".into()));
        }
        if self.retention_secs == 0 {
            return Err(RelayError::Config("retention_secs must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(RelayError::Config("sweep_interval_secs must be positive".into()));
        }
        url::Url::parse(&self.public_url)
            .map_err(|e| RelayError::Config(format!("public_url: {}", e)))?;
        Ok(())
    }

    /// Directory holding one regular file per live handle
    pub fn files_dir(&self) -> PathBuf {
        self.storage_dir.join("files")
    }

    /// Directory for in-flight uploads; must share a filesystem with `files_dir`
    pub fn staging_dir(&self) -> PathBuf {
        self.storage_dir.join("incoming")
    }

    /// Get metadata index path
    pub fn index_path(&self) -> PathBuf {
        match self.index_backend {
            IndexBackend::Sled => self.storage_dir.join("index.sled"),
            IndexBackend::Sqlite => self.storage_dir.join("index.db"),
        }
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
