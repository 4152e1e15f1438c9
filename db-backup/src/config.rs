//! Configuration management for db-backup.
//!
//! Loads configuration from a TOML file, then applies environment overrides
//! (libpq-style `PG*` variables plus `BACKUP_DIR`, optionally from `.env`).
//! The resulting value is built once in `main` and handed to every
//! orchestrator by reference.

use crate::codec::compression::Compression;
use crate::retention::RetentionPolicy;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub retention: RetentionPolicy,
    pub restore: RestoreConfig,
    pub verify: VerifyConfig,
    pub tools: ToolsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,

    /// Passed to subprocesses through `PGPASSWORD`, never on the command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Database that gets backed up, and the default restore target
    pub name: String,

    /// Database to connect to for CREATE/DROP DATABASE
    pub maintenance_database: String,

    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding artifacts and their metadata sidecars
    pub dir: PathBuf,

    /// Compression algorithm (gzip, zstd)
    pub compression: Compression,

    /// Compression level; `None` uses the codec default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<i32>,

    /// Streaming chunk size in bytes (default: 4KB)
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Wrap each artifact apply in a single transaction (all-or-nothing)
    pub single_transaction: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Tables whose row counts are checked; empty means every table
    pub key_tables: Vec<String>,

    /// Prefix for scratch database names
    pub scratch_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub pg_dump: PathBuf,
    pub psql: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

// Default values
const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            name: "postgres".to_string(),
            maintenance_database: "postgres".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("backups"),
            compression: Compression::Gzip,
            compression_level: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            key_tables: Vec::new(),
            scratch_prefix: "verify".to_string(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pg_dump: PathBuf::from("pg_dump"),
            psql: PathBuf::from("psql"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Overlay libpq-style environment variables (and `.env`, if present).
    pub fn apply_env_overrides(&mut self) {
        let _ = dotenvy::dotenv();

        if let Ok(host) = std::env::var("PGHOST") {
            self.database.host = host;
        }
        if let Some(port) = std::env::var("PGPORT").ok().and_then(|v| v.parse().ok()) {
            self.database.port = port;
        }
        if let Ok(user) = std::env::var("PGUSER") {
            self.database.user = user;
        }
        if let Ok(password) = std::env::var("PGPASSWORD") {
            self.database.password = Some(password);
        }
        if let Ok(name) = std::env::var("PGDATABASE") {
            self.database.name = name;
        }
        if let Ok(dir) = std::env::var("BACKUP_DIR") {
            self.store.dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.name.trim().is_empty() {
            return Err(BackupError::Config("database.name must not be empty".into()));
        }
        if self.store.chunk_size == 0 {
            return Err(BackupError::Config("store.chunk_size must be greater than zero".into()));
        }
        if let Some(level) = self.store.compression_level {
            let (min, max) = self.store.compression.level_range();
            if level < min || level > max {
                return Err(BackupError::Config(format!(
                    "store.compression_level {} is outside {}..={} for {}",
                    level,
                    min,
                    max,
                    self.store.compression.name()
                )));
            }
        }
        if self.verify.scratch_prefix.is_empty() || self.verify.scratch_prefix.len() > 20 {
            return Err(BackupError::Config(
                "verify.scratch_prefix must be 1 to 20 characters".into(),
            ));
        }
        Ok(())
    }
}
