//! Database Backup Library
//!
//! Checksummed, compressed backups of a PostgreSQL database (full,
//! incremental, schema-only, data-only), chain-aware restore, and
//! verification by restoring into a scratch database.

pub mod backend;
pub mod codec;
pub mod config;
pub mod context;
pub mod executor;
pub mod restore;
pub mod retention;
pub mod store;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use context::Context;
pub use utils::errors::{BackupError, Result, Stage};
