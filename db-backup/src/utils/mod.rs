//! Utility modules shared by the backup, restore and verify pipelines.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{BackupError, Result, Stage};
