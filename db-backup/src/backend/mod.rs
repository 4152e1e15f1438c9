//! The external dump/restore capability.
//!
//! Everything this crate needs from the database server sits behind
//! [`DatabaseBackend`]: streaming a logical dump, applying a dump with
//! stop-on-error semantics, creating and dropping databases, and reading
//! catalog statistics. Any backend offering these is substitutable; the
//! shipped one drives `pg_dump`/`psql` and queries the catalog with sqlx.

#[cfg(test)]
pub mod mock;
pub mod postgres;

pub use postgres::PostgresBackend;

use crate::utils::{BackupError, Result, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

/// What part of the database a dump contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    SchemaOnly,
    DataOnly,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    /// Tables to include; empty means every table
    pub tables: Vec<String>,
    pub mode: DumpMode,
    /// Emit DROP ... IF EXISTS before each object so the dump can be
    /// applied over an existing copy of those tables
    pub clean: bool,
}

impl DumpRequest {
    pub fn all(mode: DumpMode) -> Self {
        Self {
            tables: Vec::new(),
            mode,
            clean: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Run the whole dump as one transaction
    pub single_transaction: bool,
}

/// Shape of the row set returned by a sample read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleShape {
    pub rows: usize,
    pub columns: usize,
}

/// Whether a capability can be used, and why not if it can't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Available,
    Unavailable(String),
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }
}

/// Result of the one-shot capability probe run at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub dump: Capability,
    pub apply: Capability,
    pub create_database: Capability,
    pub change_tracking: Capability,
}

impl Capabilities {
    pub fn all_available() -> Self {
        Self {
            dump: Capability::Available,
            apply: Capability::Available,
            create_database: Capability::Available,
            change_tracking: Capability::Available,
        }
    }

    pub fn entries(&self) -> [(&'static str, &Capability); 4] {
        [
            ("dump", &self.dump),
            ("apply", &self.apply),
            ("create-database", &self.create_database),
            ("change-tracking", &self.change_tracking),
        ]
    }

    /// Fail with `Unavailable` unless `capability` is available.
    pub fn require(name: &'static str, capability: &Capability, stage: Stage) -> Result<()> {
        match capability {
            Capability::Available => Ok(()),
            Capability::Unavailable(reason) => Err(BackupError::Unavailable {
                stage,
                capability: name,
                reason: reason.clone(),
            }),
        }
    }
}

#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Database that backups are taken from.
    fn source_database(&self) -> &str;

    /// Check which capabilities are usable with the current credentials
    /// and installed tools. Never fails; problems become `Unavailable`.
    async fn probe(&self) -> Capabilities;

    /// Stream a logical dump of the source database into `sink`. Returns
    /// the number of uncompressed bytes written.
    async fn dump(
        &self,
        request: &DumpRequest,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;

    /// Execute a logical dump read from `source` against `target`, stopping
    /// at the first failing statement. Returns the number of bytes consumed.
    async fn apply(
        &self,
        target: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        options: ApplyOptions,
    ) -> Result<u64>;

    async fn create_database(&self, name: &str) -> Result<()>;

    /// Drop `name`; a database that does not exist is not an error.
    async fn drop_database(&self, name: &str) -> Result<()>;

    /// Tables of the source database whose latest maintenance timestamp
    /// (vacuum / analyze, manual or automatic) is after `since`.
    async fn tables_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<String>>;

    async fn list_tables(&self, database: &str) -> Result<Vec<String>>;

    async fn row_count(&self, database: &str, table: &str) -> Result<u64>;

    /// Read at most one row from `table`.
    async fn sample_read(&self, database: &str, table: &str) -> Result<SampleShape>;
}
