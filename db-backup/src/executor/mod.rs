//! Backup orchestration: composes change detection, dumping, compression,
//! checksumming and the metadata write into one backup of a given type.
//!
//! The pipeline for every type is:
//! - plan (for incrementals: find the base full, detect changed tables)
//! - dump through the compressor into a partial file, rename into place
//! - hash the finished artifact
//! - write the metadata record
//! - optionally enforce retention for the produced type

pub mod changes;
pub mod dump;

use crate::backend::{Capabilities, Capability, DumpMode, DumpRequest};
use crate::codec::compute_file_digest;
use crate::context::Context;
use crate::retention::{RetentionManager, RetentionReport};
use crate::store::{ArtifactName, BackupMetadata, BackupType, StoredArtifact};
use crate::utils::format::{format_bytes, format_duration};
use crate::utils::{BackupError, Result, Stage};
use changes::ChangeDetector;
use chrono::{DateTime, Utc};
use dump::{DumpExecutor, DumpSource};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct BackupOptions {
    /// Run retention for the produced type after a successful backup
    pub enforce_retention: bool,
}

/// Result of a successful backup.
#[derive(Debug)]
pub struct BackupOutcome {
    pub requested: BackupType,
    pub artifact: StoredArtifact,
    pub raw_bytes: u64,
    pub duration: Duration,
    pub retention: Option<RetentionReport>,
}

impl BackupOutcome {
    /// An incremental was requested but a full backup was taken.
    pub fn fell_back_to_full(&self) -> bool {
        self.requested == BackupType::Incremental && self.artifact.backup_type() == BackupType::Full
    }
}

/// Resolved decision of what to produce.
#[derive(Debug)]
struct Plan {
    backup_type: BackupType,
    source: DumpSource,
    base_backup: Option<String>,
    modified_tables: Option<Vec<String>>,
}

impl Plan {
    fn whole(backup_type: BackupType, mode: DumpMode) -> Self {
        Self {
            backup_type,
            source: DumpSource::Dump(DumpRequest::all(mode)),
            base_backup: None,
            modified_tables: None,
        }
    }
}

pub struct BackupOrchestrator<'a> {
    ctx: Context<'a>,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    pub async fn create_backup(
        &self,
        requested: BackupType,
        options: BackupOptions,
    ) -> Result<BackupOutcome> {
        let started = Instant::now();
        let database = self.ctx.backend.source_database();
        let now = Utc::now();

        info!("Creating {} backup of {}", requested, database);

        let plan = self.plan(requested).await?;
        if let DumpSource::Dump(_) = plan.source {
            Capabilities::require("dump", &self.ctx.capabilities.dump, Stage::Dump)?;
        }

        self.ctx.store.ensure_dir().await?;
        let codec = self.ctx.config.store.compression;
        let name = ArtifactName::new(database, plan.backup_type, now, codec);
        let path = self.ctx.store.dir().join(name.file_name());

        let output = DumpExecutor::new(
            self.ctx.backend,
            codec,
            self.ctx.config.store.compression_level,
        )
        .write_artifact(&path, &plan.source)
        .await?;

        let digest = match compute_file_digest(&path, self.ctx.chunk_size()).await {
            Ok(digest) => digest,
            Err(e) => {
                remove_unrecorded(&path).await;
                return Err(BackupError::io(Stage::Checksum)(e));
            }
        };

        let metadata = BackupMetadata {
            database: database.to_string(),
            backup_type: plan.backup_type,
            timestamp: now,
            file_size: digest.size,
            file_hash: digest.hash,
            compression: codec.name().to_string(),
            base_backup: plan.base_backup,
            modified_tables: plan.modified_tables,
        };

        if let Err(e) = self.ctx.store.metadata_store().write(&path, &metadata).await {
            remove_unrecorded(&path).await;
            return Err(e);
        }

        let artifact = StoredArtifact {
            path,
            name,
            metadata,
        };

        info!(
            "Created {} ({}, sha256 {}) in {}",
            artifact.file_name(),
            format_bytes(artifact.metadata.file_size),
            &artifact.metadata.file_hash[..12],
            format_duration(started.elapsed())
        );

        let retention = if options.enforce_retention {
            let manager = RetentionManager::new(self.ctx.store, &self.ctx.config.retention);
            match manager.enforce(artifact.backup_type()).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Backup kept, but retention failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(BackupOutcome {
            requested,
            artifact,
            raw_bytes: output.raw_bytes,
            duration: started.elapsed(),
            retention,
        })
    }

    async fn plan(&self, requested: BackupType) -> Result<Plan> {
        match requested {
            BackupType::Full => Ok(Plan::whole(BackupType::Full, DumpMode::Both)),
            BackupType::Schema => Ok(Plan::whole(BackupType::Schema, DumpMode::SchemaOnly)),
            BackupType::Data => Ok(Plan::whole(BackupType::Data, DumpMode::DataOnly)),
            BackupType::Incremental => self.plan_incremental().await,
        }
    }

    async fn plan_incremental(&self) -> Result<Plan> {
        if let Capability::Unavailable(reason) = &self.ctx.capabilities.change_tracking {
            warn!(
                "Change tracking unavailable ({}), taking a full backup instead",
                reason
            );
            return Ok(Plan::whole(BackupType::Full, DumpMode::Both));
        }

        let Some(base) = self.ctx.store.latest(Some(BackupType::Full)).await? else {
            info!("No full backup to build on, taking a full backup instead");
            return Ok(Plan::whole(BackupType::Full, DumpMode::Both));
        };

        let changed = ChangeDetector::new(self.ctx.backend)
            .tables_modified_since(base.created())
            .await?;
        let modified: Vec<String> = changed.into_iter().collect();

        info!(
            "{} tables modified since {}",
            modified.len(),
            base.file_name()
        );

        let source = if modified.is_empty() {
            DumpSource::Header(empty_incremental_header(
                self.ctx.backend.source_database(),
                &base.file_name(),
                base.created(),
            ))
        } else {
            DumpSource::Dump(DumpRequest {
                tables: modified.clone(),
                mode: DumpMode::Both,
                clean: true,
            })
        };

        Ok(Plan {
            backup_type: BackupType::Incremental,
            source,
            base_backup: Some(base.file_name()),
            modified_tables: Some(modified),
        })
    }
}

fn empty_incremental_header(database: &str, base: &str, since: DateTime<Utc>) -> String {
    format!(
        "-- Incremental backup of {}\n-- Base: {}\n-- No tables modified since {}\n",
        database,
        base,
        since.to_rfc3339()
    )
}

/// Remove an artifact whose metadata could not be recorded. If this fails
/// too, the file stays behind as an orphan and is ignored by readers.
async fn remove_unrecorded(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(
            "Could not remove {} after failed backup, leaving it orphaned: {}",
            path.display(),
            e
        );
    }
}
