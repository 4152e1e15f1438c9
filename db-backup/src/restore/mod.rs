//! Restore orchestration.
//!
//! Order of operations, all failing before the target is touched unless
//! noted:
//! 1. resolve the reference to a valid artifact
//! 2. resolve its chain (incrementals need their base full)
//! 3. check size and SHA-256 of every artifact in the chain
//! 4. drop and recreate the target; always for a two-link chain, whose
//!    base must land in an empty database, otherwise when asked
//! 5. apply each artifact in order, stopping at the first failing
//!    statement; a failure here can leave the target partially restored

pub mod chain;

use crate::backend::{ApplyOptions, Capabilities};
use crate::codec::checksum::{compute_file_digest, is_sha256_hex};
use crate::context::Context;
use crate::store::{BackupType, StoredArtifact};
use crate::utils::format::{format_bytes, format_duration};
use crate::utils::{BackupError, Result, Stage};
use chain::{resolve_chain, RestoreChain};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How a caller names the artifact to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupRef {
    /// Artifact path, absolute or relative to the store directory
    Path(PathBuf),
    /// Newest valid artifact of any type
    Latest,
    /// Newest valid full artifact
    LatestFull,
}

impl FromStr for BackupRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("backup reference must not be empty".to_string()),
            "latest" => Ok(BackupRef::Latest),
            "latest-full" | "latest_full" => Ok(BackupRef::LatestFull),
            path => Ok(BackupRef::Path(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for BackupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupRef::Path(path) => write!(f, "{}", path.display()),
            BackupRef::Latest => f.write_str("latest"),
            BackupRef::LatestFull => f.write_str("latest-full"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Database to restore into
    pub target: String,
    /// Drop (if present) and create the target before the first apply.
    /// Ignored for an incremental applied with its base, which always
    /// recreates.
    pub create_target: bool,
    /// Apply an incremental's base first; without it only the named
    /// artifact is applied
    pub apply_chain: bool,
}

impl RestoreOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            create_target: true,
            apply_chain: true,
        }
    }
}

/// One artifact of the chain as applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    pub artifact: String,
    pub backup_type: BackupType,
    /// Decompressed bytes fed to the apply capability
    pub bytes: u64,
    /// Incremental with no captured tables, nothing to apply
    pub skipped: bool,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub target: String,
    pub artifact: StoredArtifact,
    pub steps: Vec<AppliedStep>,
    pub duration: Duration,
}

pub struct RestoreOrchestrator<'a> {
    ctx: Context<'a>,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Resolve a reference to a valid artifact.
    pub async fn resolve(&self, reference: &BackupRef) -> Result<StoredArtifact> {
        match reference {
            BackupRef::Path(path) => self.ctx.store.load(path).await,
            BackupRef::Latest => self
                .ctx
                .store
                .latest(None)
                .await?
                .ok_or_else(|| BackupError::NotFound(reference.to_string())),
            BackupRef::LatestFull => self
                .ctx
                .store
                .latest(Some(BackupType::Full))
                .await?
                .ok_or_else(|| BackupError::NotFound(reference.to_string())),
        }
    }

    /// Confirm the artifact on disk matches its recorded size and checksum,
    /// and that its codec is known.
    pub async fn verify_integrity(&self, artifact: &StoredArtifact) -> Result<()> {
        let name = artifact.file_name();
        let recorded = &artifact.metadata;
        let integrity = |detail: String| BackupError::Integrity {
            artifact: name.clone(),
            detail,
        };

        if recorded.codec().is_none() {
            return Err(BackupError::InvalidArtifact {
                stage: Stage::VerifyIntegrity,
                artifact: name.clone(),
                reason: format!("unknown compression '{}'", recorded.compression),
            });
        }
        if !is_sha256_hex(&recorded.file_hash) {
            return Err(integrity(format!(
                "recorded hash '{}' is not a SHA-256 hex digest",
                recorded.file_hash
            )));
        }

        let size = tokio::fs::metadata(&artifact.path)
            .await
            .map_err(BackupError::io(Stage::VerifyIntegrity))?
            .len();
        if size != recorded.file_size {
            return Err(integrity(format!(
                "size is {} bytes, metadata records {}",
                size, recorded.file_size
            )));
        }

        let digest = compute_file_digest(&artifact.path, self.ctx.chunk_size())
            .await
            .map_err(BackupError::io(Stage::VerifyIntegrity))?;
        if !digest.hash.eq_ignore_ascii_case(&recorded.file_hash) {
            return Err(integrity(format!(
                "sha256 is {}, metadata records {}",
                digest.hash, recorded.file_hash
            )));
        }

        Ok(())
    }

    pub async fn restore(
        &self,
        reference: &BackupRef,
        options: &RestoreOptions,
    ) -> Result<RestoreOutcome> {
        let artifact = self.resolve(reference).await?;
        self.restore_artifact(artifact, options).await
    }

    /// Restore an already resolved artifact.
    pub async fn restore_artifact(
        &self,
        artifact: StoredArtifact,
        options: &RestoreOptions,
    ) -> Result<RestoreOutcome> {
        let started = Instant::now();
        let caps = self.ctx.capabilities;
        Capabilities::require("apply", &caps.apply, Stage::Apply)?;

        info!("Restoring {} into {}", artifact.file_name(), options.target);

        let chain = if options.apply_chain {
            resolve_chain(self.ctx.store, artifact.clone()).await?
        } else {
            if artifact.backup_type() == BackupType::Incremental {
                warn!(
                    "Applying {} without its base backup",
                    artifact.file_name()
                );
            }
            RestoreChain::single(artifact.clone())
        };

        let recreate = options.create_target || chain.len() > 1;
        if recreate {
            Capabilities::require("create-database", &caps.create_database, Stage::DropCreate)?;
        }
        if recreate && !options.create_target {
            info!(
                "{} needs its base applied to a fresh database, recreating {}",
                artifact.file_name(),
                options.target
            );
        }

        for link in chain.links() {
            self.verify_integrity(link).await?;
        }

        if recreate {
            self.recreate_target(&options.target).await?;
        }

        let mut steps = Vec::with_capacity(chain.len());
        for link in chain.links() {
            steps.push(self.apply_one(link, &options.target).await?);
        }

        let duration = started.elapsed();
        info!(
            "Restored {} into {} ({} steps) in {}",
            artifact.file_name(),
            options.target,
            steps.len(),
            format_duration(duration)
        );

        Ok(RestoreOutcome {
            target: options.target.clone(),
            artifact,
            steps,
            duration,
        })
    }

    async fn recreate_target(&self, target: &str) -> Result<()> {
        let backend = self.ctx.backend;
        info!("Recreating database {}", target);
        backend.drop_database(target).await?;
        backend.create_database(target).await
    }

    async fn apply_one(&self, artifact: &StoredArtifact, target: &str) -> Result<AppliedStep> {
        let name = artifact.file_name();

        if artifact.metadata.is_empty_incremental() {
            info!("{} captured no tables, nothing to apply", name);
            return Ok(AppliedStep {
                artifact: name,
                backup_type: artifact.backup_type(),
                bytes: 0,
                skipped: true,
            });
        }

        let codec = artifact
            .metadata
            .codec()
            .ok_or_else(|| BackupError::InvalidArtifact {
                stage: Stage::Apply,
                artifact: name.clone(),
                reason: format!("unknown compression '{}'", artifact.metadata.compression),
            })?;
        let mut reader = codec
            .open_decoded(&artifact.path, self.ctx.chunk_size())
            .await
            .map_err(BackupError::io(Stage::Apply))?;

        let options = ApplyOptions {
            single_transaction: self.ctx.config.restore.single_transaction,
        };
        let bytes = self
            .ctx
            .backend
            .apply(target, &mut *reader, options)
            .await
            .map_err(|e| match e {
                BackupError::ApplyFailure { target, stderr, .. } => BackupError::ApplyFailure {
                    target,
                    artifact: name.clone(),
                    stderr,
                },
                other => other,
            })?;

        info!("Applied {} ({})", name, format_bytes(bytes));

        Ok(AppliedStep {
            artifact: name,
            backup_type: artifact.backup_type(),
            bytes,
            skipped: false,
        })
    }
}
