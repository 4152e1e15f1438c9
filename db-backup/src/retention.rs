//! Count-based retention per backup type.

use crate::store::{ArtifactStore, BackupType};
use crate::utils::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Maximum number of artifacts kept for each backup type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub full: usize,
    pub incremental: usize,
    pub schema: usize,
    pub data: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            full: 4,
            incremental: 6,
            schema: 1,
            data: 1,
        }
    }
}

impl RetentionPolicy {
    pub fn cap(&self, backup_type: BackupType) -> usize {
        match backup_type {
            BackupType::Full => self.full,
            BackupType::Incremental => self.incremental,
            BackupType::Schema => self.schema,
            BackupType::Data => self.data,
        }
    }
}

/// What one retention pass did for one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub backup_type: BackupType,
    pub kept: usize,
    pub removed: Vec<PathBuf>,
}

pub struct RetentionManager<'a> {
    store: &'a ArtifactStore,
    policy: &'a RetentionPolicy,
}

impl<'a> RetentionManager<'a> {
    pub fn new(store: &'a ArtifactStore, policy: &'a RetentionPolicy) -> Self {
        Self { store, policy }
    }

    /// Delete the oldest artifacts of `backup_type` until at most the
    /// configured number remain. Orphaned files are never counted or removed.
    pub async fn enforce(&self, backup_type: BackupType) -> Result<RetentionReport> {
        let artifacts = self.store.list(Some(backup_type)).await?;
        let cap = self.policy.cap(backup_type);
        let excess = artifacts.len().saturating_sub(cap);

        let mut removed = Vec::with_capacity(excess);
        for artifact in artifacts.iter().take(excess) {
            self.store.remove(artifact).await?;
            info!(
                "Retention removed {} ({} cap {})",
                artifact.file_name(),
                backup_type,
                cap
            );
            removed.push(artifact.path.clone());
        }

        Ok(RetentionReport {
            backup_type,
            kept: artifacts.len() - excess,
            removed,
        })
    }

    pub async fn enforce_all(&self) -> Result<Vec<RetentionReport>> {
        let mut reports = Vec::with_capacity(BackupType::ALL.len());
        for backup_type in BackupType::ALL {
            reports.push(self.enforce(backup_type).await?);
        }
        Ok(reports)
    }
}
