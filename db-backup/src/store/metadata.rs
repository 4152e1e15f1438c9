//! Metadata sidecars.
//!
//! Each artifact has a JSON record next to it sharing its stem
//! (`travel_full_20240101_000000.sql.gz` → `travel_full_20240101_000000.json`).
//! The location is derived from the artifact path alone, so no index is
//! needed. Orchestration code only talks to [`MetadataStore`], so the
//! sidecar layout can be swapped for a real index later.

use super::artifact::{split_suffix, BackupType};
use crate::codec::Compression;
use crate::utils::{BackupError, Result, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Sidecar record describing one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub database: String,
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub file_size: u64,
    pub file_hash: String,
    pub compression: String,

    /// Artifact file name of the full backup an incremental builds on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backup: Option<String>,

    /// Tables captured by an incremental; may be empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_tables: Option<Vec<String>>,
}

impl BackupMetadata {
    pub fn codec(&self) -> Option<Compression> {
        Compression::from_name(&self.compression)
    }

    /// An incremental that captured no tables; restoring it changes nothing.
    pub fn is_empty_incremental(&self) -> bool {
        self.backup_type == BackupType::Incremental
            && self.modified_tables.as_ref().map_or(true, |t| t.is_empty())
    }
}

/// Storage for artifact metadata records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist the record for `artifact`, replacing any previous one.
    async fn write(&self, artifact: &Path, metadata: &BackupMetadata) -> Result<()>;

    /// Record for `artifact`, or `None` if there is none.
    async fn read(&self, artifact: &Path) -> Result<Option<BackupMetadata>>;

    /// Drop the record for `artifact`. Missing records are not an error.
    async fn remove(&self, artifact: &Path) -> Result<()>;
}

/// JSON sidecar files next to each artifact.
#[derive(Debug, Clone, Default)]
pub struct SidecarMetadataStore;

/// Path of the sidecar belonging to `artifact`.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match split_suffix(&file_name) {
        Some((stem, _)) => artifact.with_file_name(format!("{}.json", stem)),
        None => artifact.with_extension("json"),
    }
}

#[async_trait]
impl MetadataStore for SidecarMetadataStore {
    async fn write(&self, artifact: &Path, metadata: &BackupMetadata) -> Result<()> {
        let path = sidecar_path(artifact);
        let json = serde_json::to_vec_pretty(metadata).map_err(|source| BackupError::Metadata {
            stage: Stage::WriteMetadata,
            path: path.clone(),
            source,
        })?;

        // Write-then-rename so readers never observe a half-written record.
        let tmp = path.with_extension("json.tmp");
        let io = BackupError::io(Stage::WriteMetadata);
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io(e));
        }
        Ok(())
    }

    async fn read(&self, artifact: &Path) -> Result<Option<BackupMetadata>> {
        let path = sidecar_path(artifact);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackupError::io(Stage::Resolve)(e)),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|source| BackupError::Metadata {
                stage: Stage::Resolve,
                path,
                source,
            })
    }

    async fn remove(&self, artifact: &Path) -> Result<()> {
        match tokio::fs::remove_file(sidecar_path(artifact)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::io(Stage::Retention)(e)),
        }
    }
}
