//! The artifact store: a directory of compressed dumps plus their sidecars.
//!
//! An artifact is only *valid* when its metadata record can be read. Files
//! that parse as artifact names but have no readable record (a crash between
//! the dump and the metadata write, a sidecar deleted by hand) are reported
//! as orphaned and never restored, used as a base, or counted for retention.

pub mod artifact;
pub mod metadata;

pub use artifact::{ArtifactName, BackupType};
pub use metadata::{sidecar_path, BackupMetadata, MetadataStore, SidecarMetadataStore};

use crate::utils::{BackupError, Result, Stage};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// An artifact together with its metadata record.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub name: ArtifactName,
    pub metadata: BackupMetadata,
}

impl StoredArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Type as recorded in metadata, which wins over the file name.
    pub fn backup_type(&self) -> BackupType {
        self.metadata.backup_type
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.metadata.timestamp
    }
}

/// Result of scanning the store directory.
#[derive(Debug, Default)]
pub struct Listing {
    /// Artifacts with metadata, oldest first
    pub valid: Vec<StoredArtifact>,
    /// Artifact files without a usable metadata record
    pub orphaned: Vec<PathBuf>,
}

pub struct ArtifactStore {
    dir: PathBuf,
    metadata: Arc<dyn MetadataStore>,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            dir: dir.into(),
            metadata,
        }
    }

    /// Store backed by JSON sidecars in `dir`.
    pub fn with_sidecars(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, Arc::new(SidecarMetadataStore))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_store(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(BackupError::io(Stage::Dump))
    }

    /// Scan the directory, pairing every artifact file with its metadata.
    pub async fn scan(&self) -> Result<Listing> {
        let mut listing = Listing::default();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(BackupError::io(Stage::Resolve)(e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(BackupError::io(Stage::Resolve))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = ArtifactName::parse(&file_name) else {
                continue;
            };
            let path = entry.path();

            match self.metadata.read(&path).await {
                Ok(Some(metadata)) => listing.valid.push(StoredArtifact {
                    path,
                    name,
                    metadata,
                }),
                Ok(None) => {
                    warn!("Ignoring {}: no metadata record", file_name);
                    listing.orphaned.push(path);
                }
                Err(e) => {
                    warn!("Ignoring {}: {}", file_name, e);
                    listing.orphaned.push(path);
                }
            }
        }

        listing
            .valid
            .sort_by(|a, b| a.created().cmp(&b.created()).then_with(|| a.path.cmp(&b.path)));
        listing.orphaned.sort();

        Ok(listing)
    }

    /// Valid artifacts, optionally of one type, oldest first.
    pub async fn list(&self, backup_type: Option<BackupType>) -> Result<Vec<StoredArtifact>> {
        let listing = self.scan().await?;
        Ok(listing
            .valid
            .into_iter()
            .filter(|a| backup_type.map_or(true, |t| a.backup_type() == t))
            .collect())
    }

    /// Newest valid artifact by metadata timestamp.
    pub async fn latest(&self, backup_type: Option<BackupType>) -> Result<Option<StoredArtifact>> {
        Ok(self.list(backup_type).await?.pop())
    }

    /// Load one artifact by path. Relative paths that do not exist as given
    /// are looked up inside the store directory.
    pub async fn load(&self, path: &Path) -> Result<StoredArtifact> {
        let path = if path.is_relative() && !tokio::fs::try_exists(path).await.unwrap_or(false) {
            self.dir.join(path)
        } else {
            path.to_path_buf()
        };

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BackupError::NotFound(path.display().to_string()));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = ArtifactName::parse(&file_name).ok_or_else(|| BackupError::InvalidArtifact {
            stage: Stage::Resolve,
            artifact: file_name.clone(),
            reason: "file name does not follow {database}_{type}_{YYYYMMDD_HHMMSS}.sql.gz".into(),
        })?;

        let metadata = self
            .metadata
            .read(&path)
            .await?
            .ok_or_else(|| BackupError::InvalidArtifact {
                stage: Stage::Resolve,
                artifact: file_name,
                reason: "no metadata record".into(),
            })?;

        Ok(StoredArtifact {
            path,
            name,
            metadata,
        })
    }

    /// Find a valid artifact by file name: exact match first, then a
    /// suffix/partial match on the name stem. With several partial matches
    /// the newest wins.
    pub async fn find_by_name(
        &self,
        reference: &str,
        backup_type: Option<BackupType>,
    ) -> Result<Option<StoredArtifact>> {
        let wanted = Path::new(reference)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| reference.to_string());
        if wanted.is_empty() {
            return Ok(None);
        }

        let candidates = self.list(backup_type).await?;

        if let Some(exact) = candidates.iter().find(|a| a.file_name() == wanted) {
            return Ok(Some(exact.clone()));
        }

        let wanted_stem = artifact::split_suffix(&wanted)
            .map(|(stem, _)| stem.to_string())
            .unwrap_or(wanted);
        let mut partial: Vec<StoredArtifact> = candidates
            .into_iter()
            .filter(|a| {
                let stem = a.name.stem();
                stem.ends_with(&wanted_stem) || wanted_stem.ends_with(&stem)
            })
            .collect();

        if partial.len() > 1 {
            warn!(
                "'{}' matches {} artifacts, using the newest",
                reference,
                partial.len()
            );
        }
        Ok(partial.pop())
    }

    /// Delete an artifact, then its metadata record.
    pub async fn remove(&self, artifact: &StoredArtifact) -> Result<()> {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BackupError::io(Stage::Retention)(e)),
        }
        self.metadata.remove(&artifact.path).await
    }
}
