//! Restore chains: the ordered artifacts needed to rebuild a database.
//!
//! A full, schema or data artifact restores on its own. An incremental
//! needs the full backup it was taken against, so its chain is
//! `[base full, incremental]`. Chains never grow deeper than that.

use crate::store::{ArtifactStore, BackupType, StoredArtifact};
use crate::utils::{BackupError, Result};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RestoreChain {
    links: Vec<StoredArtifact>,
}

impl RestoreChain {
    pub fn single(artifact: StoredArtifact) -> Self {
        Self {
            links: vec![artifact],
        }
    }

    /// Artifacts in apply order, base first.
    pub fn links(&self) -> &[StoredArtifact] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Build the chain ending in `artifact`. Fails closed when an incremental's
/// base cannot be found among the valid full artifacts of `store`.
pub async fn resolve_chain(store: &ArtifactStore, artifact: StoredArtifact) -> Result<RestoreChain> {
    if artifact.backup_type() != BackupType::Incremental {
        return Ok(RestoreChain::single(artifact));
    }

    let missing = |base: &str| BackupError::MissingBaseBackup {
        artifact: artifact.file_name(),
        base: base.to_string(),
    };

    let base_name = match artifact.metadata.base_backup.as_deref() {
        Some(name) if !name.trim().is_empty() => name,
        _ => return Err(missing("(none recorded)")),
    };

    let base = store
        .find_by_name(base_name, Some(BackupType::Full))
        .await?
        .ok_or_else(|| missing(base_name))?;

    debug!("{} builds on {}", artifact.file_name(), base.file_name());

    Ok(RestoreChain {
        links: vec![base, artifact],
    })
}
