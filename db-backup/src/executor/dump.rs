//! Dump execution: backend dump stream → compressor → artifact file.
//!
//! Output goes to `<artifact>.partial` and is renamed into place only after
//! the compressor has been shut down and the file synced, so an artifact
//! name on disk always refers to a complete stream. Every failure path
//! removes the partial file.

use crate::backend::{DatabaseBackend, DumpRequest};
use crate::codec::Compression;
use crate::utils::format::{format_bytes, format_duration, format_rate};
use crate::utils::{BackupError, Result, Stage};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// What goes into an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpSource {
    /// Output of the backend dump capability
    Dump(DumpRequest),
    /// Fixed text, used for incrementals with nothing to capture
    Header(String),
}

#[derive(Debug)]
pub struct DumpOutput {
    pub path: PathBuf,
    /// Uncompressed bytes written
    pub raw_bytes: u64,
    pub duration: Duration,
}

pub struct DumpExecutor<'a> {
    backend: &'a dyn DatabaseBackend,
    compression: Compression,
    level: Option<i32>,
}

impl<'a> DumpExecutor<'a> {
    pub fn new(backend: &'a dyn DatabaseBackend, compression: Compression, level: Option<i32>) -> Self {
        Self {
            backend,
            compression,
            level,
        }
    }

    /// Write a compressed artifact at `path`. Refuses to replace an
    /// existing artifact.
    pub async fn write_artifact(&self, path: &Path, source: &DumpSource) -> Result<DumpOutput> {
        let started = Instant::now();

        if tokio::fs::try_exists(path)
            .await
            .map_err(BackupError::io(Stage::Dump))?
        {
            return Err(BackupError::ArtifactExists(path.to_path_buf()));
        }

        let partial = partial_path(path);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial)
            .await
            .map_err(BackupError::io(Stage::Dump))?;

        let result = self.stream_into(file, source).await;
        let raw_bytes = match result {
            Ok(raw_bytes) => raw_bytes,
            Err(e) => {
                discard(&partial).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&partial, path).await {
            discard(&partial).await;
            return Err(BackupError::io(Stage::Dump)(e));
        }

        let duration = started.elapsed();
        info!(
            "Dumped {} uncompressed ({}) in {}",
            format_bytes(raw_bytes),
            format_rate(raw_bytes, duration),
            format_duration(duration)
        );

        Ok(DumpOutput {
            path: path.to_path_buf(),
            raw_bytes,
            duration,
        })
    }

    async fn stream_into(&self, file: tokio::fs::File, source: &DumpSource) -> Result<u64> {
        // Second handle for fsync once the encoder has consumed the first.
        let sync_handle = file
            .try_clone()
            .await
            .map_err(BackupError::io(Stage::Dump))?;
        let mut encoder = self.compression.encoder(file, self.level);

        let raw_bytes = match source {
            DumpSource::Dump(request) => {
                debug!("Streaming dump through {}", self.compression);
                self.backend.dump(request, &mut *encoder).await?
            }
            DumpSource::Header(text) => {
                encoder
                    .write_all(text.as_bytes())
                    .await
                    .map_err(BackupError::io(Stage::Compress))?;
                text.len() as u64
            }
        };

        encoder
            .shutdown()
            .await
            .map_err(BackupError::io(Stage::Compress))?;
        drop(encoder);
        sync_handle
            .sync_all()
            .await
            .map_err(BackupError::io(Stage::Compress))?;

        Ok(raw_bytes)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", partial.display(), e),
    }
}
