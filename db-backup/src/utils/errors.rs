//! Error types for backup, restore and verification.
//!
//! Every fatal error carries the pipeline stage it happened in so the
//! caller can report exactly where an operation stopped.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an operation was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe,
    Detect,
    Dump,
    Compress,
    Checksum,
    WriteMetadata,
    Resolve,
    VerifyIntegrity,
    ResolveChain,
    DropCreate,
    Apply,
    Verify,
    Retention,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Probe => "probe",
            Stage::Detect => "detect",
            Stage::Dump => "dump",
            Stage::Compress => "compress",
            Stage::Checksum => "checksum",
            Stage::WriteMetadata => "write-metadata",
            Stage::Resolve => "resolve",
            Stage::VerifyIntegrity => "verify-integrity",
            Stage::ResolveChain => "resolve-chain",
            Stage::DropCreate => "drop-create",
            Stage::Apply => "apply",
            Stage::Verify => "verify",
            Stage::Retention => "retention",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("[{stage}] Cannot reach database: {message}")]
    Connectivity { stage: Stage, message: String },

    #[error("[{stage}] {capability} is unavailable: {reason}")]
    Unavailable {
        stage: Stage,
        capability: &'static str,
        reason: String,
    },

    #[error("[dump] Dump failed ({status}): {stderr}")]
    DumpFailure { status: String, stderr: String },

    #[error("[verify-integrity] Integrity check failed for {artifact}: {detail}")]
    Integrity { artifact: String, detail: String },

    #[error("[resolve-chain] Base backup '{base}' of {artifact} not found")]
    MissingBaseBackup { artifact: String, base: String },

    #[error("[apply] Applying {artifact} to '{target}' failed: {stderr}")]
    ApplyFailure {
        target: String,
        artifact: String,
        stderr: String,
    },

    #[error("[resolve] No backup matches '{0}'")]
    NotFound(String),

    #[error("[{stage}] Artifact {artifact} is invalid: {reason}")]
    InvalidArtifact {
        stage: Stage,
        artifact: String,
        reason: String,
    },

    #[error("[dump] Artifact already exists: {}", .0.display())]
    ArtifactExists(PathBuf),

    #[error("[{stage}] I/O error: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("[{stage}] Malformed metadata {}: {source}", .path.display())]
    Metadata {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("[{stage}] Database error: {message}")]
    Database { stage: Stage, message: String },
}

impl BackupError {
    /// Stage the operation failed in, if the error belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BackupError::Config(_) => None,
            BackupError::Connectivity { stage, .. }
            | BackupError::Unavailable { stage, .. }
            | BackupError::InvalidArtifact { stage, .. }
            | BackupError::Io { stage, .. }
            | BackupError::Metadata { stage, .. }
            | BackupError::Database { stage, .. } => Some(*stage),
            BackupError::DumpFailure { .. } | BackupError::ArtifactExists(_) => Some(Stage::Dump),
            BackupError::Integrity { .. } => Some(Stage::VerifyIntegrity),
            BackupError::MissingBaseBackup { .. } => Some(Stage::ResolveChain),
            BackupError::ApplyFailure { .. } => Some(Stage::Apply),
            BackupError::NotFound(_) => Some(Stage::Resolve),
        }
    }

    pub fn io(stage: Stage) -> impl FnOnce(std::io::Error) -> BackupError {
        move |source| BackupError::Io { stage, source }
    }

    /// Classify a sqlx error: anything that means the server could not be
    /// reached becomes `Connectivity`, the rest stays a database error.
    pub fn sqlx(stage: Stage) -> impl FnOnce(sqlx::Error) -> BackupError {
        move |source| {
            let unreachable = matches!(
                source,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Configuration(_)
            );
            if unreachable {
                BackupError::Connectivity {
                    stage,
                    message: source.to_string(),
                }
            } else {
                BackupError::Database {
                    stage,
                    message: source.to_string(),
                }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
