//! Artifact naming: `{database}_{type}_{YYYYMMDD_HHMMSS}.sql.gz`.

use crate::codec::Compression;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Kind of backup an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    Schema,
    Data,
}

impl BackupType {
    pub const ALL: [BackupType; 4] = [
        BackupType::Full,
        BackupType::Incremental,
        BackupType::Schema,
        BackupType::Data,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Schema => "schema",
            BackupType::Data => "data",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "schema" => Ok(BackupType::Schema),
            "data" => Ok(BackupType::Data),
            other => Err(format!(
                "unknown backup type '{}' (expected full, incremental, schema or data)",
                other
            )),
        }
    }
}

/// Parsed artifact file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub database: String,
    pub backup_type: BackupType,
    /// Second-resolution creation time encoded in the name (UTC)
    pub created: NaiveDateTime,
    pub compression: Compression,
}

impl ArtifactName {
    pub fn new(
        database: &str,
        backup_type: BackupType,
        created: DateTime<Utc>,
        compression: Compression,
    ) -> Self {
        Self {
            database: database.to_string(),
            backup_type,
            created: created.naive_utc(),
            compression,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}{}",
            self.stem(),
            self.compression.artifact_suffix()
        )
    }

    /// File name without the `.sql.*` suffix; the sidecar shares it.
    pub fn stem(&self) -> String {
        format!(
            "{}_{}_{}",
            self.database,
            self.backup_type,
            self.created.format(TIMESTAMP_FORMAT)
        )
    }

    /// Parse a file name. Fields are taken from the right so database
    /// names may themselves contain underscores.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, compression) = split_suffix(file_name)?;

        let mut parts = stem.rsplitn(4, '_');
        let time = parts.next()?;
        let date = parts.next()?;
        let backup_type = parts.next()?.parse().ok()?;
        let database = parts.next()?;
        if database.is_empty() || date.len() != 8 || time.len() != 6 {
            return None;
        }

        let created =
            NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), TIMESTAMP_FORMAT).ok()?;

        Some(Self {
            database: database.to_string(),
            backup_type,
            created,
            compression,
        })
    }
}

/// Split `name` into its stem and the codec implied by its suffix.
pub fn split_suffix(name: &str) -> Option<(&str, Compression)> {
    [Compression::Gzip, Compression::Zstd]
        .into_iter()
        .find_map(|codec| {
            name.strip_suffix(codec.artifact_suffix())
                .map(|stem| (stem, codec))
        })
}
