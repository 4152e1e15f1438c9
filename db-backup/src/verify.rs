//! Backup verification by restoring into a disposable scratch database.
//!
//! A passing report certifies structural and sampling health only: the
//! artifact restores, has tables, the checked tables can be counted and one
//! row can be read back. It does not prove row-level equality with the
//! source.

use crate::backend::{Capabilities, SampleShape};
use crate::context::Context;
use crate::restore::{BackupRef, RestoreOptions, RestoreOrchestrator};
use crate::store::{BackupMetadata, BackupType};
use crate::utils::{Result, Stage};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of a verification run. Problems found by the structural checks
/// land in `failures` (which fail the run) or `warnings` (which don't).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub artifact: String,
    pub database: String,
    pub table_count: usize,
    /// Row counts for the checked subset of tables
    pub row_counts: BTreeMap<String, u64>,
    pub sample_ok: bool,
    pub passed: bool,
    pub warnings: Vec<String>,
    pub failures: Vec<String>,
}

impl VerificationReport {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn fail(&mut self, message: String) {
        warn!("Verification check failed: {}", message);
        self.failures.push(message);
    }
}

/// `{prefix}_{YYYYMMDDHHMMSS}_{8 hex chars}`, unique across concurrent runs
/// and well under the 63-byte identifier limit.
pub fn scratch_name(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, now.format("%Y%m%d%H%M%S"), &suffix[..8])
}

pub struct VerificationRunner<'a> {
    ctx: Context<'a>,
}

impl<'a> VerificationRunner<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Restore `reference` into a fresh scratch database and check it. The
    /// scratch database is dropped on every path; a failed drop becomes a
    /// warning and never replaces the primary result.
    pub async fn verify(&self, reference: &BackupRef) -> Result<VerificationReport> {
        Capabilities::require(
            "create-database",
            &self.ctx.capabilities.create_database,
            Stage::Verify,
        )?;

        let restorer = RestoreOrchestrator::new(self.ctx);
        let artifact = restorer.resolve(reference).await?;
        let scratch = scratch_name(&self.ctx.config.verify.scratch_prefix, Utc::now());

        info!("Verifying {} in scratch database {}", artifact.file_name(), scratch);

        let metadata = artifact.metadata.clone();
        let name = artifact.file_name();
        let result = async {
            restorer
                .restore_artifact(artifact, &RestoreOptions::new(scratch.clone()))
                .await?;
            self.inspect(&scratch, &name, &metadata).await
        }
        .await;

        let teardown = self.ctx.backend.drop_database(&scratch).await;

        let mut report = result?;
        if let Err(e) = teardown {
            report.warn(format!("could not drop scratch database {}: {}", scratch, e));
        }

        if report.passed {
            info!("Verification of {} passed", report.artifact);
        } else {
            warn!(
                "Verification of {} failed: {}",
                report.artifact,
                report.failures.join("; ")
            );
        }
        Ok(report)
    }

    /// Run the structural checks against an existing database holding a
    /// restore of `artifact`.
    pub async fn inspect(
        &self,
        database: &str,
        artifact: &str,
        metadata: &BackupMetadata,
    ) -> Result<VerificationReport> {
        let backend = self.ctx.backend;
        let mut report = VerificationReport {
            artifact: artifact.to_string(),
            database: database.to_string(),
            ..VerificationReport::default()
        };

        let tables = backend.list_tables(database).await?;
        report.table_count = tables.len();
        if tables.is_empty() {
            report.fail(format!("{} has no tables", database));
        }

        let checked = self.tables_to_check(metadata, &tables);
        for table in &checked {
            match backend.row_count(database, table).await {
                Ok(0) => {
                    report.row_counts.insert(table.clone(), 0);
                    report.warn(format!("table {} is empty", table));
                }
                Ok(rows) => {
                    report.row_counts.insert(table.clone(), rows);
                }
                Err(e) => report.fail(format!("cannot count rows in {}: {}", table, e)),
            }
        }

        if let Some(sample_table) = checked.first().or_else(|| tables.first()) {
            let counted = report.row_counts.get(sample_table).copied();
            match backend.sample_read(database, sample_table).await {
                Ok(shape) => match sample_problem(shape, counted) {
                    None => report.sample_ok = true,
                    Some(problem) => {
                        report.fail(format!("sample read from {} {}", sample_table, problem))
                    }
                },
                Err(e) => report.fail(format!("sample read from {} failed: {}", sample_table, e)),
            }
        }

        report.passed = report.failures.is_empty();
        Ok(report)
    }

    fn tables_to_check(&self, metadata: &BackupMetadata, tables: &[String]) -> Vec<String> {
        if metadata.backup_type == BackupType::Incremental {
            return metadata.modified_tables.clone().unwrap_or_default();
        }
        let key_tables = &self.ctx.config.verify.key_tables;
        if key_tables.is_empty() {
            tables.to_vec()
        } else {
            key_tables.clone()
        }
    }
}

/// A `LIMIT 1` read must return at least one column, and exactly one row
/// whenever the table is known to hold rows.
fn sample_problem(shape: SampleShape, counted_rows: Option<u64>) -> Option<String> {
    if shape.columns == 0 {
        return Some("returned no columns".to_string());
    }
    match counted_rows {
        Some(0) | None if shape.rows <= 1 => None,
        Some(n) if n > 0 && shape.rows == 1 => None,
        Some(n) => Some(format!(
            "returned {} rows from a table counted at {}",
            shape.rows, n
        )),
        None => Some(format!("returned {} rows", shape.rows)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::{Capability, DatabaseBackend};
    use crate::config::Config;
    use crate::executor::{BackupOptions, BackupOrchestrator};
    use crate::store::ArtifactStore;
    use crate::utils::BackupError;
    use chrono::TimeZone;

    struct Fixture {
        config: Config,
        store: ArtifactStore,
        capabilities: Capabilities,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config::default();
            config.database.name = "travel".to_string();
            config.store.dir = dir.path().to_path_buf();
            Self {
                store: ArtifactStore::with_sidecars(dir.path()),
                config,
                capabilities: Capabilities::all_available(),
                _dir: dir,
            }
        }

        fn ctx<'a>(&'a self, backend: &'a dyn DatabaseBackend) -> Context<'a> {
            Context::new(&self.config, backend, &self.store, &self.capabilities)
        }
    }

    fn travel() -> MockBackend {
        MockBackend::new("travel")
            .with_table("cities", 10)
            .with_table("attractions", 25)
            .with_table("accommodations", 8)
            .with_table("regions", 5)
    }

    async fn backup(fx: &Fixture, backend: &MockBackend, backup_type: BackupType) {
        BackupOrchestrator::new(fx.ctx(backend))
            .create_backup(backup_type, BackupOptions::default())
            .await
            .unwrap();
    }

    #[test]
    fn test_scratch_name_shape() {
        let now = Utc.with_ymd_and_hms(2024, 7, 8, 9, 10, 11).unwrap();
        let a = scratch_name("verify", now);
        let b = scratch_name("verify", now);

        assert!(a.starts_with("verify_20240708091011_"));
        let suffix = a.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert!(scratch_name(&"p".repeat(20), now).len() <= 63);
    }

    #[tokio::test]
    async fn test_full_backup_passes_and_scratch_is_dropped() {
        let fx = Fixture::new();
        let backend = travel();
        backup(&fx, &backend, BackupType::Full).await;

        let report = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::LatestFull)
            .await
            .unwrap();

        assert!(report.passed);
        assert_eq!(report.table_count, 4);
        assert!(report.sample_ok);
        assert_eq!(report.row_counts["cities"], 10);
        assert_eq!(report.row_counts["attractions"], 25);
        assert_eq!(report.row_counts["accommodations"], 8);
        assert_eq!(report.row_counts["regions"], 5);
        assert!(report.warnings.is_empty());
        assert!(report.database.starts_with("verify_"));
        assert_eq!(backend.database_names(), vec!["travel".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_incremental_verifies_as_full() {
        let fx = Fixture::new();
        let backend = travel();
        backup(&fx, &backend, BackupType::Incremental).await;
        let artifact = fx.store.latest(None).await.unwrap().unwrap();
        assert_eq!(artifact.metadata.backup_type, BackupType::Full);

        let report = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap();
        assert!(report.passed);
        assert_eq!(report.table_count, 4);
    }

    #[tokio::test]
    async fn test_key_tables_and_empty_table_warning() {
        let mut fx = Fixture::new();
        fx.config.verify.key_tables = vec!["regions".to_string(), "reviews".to_string()];
        let backend = travel().with_table("reviews", 0);
        backup(&fx, &backend, BackupType::Full).await;

        let report = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap();

        assert!(report.passed);
        assert_eq!(report.row_counts.len(), 2);
        assert_eq!(report.row_counts["reviews"], 0);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_uncountable_key_table_fails() {
        let mut fx = Fixture::new();
        fx.config.verify.key_tables = vec!["cities".to_string()];
        let backend = travel();
        backup(&fx, &backend, BackupType::Full).await;
        backend.make_uncountable("cities");

        let report = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(backend.database_names(), vec!["travel".to_string()]);
    }

    #[tokio::test]
    async fn test_schema_without_tables_fails_structurally() {
        let fx = Fixture::new();
        let backend = MockBackend::new("travel");
        backup(&fx, &backend, BackupType::Schema).await;

        let report = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.table_count, 0);
        assert!(!report.sample_ok);
    }

    #[tokio::test]
    async fn test_restore_error_still_drops_scratch() {
        let fx = Fixture::new();
        let backend = travel();
        backup(&fx, &backend, BackupType::Full).await;
        backend.fail_apply_on("CREATE TABLE cities");

        let err = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::ApplyFailure { .. }));
        assert_eq!(backend.database_names(), vec!["travel".to_string()]);
        assert!(backend.events().iter().any(|e| e.starts_with("drop:verify_")));
    }

    #[tokio::test]
    async fn test_teardown_failure_is_a_warning() {
        let fx = Fixture::new();
        let backend = travel();
        backup(&fx, &backend, BackupType::Full).await;
        backend.fail_drop();

        let report = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap();

        assert!(report.passed);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("could not drop scratch database"));
    }

    #[tokio::test]
    async fn test_inspect_incremental_checks_modified_tables() {
        let fx = Fixture::new();
        let backend = travel();
        let metadata = BackupMetadata {
            database: "travel".to_string(),
            backup_type: BackupType::Incremental,
            timestamp: Utc::now(),
            file_size: 0,
            file_hash: String::new(),
            compression: "gzip".to_string(),
            base_backup: Some("travel_full_20240101_000000.sql.gz".to_string()),
            modified_tables: Some(vec!["regions".to_string()]),
        };

        let report = VerificationRunner::new(fx.ctx(&backend))
            .inspect("travel", "travel_incremental_20240102_000000.sql.gz", &metadata)
            .await
            .unwrap();

        assert!(report.passed);
        assert_eq!(report.table_count, 4);
        assert_eq!(report.row_counts.keys().collect::<Vec<_>>(), vec!["regions"]);
        assert!(report.sample_ok);
    }

    #[test]
    fn test_sample_problem() {
        let one = SampleShape { rows: 1, columns: 3 };
        let none = SampleShape { rows: 0, columns: 3 };

        assert_eq!(sample_problem(one, Some(10)), None);
        assert_eq!(sample_problem(none, Some(0)), None);
        assert_eq!(sample_problem(none, None), None);
        assert!(sample_problem(none, Some(10)).is_some());
        assert!(sample_problem(SampleShape { rows: 1, columns: 0 }, Some(10)).is_some());
        assert!(sample_problem(SampleShape { rows: 2, columns: 3 }, None).is_some());
    }

    #[tokio::test]
    async fn test_bad_sample_shape_fails_verification() {
        let mut fx = Fixture::new();
        fx.config.verify.key_tables = vec!["cities".to_string()];
        let backend = travel();
        backup(&fx, &backend, BackupType::Full).await;
        backend.set_sample_shape("cities", SampleShape { rows: 0, columns: 2 });

        let report = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap();

        assert!(!report.passed);
        assert!(!report.sample_ok);
        assert_eq!(report.row_counts["cities"], 10);
        assert!(report.failures[0].contains("counted at 10"));
        assert_eq!(backend.database_names(), vec!["travel".to_string()]);
    }

    #[tokio::test]
    async fn test_sample_without_columns_fails_verification() {
        let fx = Fixture::new();
        let backend = travel();
        backup(&fx, &backend, BackupType::Full).await;
        backend.set_sample_shape("accommodations", SampleShape { rows: 1, columns: 0 });

        let report = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap();

        assert!(!report.passed);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("no columns"));
    }

    #[tokio::test]
    async fn test_missing_create_capability() {
        let mut fx = Fixture::new();
        let backend = travel().with_capabilities(Capabilities {
            create_database: Capability::Unavailable("role lacks CREATEDB".into()),
            ..Capabilities::all_available()
        });
        fx.capabilities = backend.probe().await;

        let err = VerificationRunner::new(fx.ctx(&backend))
            .verify(&BackupRef::Latest)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Verify));
    }
}
