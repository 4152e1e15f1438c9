//! In-memory backend for tests.
//!
//! Databases are maps of tables to rows. Dumps use a line-oriented format
//! close enough to plain SQL that compression, checksums and chain logic
//! are exercised for real:
//!
//! ```text
//! -- mock dump of travel
//! DROP TABLE IF EXISTS cities;
//! CREATE TABLE cities;
//! INSERT INTO cities VALUES (paris);
//! ```
//!
//! Applying stops at the first failing statement and leaves everything
//! applied before it in place, like `psql -v ON_ERROR_STOP=1`.

use super::{ApplyOptions, Capabilities, DatabaseBackend, DumpMode, DumpRequest, SampleShape};
use crate::utils::{BackupError, Result, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockTable {
    pub rows: Vec<String>,
    /// Latest maintenance timestamp seen by change detection
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockDatabase {
    pub tables: BTreeMap<String, MockTable>,
}

impl MockDatabase {
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(|t| t.rows.len())
    }

    /// Table contents without change-tracking timestamps.
    pub fn contents(&self) -> BTreeMap<String, Vec<String>> {
        self.tables
            .iter()
            .map(|(name, table)| (name.clone(), table.rows.clone()))
            .collect()
    }
}

#[derive(Debug, Default)]
struct State {
    databases: BTreeMap<String, MockDatabase>,
    events: Vec<String>,
    fail_dump: Option<String>,
    fail_apply_on: Option<String>,
    fail_drop: bool,
    uncountable: BTreeSet<String>,
    sample_shapes: BTreeMap<String, SampleShape>,
}

pub struct MockBackend {
    source: String,
    capabilities: Capabilities,
    state: Mutex<State>,
}

impl MockBackend {
    /// Backend whose source database `source` exists and is empty.
    pub fn new(source: &str) -> Self {
        let mut state = State::default();
        state
            .databases
            .insert(source.to_string(), MockDatabase::default());
        Self {
            source: source.to_string(),
            capabilities: Capabilities::all_available(),
            state: Mutex::new(state),
        }
    }

    /// Add a table with `rows` generated rows to the source database.
    pub fn with_table(self, table: &str, rows: usize) -> Self {
        {
            let mut state = self.lock();
            let source = self.source.clone();
            let db = state.databases.entry(source).or_default();
            db.tables.insert(
                table.to_string(),
                MockTable {
                    rows: (1..=rows).map(|i| format!("{}-{}", table, i)).collect(),
                    modified_at: None,
                },
            );
        }
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a maintenance pass on `table` of the source database.
    pub fn set_modified(&self, table: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(t) = state
            .databases
            .get_mut(&self.source)
            .and_then(|db| db.tables.get_mut(table))
        {
            t.modified_at = Some(at);
        }
    }

    pub fn insert_row(&self, table: &str, row: &str) {
        let mut state = self.lock();
        if let Some(t) = state
            .databases
            .get_mut(&self.source)
            .and_then(|db| db.tables.get_mut(table))
        {
            t.rows.push(row.to_string());
        }
    }

    pub fn database(&self, name: &str) -> Option<MockDatabase> {
        self.lock().databases.get(name).cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.lock().databases.keys().cloned().collect()
    }

    /// Calls made so far, e.g. `dump`, `create:travel`, `apply:travel`.
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn fail_dump(&self, stderr: &str) {
        self.lock().fail_dump = Some(stderr.to_string());
    }

    /// Make the first statement containing `needle` fail during apply.
    pub fn fail_apply_on(&self, needle: &str) {
        self.lock().fail_apply_on = Some(needle.to_string());
    }

    /// Make dropping any existing database fail.
    pub fn fail_drop(&self) {
        self.lock().fail_drop = true;
    }

    /// Make row counting fail for `table` in every database.
    pub fn make_uncountable(&self, table: &str) {
        self.lock().uncountable.insert(table.to_string());
    }

    /// Make sample reads of `table` report `shape` in every database.
    pub fn set_sample_shape(&self, table: &str, shape: SampleShape) {
        self.lock().sample_shapes.insert(table.to_string(), shape);
    }

    fn render_dump(&self, request: &DumpRequest) -> Result<String> {
        let mut state = self.lock();
        state.events.push("dump".to_string());

        if let Some(stderr) = state.fail_dump.clone() {
            return Err(BackupError::DumpFailure {
                status: "exit code 1".to_string(),
                stderr,
            });
        }

        let db = state.databases.get(&self.source).ok_or_else(|| BackupError::DumpFailure {
            status: "exit code 1".to_string(),
            stderr: format!("database \"{}\" does not exist", self.source),
        })?;

        let tables: Vec<&String> = if request.tables.is_empty() {
            db.tables.keys().collect()
        } else {
            for table in &request.tables {
                if !db.tables.contains_key(table) {
                    return Err(BackupError::DumpFailure {
                        status: "exit code 1".to_string(),
                        stderr: format!("no matching tables were found for \"{}\"", table),
                    });
                }
            }
            request.tables.iter().collect()
        };

        let mut out = format!("-- mock dump of {}\n", self.source);
        for name in tables {
            let with_schema = request.mode != DumpMode::DataOnly;
            let with_data = request.mode != DumpMode::SchemaOnly;
            if with_schema && request.clean {
                out.push_str(&format!("DROP TABLE IF EXISTS {};\n", name));
            }
            if with_schema {
                out.push_str(&format!("CREATE TABLE {};\n", name));
            }
            if with_data {
                for row in &db.tables[name].rows {
                    out.push_str(&format!("INSERT INTO {} VALUES ({});\n", name, row));
                }
            }
        }
        Ok(out)
    }

    fn execute(&self, target: &str, script: &str) -> std::result::Result<(), String> {
        let mut state = self.lock();
        let fail_on = state.fail_apply_on.clone();
        let db = state
            .databases
            .get_mut(target)
            .ok_or_else(|| format!("FATAL: database \"{}\" does not exist", target))?;

        for (index, line) in script.lines().enumerate() {
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with("--") {
                continue;
            }
            let fail = |msg: String| format!("psql:<stdin>:{}: ERROR: {}", index + 1, msg);

            if fail_on.as_deref().is_some_and(|needle| statement.contains(needle)) {
                return Err(fail("injected failure".to_string()));
            }

            if let Some(name) = statement
                .strip_prefix("DROP TABLE IF EXISTS ")
                .and_then(|s| s.strip_suffix(';'))
            {
                db.tables.remove(name);
            } else if let Some(name) = statement
                .strip_prefix("CREATE TABLE ")
                .and_then(|s| s.strip_suffix(';'))
            {
                if db.tables.contains_key(name) {
                    return Err(fail(format!("relation \"{}\" already exists", name)));
                }
                db.tables.insert(name.to_string(), MockTable::default());
            } else if let Some(rest) = statement
                .strip_prefix("INSERT INTO ")
                .and_then(|s| s.strip_suffix(");"))
            {
                let (name, row) = rest
                    .split_once(" VALUES (")
                    .ok_or_else(|| fail(format!("syntax error at \"{}\"", statement)))?;
                let table = db
                    .tables
                    .get_mut(name)
                    .ok_or_else(|| fail(format!("relation \"{}\" does not exist", name)))?;
                table.rows.push(row.to_string());
            } else {
                return Err(fail(format!("syntax error at \"{}\"", statement)));
            }
        }
        Ok(())
    }

    fn with_table_in<T>(
        &self,
        database: &str,
        table: &str,
        f: impl FnOnce(&MockTable) -> T,
    ) -> Result<T> {
        let state = self.lock();
        let db = state.databases.get(database).ok_or_else(|| BackupError::Database {
            stage: Stage::Verify,
            message: format!("database \"{}\" does not exist", database),
        })?;
        let t = db.tables.get(table).ok_or_else(|| BackupError::Database {
            stage: Stage::Verify,
            message: format!("relation \"{}\" does not exist", table),
        })?;
        Ok(f(t))
    }
}

#[async_trait]
impl DatabaseBackend for MockBackend {
    fn source_database(&self) -> &str {
        &self.source
    }

    async fn probe(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn dump(
        &self,
        request: &DumpRequest,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let out = self.render_dump(request)?;
        for chunk in out.as_bytes().chunks(512) {
            sink.write_all(chunk)
                .await
                .map_err(BackupError::io(Stage::Compress))?;
        }
        Ok(out.len() as u64)
    }

    async fn apply(
        &self,
        target: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        options: ApplyOptions,
    ) -> Result<u64> {
        let mut script = String::new();
        source
            .read_to_string(&mut script)
            .await
            .map_err(BackupError::io(Stage::Apply))?;

        self.lock().events.push(if options.single_transaction {
            format!("apply-tx:{}", target)
        } else {
            format!("apply:{}", target)
        });

        self.execute(target, &script)
            .map_err(|stderr| BackupError::ApplyFailure {
                target: target.to_string(),
                artifact: String::new(),
                stderr,
            })?;
        Ok(script.len() as u64)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.events.push(format!("create:{}", name));
        if state.databases.contains_key(name) {
            return Err(BackupError::Database {
                stage: Stage::DropCreate,
                message: format!("database \"{}\" already exists", name),
            });
        }
        state.databases.insert(name.to_string(), MockDatabase::default());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.events.push(format!("drop:{}", name));
        if state.fail_drop && state.databases.contains_key(name) {
            return Err(BackupError::Database {
                stage: Stage::DropCreate,
                message: format!("database \"{}\" is being accessed by other users", name),
            });
        }
        state.databases.remove(name);
        Ok(())
    }

    async fn tables_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let state = self.lock();
        let db = state.databases.get(&self.source).ok_or_else(|| BackupError::Database {
            stage: Stage::Detect,
            message: format!("database \"{}\" does not exist", self.source),
        })?;
        Ok(db
            .tables
            .iter()
            .filter(|(_, t)| t.modified_at.is_some_and(|at| at > since))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        let state = self.lock();
        let db = state.databases.get(database).ok_or_else(|| BackupError::Database {
            stage: Stage::Verify,
            message: format!("database \"{}\" does not exist", database),
        })?;
        Ok(db.tables.keys().cloned().collect())
    }

    async fn row_count(&self, database: &str, table: &str) -> Result<u64> {
        if self.lock().uncountable.contains(table) {
            return Err(BackupError::Database {
                stage: Stage::Verify,
                message: format!("permission denied for table {}", table),
            });
        }
        self.with_table_in(database, table, |t| t.rows.len() as u64)
    }

    async fn sample_read(&self, database: &str, table: &str) -> Result<SampleShape> {
        let shape = self.with_table_in(database, table, |t| SampleShape {
            rows: t.rows.len().min(1),
            columns: 1,
        })?;
        Ok(self.lock().sample_shapes.get(table).copied().unwrap_or(shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dump_then_apply_recreates_tables() {
        let backend = MockBackend::new("travel")
            .with_table("cities", 3)
            .with_table("regions", 1);

        let mut dump = Vec::new();
        backend
            .dump(&DumpRequest::all(DumpMode::Both), &mut dump)
            .await
            .unwrap();

        backend.create_database("copy").await.unwrap();
        backend
            .apply("copy", &mut dump.as_slice(), ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(
            backend.database("copy").unwrap().contents(),
            backend.database("travel").unwrap().contents()
        );
    }

    #[tokio::test]
    async fn test_apply_stops_at_first_error() {
        let backend = MockBackend::new("travel");
        backend.create_database("copy").await.unwrap();
        let script = b"CREATE TABLE a;\nINSERT INTO a VALUES (1);\nINSERT INTO missing VALUES (2);\nCREATE TABLE b;\n";

        let err = backend
            .apply("copy", &mut &script[..], ApplyOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::ApplyFailure { .. }));
        assert!(err.to_string().contains("relation \"missing\" does not exist"));
        let copy = backend.database("copy").unwrap();
        assert_eq!(copy.row_count("a"), Some(1));
        assert_eq!(copy.row_count("b"), None);
    }

    #[tokio::test]
    async fn test_clean_table_dump_replaces_tables() {
        let backend = MockBackend::new("travel").with_table("cities", 2);
        let request = DumpRequest {
            tables: vec!["cities".to_string()],
            mode: DumpMode::Both,
            clean: true,
        };

        let mut dump = Vec::new();
        backend.dump(&request, &mut dump).await.unwrap();
        // Applying twice must not duplicate rows
        for _ in 0..2 {
            backend
                .apply("travel", &mut dump.as_slice(), ApplyOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(backend.database("travel").unwrap().row_count("cities"), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_table_in_dump_request() {
        let backend = MockBackend::new("travel");
        let request = DumpRequest {
            tables: vec!["ghost".to_string()],
            mode: DumpMode::Both,
            clean: true,
        };
        let err = backend.dump(&request, &mut Vec::new()).await.unwrap_err();
        assert!(matches!(err, BackupError::DumpFailure { .. }));
    }
}
