//! PostgreSQL backend: `pg_dump` and `psql` subprocesses for dump/apply,
//! sqlx connections for catalog work and database lifecycle.

use super::{ApplyOptions, Capabilities, Capability, DatabaseBackend, DumpMode, DumpRequest, SampleShape};
use crate::config::{Config, DatabaseConfig, ToolsConfig};
use crate::utils::{BackupError, Result, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor, Row};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MODIFIED_TABLES_SQL: &str = "\
    SELECT schemaname::text, relname::text \
    FROM pg_stat_user_tables \
    WHERE GREATEST(last_vacuum, last_autovacuum, last_analyze, last_autoanalyze) > $1 \
    ORDER BY schemaname, relname";

const LIST_TABLES_SQL: &str = "\
    SELECT table_schema::text, table_name::text \
    FROM information_schema.tables \
    WHERE table_type = 'BASE TABLE' \
      AND table_schema NOT IN ('pg_catalog', 'information_schema') \
    ORDER BY table_schema, table_name";

pub struct PostgresBackend {
    database: DatabaseConfig,
    tools: ToolsConfig,
    chunk_size: usize,
}

impl PostgresBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            database: config.database.clone(),
            tools: config.tools.clone(),
            chunk_size: config.store.chunk_size,
        }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.database.host)
            .port(self.database.port)
            .username(&self.database.user)
            .database(database)
            .application_name("db-backup");
        match &self.database.password {
            Some(password) => options.password(password),
            None => options,
        }
    }

    async fn connect(&self, database: &str, stage: Stage) -> Result<PgConnection> {
        let timeout = Duration::from_secs(self.database.connect_timeout_secs.max(1));
        let options = self.connect_options(database);
        match tokio::time::timeout(timeout, PgConnection::connect_with(&options)).await {
            Ok(result) => result.map_err(BackupError::sqlx(stage)),
            Err(_) => Err(BackupError::Connectivity {
                stage,
                message: format!(
                    "timed out after {}s connecting to {}:{}/{}",
                    timeout.as_secs(),
                    self.database.host,
                    self.database.port,
                    database
                ),
            }),
        }
    }

    /// Connection-level arguments shared by pg_dump and psql.
    fn command(&self, program: &Path, database: &str) -> Command {
        let mut command = Command::new(program);
        command
            .arg("--host")
            .arg(&self.database.host)
            .arg("--port")
            .arg(self.database.port.to_string())
            .arg("--username")
            .arg(&self.database.user)
            .arg("--no-password")
            .arg("--dbname")
            .arg(database)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.database.password {
            command.env("PGPASSWORD", password);
        }
        command
    }

    async fn catalog_probe(&self) -> (Capability, Capability) {
        let create_database = match self.connect(&self.database.maintenance_database, Stage::Probe).await {
            Ok(mut conn) => {
                let allowed = sqlx::query_scalar::<_, bool>(
                    "SELECT rolsuper OR rolcreatedb FROM pg_roles WHERE rolname = current_user",
                )
                .fetch_one(&mut conn)
                .await;
                let _ = conn.close().await;
                match allowed {
                    Ok(true) => Capability::Available,
                    Ok(false) => Capability::Unavailable(format!(
                        "role '{}' has neither SUPERUSER nor CREATEDB",
                        self.database.user
                    )),
                    Err(e) => Capability::Unavailable(e.to_string()),
                }
            }
            Err(e) => Capability::Unavailable(e.to_string()),
        };

        let change_tracking = match self.connect(&self.database.name, Stage::Probe).await {
            Ok(mut conn) => {
                let setting = sqlx::query_scalar::<_, String>("SELECT current_setting('track_counts')")
                    .fetch_one(&mut conn)
                    .await;
                let readable = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM pg_stat_user_tables")
                    .fetch_one(&mut conn)
                    .await;
                let _ = conn.close().await;
                match (setting, readable) {
                    (Ok(setting), Ok(_)) if setting == "on" => Capability::Available,
                    (Ok(setting), Ok(_)) => {
                        Capability::Unavailable(format!("track_counts is '{}'", setting))
                    }
                    (Err(e), _) | (_, Err(e)) => Capability::Unavailable(e.to_string()),
                }
            }
            Err(e) => Capability::Unavailable(e.to_string()),
        };

        (create_database, change_tracking)
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    fn source_database(&self) -> &str {
        &self.database.name
    }

    async fn probe(&self) -> Capabilities {
        let (create_database, change_tracking) = self.catalog_probe().await;
        Capabilities {
            dump: tool_capability(&self.tools.pg_dump),
            apply: tool_capability(&self.tools.psql),
            create_database,
            change_tracking,
        }
    }

    async fn dump(
        &self,
        request: &DumpRequest,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let mut command = self.command(&self.tools.pg_dump, &self.database.name);
        command.arg("--format=plain");
        match request.mode {
            DumpMode::SchemaOnly => {
                command.arg("--schema-only");
            }
            DumpMode::DataOnly => {
                command.arg("--data-only");
            }
            DumpMode::Both => {}
        }
        if request.clean {
            command.arg("--clean").arg("--if-exists");
        }
        for table in &request.tables {
            command.arg(format!("--table={}", quote_qualified(table)));
        }
        command.stdin(Stdio::null()).stdout(Stdio::piped());

        debug!(
            "Running {} for {} ({} tables, {:?})",
            self.tools.pg_dump.display(),
            self.database.name,
            request.tables.len(),
            request.mode
        );

        let mut child = command.spawn().map_err(BackupError::io(Stage::Dump))?;
        let stderr = drain_stderr(&mut child);
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::io(Stage::Dump)(std::io::Error::other("pg_dump stdout not captured")))?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = match stdout.read(&mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(BackupError::io(Stage::Dump)(e));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = sink.write_all(&buffer[..n]).await {
                let _ = child.kill().await;
                return Err(BackupError::io(Stage::Compress)(e));
            }
            total += n as u64;
        }

        let status = child.wait().await.map_err(BackupError::io(Stage::Dump))?;
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(BackupError::DumpFailure {
                status: describe_status(status),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.trim().is_empty() {
            warn!("pg_dump: {}", stderr.trim());
        }

        Ok(total)
    }

    async fn apply(
        &self,
        target: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        options: ApplyOptions,
    ) -> Result<u64> {
        let mut command = self.command(&self.tools.psql, target);
        command
            .arg("--quiet")
            .arg("--no-psqlrc")
            .arg("--set")
            .arg("ON_ERROR_STOP=1")
            .arg("--file")
            .arg("-");
        if options.single_transaction {
            command.arg("--single-transaction");
        }
        command.stdin(Stdio::piped()).stdout(Stdio::null());

        debug!("Running {} against {}", self.tools.psql.display(), target);

        let mut child = command.spawn().map_err(BackupError::io(Stage::Apply))?;
        let stderr = drain_stderr(&mut child);
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackupError::io(Stage::Apply)(std::io::Error::other("psql stdin not captured")))?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        let mut pipe_error = None;
        loop {
            let n = match source.read(&mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(BackupError::io(Stage::Apply)(e));
                }
            };
            if n == 0 {
                break;
            }
            // psql exits on the first error under ON_ERROR_STOP; the broken
            // pipe that follows is reported through its exit status below.
            if let Err(e) = stdin.write_all(&buffer[..n]).await {
                pipe_error = Some(e);
                break;
            }
            total += n as u64;
        }
        drop(stdin);

        let status = child.wait().await.map_err(BackupError::io(Stage::Apply))?;
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(BackupError::ApplyFailure {
                target: target.to_string(),
                artifact: String::new(),
                stderr: format!("{} ({})", stderr.trim(), describe_status(status)),
            });
        }
        if let Some(e) = pipe_error {
            return Err(BackupError::ApplyFailure {
                target: target.to_string(),
                artifact: String::new(),
                stderr: format!("psql stopped reading input: {}", e),
            });
        }

        Ok(total)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let mut conn = self
            .connect(&self.database.maintenance_database, Stage::DropCreate)
            .await?;
        let sql = format!("CREATE DATABASE {}", quote_ident(name));
        let result = conn.execute(sql.as_str()).await;
        let _ = conn.close().await;
        result.map(|_| ()).map_err(BackupError::sqlx(Stage::DropCreate))
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let mut conn = self
            .connect(&self.database.maintenance_database, Stage::DropCreate)
            .await?;
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(name));
        let result = conn.execute(sql.as_str()).await;
        let _ = conn.close().await;
        result.map(|_| ()).map_err(BackupError::sqlx(Stage::DropCreate))
    }

    async fn tables_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.connect(&self.database.name, Stage::Detect).await?;
        let rows = sqlx::query_as::<_, (String, String)>(MODIFIED_TABLES_SQL)
            .bind(since)
            .fetch_all(&mut conn)
            .await;
        let _ = conn.close().await;
        let rows = rows.map_err(BackupError::sqlx(Stage::Detect))?;
        Ok(rows
            .into_iter()
            .map(|(schema, table)| display_name(&schema, &table))
            .collect())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        let mut conn = self.connect(database, Stage::Verify).await?;
        let rows = sqlx::query_as::<_, (String, String)>(LIST_TABLES_SQL)
            .fetch_all(&mut conn)
            .await;
        let _ = conn.close().await;
        let rows = rows.map_err(BackupError::sqlx(Stage::Verify))?;
        Ok(rows
            .into_iter()
            .map(|(schema, table)| display_name(&schema, &table))
            .collect())
    }

    async fn row_count(&self, database: &str, table: &str) -> Result<u64> {
        let mut conn = self.connect(database, Stage::Verify).await?;
        let sql = format!("SELECT count(*) FROM {}", quote_qualified(table));
        let count = sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut conn).await;
        let _ = conn.close().await;
        count
            .map(|c| c.max(0) as u64)
            .map_err(BackupError::sqlx(Stage::Verify))
    }

    async fn sample_read(&self, database: &str, table: &str) -> Result<SampleShape> {
        let mut conn = self.connect(database, Stage::Verify).await?;
        let sql = format!("SELECT * FROM {} LIMIT 1", quote_qualified(table));
        let rows = sqlx::query(&sql).fetch_all(&mut conn).await;
        let _ = conn.close().await;
        let rows = rows.map_err(BackupError::sqlx(Stage::Verify))?;
        Ok(SampleShape {
            rows: rows.len(),
            columns: rows.first().map(|r| r.columns().len()).unwrap_or(0),
        })
    }
}

fn tool_capability(tool: &Path) -> Capability {
    match which::which(tool) {
        Ok(_) => Capability::Available,
        Err(e) => Capability::Unavailable(format!("{}: {}", tool.display(), e)),
    }
}

/// Collect a child's stderr in the background so a chatty process never
/// blocks on a full pipe while we are busy with stdout/stdin.
fn drain_stderr(child: &mut Child) -> JoinHandle<String> {
    let stderr: Option<ChildStderr> = child.stderr.take();
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Tables in `public` are reported bare, everything else schema-qualified.
fn display_name(schema: &str, table: &str) -> String {
    if schema == "public" {
        table.to_string()
    } else {
        format!("{}.{}", schema, table)
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote `schema.table` (or a bare table name) part by part.
pub(crate) fn quote_qualified(name: &str) -> String {
    match name.split_once('.') {
        Some((schema, table)) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        None => quote_ident(name),
    }
}
