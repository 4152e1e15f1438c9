//! db-backup - Main entry point
//!
//! Command-line surface over the backup, restore and verification
//! orchestrators. Exits non-zero on any failed operation or verification.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use db_backup::backend::{Capabilities, Capability, DatabaseBackend, PostgresBackend};
use db_backup::executor::{BackupOptions, BackupOrchestrator};
use db_backup::restore::{BackupRef, RestoreOptions, RestoreOrchestrator};
use db_backup::retention::RetentionManager;
use db_backup::store::{ArtifactStore, BackupType};
use db_backup::utils::{self, format::format_bytes, format::format_duration};
use db_backup::verify::{VerificationReport, VerificationRunner};
use db_backup::{Config, Context};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Exit status for a verification that ran but did not pass
const EXIT_VERIFICATION_FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup (full, incremental, schema or data)
    CreateBackup {
        backup_type: BackupType,

        /// Enforce retention for this type afterwards
        #[arg(long)]
        cleanup: bool,
    },

    /// List backups in the store, oldest first
    ListBackups {
        #[arg(long = "type")]
        backup_type: Option<BackupType>,
    },

    /// Restore a backup (path, "latest" or "latest-full")
    Restore {
        reference: BackupRef,

        /// Target database (defaults to the configured database)
        #[arg(long)]
        target: Option<String>,

        /// Apply into the existing target instead of recreating it (an
        /// incremental with its base always starts from a fresh target)
        #[arg(long)]
        no_create: bool,

        /// Do not apply an incremental's base backup first
        #[arg(long)]
        no_chain: bool,

        /// Run the verification checks against the target afterwards
        #[arg(long)]
        verify: bool,
    },

    /// Restore a backup into a scratch database and check it
    Verify { reference: BackupRef },

    /// Enforce retention limits
    Cleanup {
        #[arg(long = "type")]
        backup_type: Option<BackupType>,
    },

    /// Report which database capabilities are usable
    Probe,
}

impl Command {
    /// Commands that only look at the artifact store skip the probe.
    fn needs_database(&self) -> bool {
        !matches!(self, Command::ListBackups { .. } | Command::Cleanup { .. })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    config.validate()?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    info!(
        "Starting db-backup v{} (database: {}, store: {})",
        env!("CARGO_PKG_VERSION"),
        config.database.name,
        config.store.dir.display()
    );

    let backend = PostgresBackend::new(&config);
    let store = ArtifactStore::with_sidecars(&config.store.dir);
    let capabilities = if args.command.needs_database() {
        let capabilities = backend.probe().await;
        for (name, capability) in capabilities.entries() {
            if let Capability::Unavailable(reason) = capability {
                warn!("Capability {} unavailable: {}", name, reason);
            }
        }
        capabilities
    } else {
        Capabilities::all_available()
    };

    let ctx = Context::new(&config, &backend, &store, &capabilities);
    match run(ctx, args.command).await {
        Ok(code) => Ok(code),
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(ctx: Context<'_>, command: Command) -> db_backup::Result<ExitCode> {
    match command {
        Command::CreateBackup {
            backup_type,
            cleanup,
        } => {
            let outcome = BackupOrchestrator::new(ctx)
                .create_backup(
                    backup_type,
                    BackupOptions {
                        enforce_retention: cleanup,
                    },
                )
                .await?;
            if outcome.fell_back_to_full() {
                info!("Incremental requested, full backup taken");
            }
            println!("{}", outcome.artifact.path.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::ListBackups { backup_type } => {
            let listing = ctx.store.scan().await?;
            println!(
                "{:<48} {:<12} {:<25} {:>11}  BASE",
                "ARTIFACT", "TYPE", "CREATED", "SIZE"
            );
            for artifact in listing
                .valid
                .iter()
                .filter(|a| backup_type.map_or(true, |t| a.backup_type() == t))
            {
                println!(
                    "{:<48} {:<12} {:<25} {:>11}  {}",
                    artifact.file_name(),
                    artifact.backup_type().as_str(),
                    artifact.created().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    format_bytes(artifact.metadata.file_size),
                    artifact.metadata.base_backup.as_deref().unwrap_or("-")
                );
            }
            if backup_type.is_none() {
                for orphan in &listing.orphaned {
                    println!("{:<48} (orphaned: no metadata)", orphan.display());
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Restore {
            reference,
            target,
            no_create,
            no_chain,
            verify,
        } => {
            let target = target.unwrap_or_else(|| ctx.config.database.name.clone());
            if !no_create && target == ctx.backend.source_database() {
                warn!("Restoring over the source database {}", target);
            }
            let options = RestoreOptions {
                target,
                create_target: !no_create,
                apply_chain: !no_chain,
            };

            let outcome = RestoreOrchestrator::new(ctx)
                .restore(&reference, &options)
                .await?;
            println!(
                "Restored {} into {} in {}",
                outcome.artifact.file_name(),
                outcome.target,
                format_duration(outcome.duration)
            );

            if verify {
                let report = VerificationRunner::new(ctx)
                    .inspect(
                        &outcome.target,
                        &outcome.artifact.file_name(),
                        &outcome.artifact.metadata,
                    )
                    .await?;
                print_report(&report);
                if !report.passed {
                    return Ok(ExitCode::from(EXIT_VERIFICATION_FAILED));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Verify { reference } => {
            let report = VerificationRunner::new(ctx).verify(&reference).await?;
            print_report(&report);
            if report.passed {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_VERIFICATION_FAILED))
            }
        }

        Command::Cleanup { backup_type } => {
            let manager = RetentionManager::new(ctx.store, &ctx.config.retention);
            let reports = match backup_type {
                Some(t) => vec![manager.enforce(t).await?],
                None => manager.enforce_all().await?,
            };
            for report in reports {
                println!(
                    "{:<12} kept {:>3}  removed {:>3}",
                    report.backup_type.as_str(),
                    report.kept,
                    report.removed.len()
                );
                for path in &report.removed {
                    println!("  - {}", path.display());
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Probe => {
            let mut all_available = true;
            for (name, capability) in ctx.capabilities.entries() {
                match capability {
                    Capability::Available => println!("{:<16} available", name),
                    Capability::Unavailable(reason) => {
                        all_available = false;
                        println!("{:<16} unavailable ({})", name, reason);
                    }
                }
            }
            Ok(if all_available {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn print_report(report: &VerificationReport) {
    println!(
        "Verification of {}: {}",
        report.artifact,
        if report.passed { "PASSED" } else { "FAILED" }
    );
    println!("  database:    {}", report.database);
    println!("  tables:      {}", report.table_count);
    for (table, rows) in &report.row_counts {
        println!("  rows:        {} = {}", table, rows);
    }
    println!("  sample read: {}", if report.sample_ok { "ok" } else { "failed" });
    for warning in &report.warnings {
        println!("  warning:     {}", warning);
    }
    for failure in &report.failures {
        println!("  failure:     {}", failure);
    }
}
