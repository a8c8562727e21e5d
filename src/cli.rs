//! Migration CLI.
//!
//! The `om` binary exposes the migration engines; applications usually
//! embed the same surface with their own record types registered:
//!
//! ```ignore
//! let om = Om::connect().await?;
//! om.repository::<Customer>()?;          // register record types first
//! let mut data = DataMigrator::new(om.client().clone(), om.registered_schemas());
//! let code = cli::run(&om, &mut data, Cli::parse().command).await;
//! std::process::exit(code);
//! ```
//!
//! Exit codes: 0 success; 1 transient failure (retry is reasonable);
//! 2 fatal (configuration, schema drift); 3 partial (the applied set
//! advanced but some values failed to convert).

use clap::{Parser, Subcommand};

use crate::error::OmError;
use crate::migrate::data::{DataMigrator, MigrationOptions};
use crate::migrate::datetime::DATETIME_MIGRATION_ID;
use crate::migrate::schema::SchemaMigrator;
use crate::repo::Om;

pub const EXIT_OK: i32 = 0;
pub const EXIT_TRANSIENT: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_PARTIAL: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "om", about = "Redis object-mapping migrations", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index (schema) migrations.
    #[command(subcommand)]
    Migrate(MigrateAction),
    /// Stored-data migrations.
    #[command(subcommand)]
    MigrateData(MigrateDataAction),
}

#[derive(Debug, Subcommand)]
pub enum MigrateAction {
    /// Compare registered record types against files and the server.
    Status,
    /// Snapshot pending index changes into migration files.
    Create { slug: String },
    /// Apply un-applied migration files in id order.
    Run,
    /// Re-create the previous index definition of one migration.
    Rollback { id: String },
}

#[derive(Debug, Subcommand)]
pub enum MigrateDataAction {
    /// List applied and pending data migrations.
    Status,
    /// Write a stub source file for a new data migration.
    Create { slug: String },
    /// Run pending data migrations in dependency order.
    Run {
        /// Read and transform, but write nothing.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        batch_size: Option<usize>,
        /// fail | skip | log_and_skip | default
        #[arg(long)]
        failure_mode: Option<String>,
        /// Abort after this many conversion failures.
        #[arg(long)]
        max_errors: Option<u64>,
        /// Run at most this many migrations.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check index kinds (and optionally stored data) for datetime drift.
    Verify {
        #[arg(long)]
        check_data: bool,
    },
    /// Reverse one applied migration.
    Rollback { id: String },
    /// Show the saved checkpoint of a migration.
    Progress { id: Option<String> },
    /// Discard the saved checkpoint of a migration.
    ClearProgress { id: Option<String> },
    /// Report datetime fields whose index kind drifted.
    CheckSchema,
    /// Show the counters of a migration's last run.
    Stats { id: Option<String> },
}

fn exit_code_for(err: &OmError) -> i32 {
    match err {
        OmError::Connection(_) | OmError::Timeout(_) => EXIT_TRANSIENT,
        _ => EXIT_FATAL,
    }
}

/// Execute one CLI command, printing human-readable output. Returns the
/// process exit code.
pub async fn run(om: &Om, data: &mut DataMigrator, command: Command) -> i32 {
    match command {
        Command::Migrate(action) => {
            let migrator = SchemaMigrator::new(
                om.client().clone(),
                om.registered_schemas(),
                om.config().schema_migrations_dir(),
            );
            run_schema(&migrator, action).await
        }
        Command::MigrateData(action) => run_data(om, data, action).await,
    }
}

async fn run_schema(migrator: &SchemaMigrator, action: MigrateAction) -> i32 {
    match action {
        MigrateAction::Status => match migrator.status().await {
            Ok(statuses) => {
                if statuses.is_empty() {
                    println!("no record types registered");
                }
                for status in statuses {
                    println!(
                        "{:<24} {:<32} {:?}",
                        status.record, status.index_name, status.state
                    );
                }
                EXIT_OK
            }
            Err(e) => report(e),
        },
        MigrateAction::Create { slug } => match migrator.create(&slug).await {
            Ok(paths) => {
                if paths.is_empty() {
                    println!("no schema changes detected");
                } else {
                    for path in paths {
                        println!("wrote {}", path.display());
                    }
                }
                EXIT_OK
            }
            Err(e) => report(e),
        },
        MigrateAction::Run => match migrator.run().await {
            Ok(0) => {
                println!("no pending schema migrations");
                EXIT_OK
            }
            Ok(n) => {
                println!("applied {n} schema migration(s)");
                EXIT_OK
            }
            Err(e) => report(e),
        },
        MigrateAction::Rollback { id } => match migrator.rollback(&id).await {
            Ok(true) => {
                println!("rolled back {id}");
                EXIT_OK
            }
            Ok(false) => {
                println!("{id} is not applied");
                EXIT_OK
            }
            Err(e) => report(e),
        },
    }
}

async fn run_data(om: &Om, data: &mut DataMigrator, action: MigrateDataAction) -> i32 {
    match action {
        MigrateDataAction::Status => match data.status().await {
            Ok(status) => {
                println!(
                    "{} total, {} applied, {} pending",
                    status.total,
                    status.applied.len(),
                    status.pending.len()
                );
                for id in &status.pending {
                    println!("pending: {id}");
                }
                EXIT_OK
            }
            Err(e) => report(e),
        },
        MigrateDataAction::Create { slug } => {
            match data.create_file(&om.config().data_migrations_dir(), &slug) {
                Ok(path) => {
                    println!("wrote {}", path.display());
                    EXIT_OK
                }
                Err(e) => report(e),
            }
        }
        MigrateDataAction::Run {
            dry_run,
            batch_size,
            failure_mode,
            max_errors,
            limit,
        } => {
            let mut options = MigrationOptions {
                dry_run,
                max_errors,
                ..data.options().clone()
            };
            if let Some(size) = batch_size {
                options.batch_size = size;
            }
            if let Some(mode) = failure_mode {
                match mode.parse() {
                    Ok(mode) => options.failure_mode = mode,
                    Err(e) => {
                        eprintln!("{e}");
                        return EXIT_FATAL;
                    }
                }
            }
            data.set_options(options);
            match data.run(limit).await {
                Ok(report) => {
                    if report.applied.is_empty() {
                        println!("no pending data migrations");
                    }
                    for (id, stats) in &report.stats {
                        println!(
                            "{id}: seen={} ok={} skipped={} errored={}{}",
                            stats.seen,
                            stats.ok,
                            stats.skipped,
                            stats.errored,
                            if report.dry_run { " (dry run)" } else { "" }
                        );
                    }
                    if report.had_errors() {
                        EXIT_PARTIAL
                    } else {
                        EXIT_OK
                    }
                }
                Err(e) => report(e),
            }
        }
        MigrateDataAction::Verify { check_data } => match data.verify(check_data).await {
            Ok(report) => {
                for id in &report.pending {
                    println!("pending: {id}");
                }
                for drift in &report.drift {
                    println!(
                        "drift: {}.{} is {} on index {} (expected {})",
                        drift.record, drift.field, drift.server_kind, drift.index,
                        drift.expected_kind
                    );
                }
                if let Some(count) = report.legacy_values {
                    println!("legacy datetime values: {count}");
                }
                if report.clean() {
                    println!("verified: no pending work");
                    EXIT_OK
                } else {
                    EXIT_FATAL
                }
            }
            Err(e) => report(e),
        },
        MigrateDataAction::Rollback { id } => match data.rollback(&id).await {
            Ok(true) => {
                println!("rolled back {id}");
                EXIT_OK
            }
            Ok(false) => {
                println!("{id} is not applied");
                EXIT_OK
            }
            Err(e) => report(e),
        },
        MigrateDataAction::Progress { id } => {
            let id = id.unwrap_or_else(|| DATETIME_MIGRATION_ID.to_string());
            match data.progress(&id).await {
                Ok(Some(progress)) => {
                    println!(
                        "{id}: record={:?} cursor={} last_key={:?} seen={} ok={} skipped={} errored={} at {}",
                        progress.record,
                        progress.cursor,
                        progress.last_key,
                        progress.stats.seen,
                        progress.stats.ok,
                        progress.stats.skipped,
                        progress.stats.errored,
                        progress.updated_at
                    );
                    EXIT_OK
                }
                Ok(None) => {
                    println!("{id}: no saved checkpoint");
                    EXIT_OK
                }
                Err(e) => report(e),
            }
        }
        MigrateDataAction::ClearProgress { id } => {
            let id = id.unwrap_or_else(|| DATETIME_MIGRATION_ID.to_string());
            match data.clear_progress(&id).await {
                Ok(()) => {
                    println!("cleared checkpoint for {id}");
                    EXIT_OK
                }
                Err(e) => report(e),
            }
        }
        MigrateDataAction::CheckSchema => {
            match crate::migrate::datetime::check_schema(om.client(), &om.registered_schemas())
                .await
            {
                Ok(drift) if drift.is_empty() => {
                    println!("no datetime index drift");
                    EXIT_OK
                }
                Ok(drift) => {
                    for d in drift {
                        println!(
                            "drift: {}.{} is {} on index {} (expected {})",
                            d.record, d.field, d.server_kind, d.index, d.expected_kind
                        );
                    }
                    EXIT_FATAL
                }
                Err(e) => report(e),
            }
        }
        MigrateDataAction::Stats { id } => {
            let id = id.unwrap_or_else(|| DATETIME_MIGRATION_ID.to_string());
            match data.progress(&id).await {
                Ok(Some(progress)) => {
                    println!(
                        "{id}: seen={} ok={} skipped={} errored={}",
                        progress.stats.seen,
                        progress.stats.ok,
                        progress.stats.skipped,
                        progress.stats.errored
                    );
                    EXIT_OK
                }
                Ok(None) => {
                    println!("{id}: no recorded stats");
                    EXIT_OK
                }
                Err(e) => report(e),
            }
        }
    }
}

fn report(err: OmError) -> i32 {
    eprintln!("error: {err}");
    exit_code_for(&err)
}
