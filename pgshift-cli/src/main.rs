//! CLI entry point for the pgshift schema engine.
//! Provides clap-based command routing and exit code mapping based on error type.

mod output;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;

use pgshift_core::config::{CliOverrides, PgshiftConfig};
use pgshift_core::error::PgshiftError;
use pgshift_core::Pgshift;

/// Top-level CLI definition with global flags and subcommand dispatch.
#[derive(Parser)]
#[command(
    name = "pgshift",
    about = "Declarative PostgreSQL schema migrations",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Database URL (overrides config)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Target schema (overrides config)
    #[arg(long, value_name = "SCHEMA")]
    schema: Option<String>,

    /// Bookkeeping table name (overrides config)
    #[arg(long, value_name = "TABLE")]
    table: Option<String>,

    /// Migration directory (overrides config)
    #[arg(long, value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Advisory lock key (overrides config)
    #[arg(long, value_name = "KEY")]
    lock_key: Option<i64>,

    /// Seconds to wait for the advisory lock (0 = wait forever)
    #[arg(long, value_name = "SECS")]
    lock_timeout: Option<u32>,

    /// Emit plain DDL without IF [NOT] EXISTS guards
    #[arg(long)]
    no_idempotent: bool,

    /// Number of retries when connecting to the database
    #[arg(long, value_name = "N")]
    connect_retries: Option<u32>,

    /// SSL/TLS mode: disable, prefer, require
    #[arg(long, value_name = "MODE")]
    ssl_mode: Option<String>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u32>,

    /// Statement timeout in seconds (default: 0 = no limit)
    #[arg(long, value_name = "SECS")]
    statement_timeout: Option<u32>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// All available pgshift subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write an up/down migration pair for the pending schema changes
    Generate {
        /// Declared model (JSON)
        #[arg(long, value_name = "FILE")]
        declared: PathBuf,
        /// Migration name, used in the file names
        #[arg(long)]
        name: String,
        /// Replay the migration directory instead of introspecting the database
        #[arg(long)]
        offline: bool,
    },

    /// Show the differences and the SQL that would resolve them
    Diff {
        /// Declared model (JSON)
        #[arg(long, value_name = "FILE")]
        declared: PathBuf,
        /// Replay the migration directory instead of introspecting the database
        #[arg(long)]
        offline: bool,
    },

    /// Apply pending migrations
    Migrate {
        /// Migrate up to this version only
        #[arg(long, value_name = "VERSION")]
        target: Option<String>,
        /// Report what would run without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back applied migrations newer than a version
    Rollback {
        /// Keep this version applied (use 0 to roll back everything)
        #[arg(long, value_name = "VERSION")]
        to: String,
        /// Report what would run without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show migration status
    Status,

    /// Validate applied migrations against the migration directory
    Validate,

    /// Show which backends hold the advisory lock
    Unlock {
        /// Terminate the holding backends, releasing their session lock
        #[arg(long)]
        terminate: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json {
        "error"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or(filter))
        .format_target(false)
        .format_timestamp(None)
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &PgshiftError) -> i32 {
    match error {
        PgshiftError::ConfigError(_) => 2,
        PgshiftError::ValidationFailed(_) => 3,
        PgshiftError::DatabaseError(_) => 4,
        PgshiftError::MigrationFailed { .. } => 5,
        PgshiftError::MigrationBlocked { .. } => 5,
        PgshiftError::LockError(_) => 6,
        PgshiftError::ManualReviewRequired { .. } => 7,
        PgshiftError::NonTransactionalStatement { .. } => 7,
        PgshiftError::AlreadyApplied { .. } => 8,
        PgshiftError::NotApplied { .. } => 8,
        PgshiftError::MigrationParseError(_) => 9,
        PgshiftError::DdlParseError(_) => 9,
        _ => 1,
    }
}

/// Build configuration and dispatch the chosen subcommand.
async fn run(cli: Cli) -> Result<(), PgshiftError> {
    let json_output = cli.json;

    let overrides = CliOverrides {
        url: cli.url,
        schema: cli.schema,
        table: cli.table,
        directory: cli.directory,
        lock_key: cli.lock_key,
        idempotent: if cli.no_idempotent { Some(false) } else { None },
        connect_retries: cli.connect_retries,
        ssl_mode: cli.ssl_mode,
        connect_timeout: cli.connect_timeout,
        statement_timeout: cli.statement_timeout,
        lock_timeout: cli.lock_timeout,
    };

    let config = PgshiftConfig::load(cli.config.as_deref(), &overrides)?;

    // === Commands that don't need a DB connection ===

    match &cli.command {
        Commands::Diff {
            declared,
            offline: true,
        } => {
            let report = Pgshift::diff_offline(&config, declared).await?;
            print_diff(&report, json_output);
            return Ok(());
        }
        Commands::Generate {
            declared,
            name,
            offline: true,
        } => {
            let report = Pgshift::generate_offline(&config, declared, name).await?;
            print_generate(&report, json_output);
            return Ok(());
        }
        _ => {}
    }

    let shift = Pgshift::new(config).await?;

    match &cli.command {
        Commands::Generate { declared, name, .. } => {
            let report = shift.generate(declared, name).await?;
            print_generate(&report, json_output);
        }
        Commands::Diff { declared, .. } => {
            let report = shift.diff(declared).await?;
            print_diff(&report, json_output);
        }
        Commands::Migrate { target, dry_run } => {
            let report = shift.migrate(target.as_deref(), *dry_run).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
            } else {
                output::print_migrate_summary(&report);
            }
        }
        Commands::Rollback { to, dry_run } => {
            let report = shift.rollback(to, *dry_run).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
            } else {
                output::print_rollback_summary(&report);
            }
        }
        Commands::Status => {
            let report = shift.status().await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
            } else {
                output::print_status_table(&report);
            }
        }
        Commands::Validate => {
            let report = shift.validate().await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
            } else {
                output::print_validate_result(&report);
            }
        }
        Commands::Unlock { terminate } => {
            let report = shift.unlock(*terminate).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
            } else {
                output::print_unlock_result(&report);
            }
        }
    }

    Ok(())
}

fn print_diff(report: &pgshift_core::DiffReport, json_output: bool) {
    if json_output {
        println!("{}", serde_json::to_string_pretty(report).unwrap());
    } else {
        output::print_diff_report(report);
    }
}

fn print_generate(report: &pgshift_core::GenerateReport, json_output: bool) {
    if json_output {
        println!("{}", serde_json::to_string_pretty(report).unwrap());
    } else {
        output::print_generate_result(report);
    }
}

/// Print a formatted error message with actionable hints to stderr.
fn print_error(error: &PgshiftError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    match error {
        PgshiftError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check your pgshift.toml or set PGSHIFT_DATABASE_URL environment variable."
                    .dimmed()
            );
        }
        PgshiftError::DatabaseError(_) => {
            eprintln!(
                "{}",
                "Hint: Verify database is running and connection details are correct.".dimmed()
            );
        }
        PgshiftError::LockError(_) => {
            eprintln!(
                "{}",
                "Hint: Another pgshift run may hold the lock. 'pgshift unlock' shows the holding backend; 'pgshift unlock --terminate' ends it."
                    .dimmed()
            );
        }
        PgshiftError::ManualReviewRequired { .. } => {
            eprintln!(
                "{}",
                "Hint: Edit the migration and replace the -- pgshift:manual-review block with a real conversion."
                    .dimmed()
            );
        }
        PgshiftError::NonTransactionalStatement { .. } => {
            eprintln!(
                "{}",
                "Hint: Statements like CREATE INDEX CONCURRENTLY cannot run inside a transaction; run them outside pgshift."
                    .dimmed()
            );
        }
        PgshiftError::MigrationBlocked { .. } => {
            eprintln!(
                "{}",
                "Hint: Fix the failed migration, then apply it again; 'pgshift status' shows the recorded error."
                    .dimmed()
            );
        }
        _ => {}
    }
}
