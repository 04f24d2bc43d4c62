//! PostgreSQL schema engine: introspect a live schema, diff it against a
//! declared model, plan idempotent up/down SQL and apply it with bookkeeping.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use pgshift_core::config::{CliOverrides, PgshiftConfig};
//! use pgshift_core::Pgshift;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PgshiftConfig::load(None, &CliOverrides::default())?;
//! let shift = Pgshift::new(config).await?;
//! let generated = shift.generate(Path::new("schema.json"), "add orders").await?;
//! if generated.has_changes {
//!     let report = shift.migrate(None, false).await?;
//!     println!("Applied {} migrations", report.migrations_applied);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`]: configuration loading (TOML, env vars, CLI overrides)
//! - [`db`]: connections, TLS, identifier quoting, advisory locks
//! - [`model`]: the schema model shared by every stage
//! - [`introspect`]: read the model from a live database
//! - [`ddl_parser`]: tokenizer and parser for index and constraint DDL
//! - [`replay`]: rebuild the model offline from migration files
//! - [`declared`] / [`naming`]: load the declared model, resolve table names
//! - [`normalize`]: type, default and expression normalisation
//! - [`diff`]: compare two models
//! - [`dependency`]: foreign-key ordering of tables
//! - [`conversion`]: column type conversion safety
//! - [`plan`]: render a diff as up/down SQL
//! - [`migration`]: migration file naming, scanning and writing
//! - [`sql_parser`]: statement splitting
//! - [`history`]: bookkeeping table operations
//! - [`executor`]: apply and roll back migrations
//! - [`commands`]: individual command implementations
//! - [`error`]: error types

pub mod commands;
pub mod config;
pub mod conversion;
pub mod db;
pub mod ddl_parser;
pub mod declared;
pub mod dependency;
pub mod diff;
pub mod error;
pub mod executor;
pub mod history;
pub mod introspect;
pub mod migration;
pub mod model;
pub mod naming;
pub mod normalize;
pub mod plan;
pub mod replay;
pub mod sql_parser;

use std::path::Path;

use config::PgshiftConfig;
use error::Result;
use tokio_postgres::Client;

use commands::diff::SchemaSource;

pub use commands::diff::DiffReport;
pub use commands::generate::GenerateReport;
pub use commands::unlock::UnlockReport;
pub use config::CliOverrides;
pub use diff::SchemaDiff;
pub use error::PgshiftError;
pub use executor::{
    ExecutionDetail, Executor, MigrateReport, MigrationState, RollbackReport, StatusEntry,
    StatusReport, ValidateReport,
};
pub use model::SchemaModel;
pub use plan::{MigrationPlan, Planner};

/// Main entry point for the pgshift library.
pub struct Pgshift {
    pub config: PgshiftConfig,
    client: Client,
}

impl Pgshift {
    /// Connect using the configured database settings.
    ///
    /// If `connect_retries` is configured, retries with exponential backoff.
    pub async fn new(config: PgshiftConfig) -> Result<Self> {
        let client = db::connect_from_config(&config).await?;
        Ok(Self { config, client })
    }

    pub fn with_client(config: PgshiftConfig, client: Client) -> Self {
        Self { config, client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Introspect the configured schema.
    pub async fn introspect(&self) -> Result<SchemaModel> {
        introspect::introspect(
            &self.client,
            &self.config.migrations.schema,
            &self.config.migrations.table,
        )
        .await
    }

    /// Diff the declared model against the live schema.
    pub async fn diff(&self, declared: &Path) -> Result<DiffReport> {
        commands::diff::execute(SchemaSource::Live(&self.client), &self.config, declared).await
    }

    /// Diff the declared model against the replayed migration directory (no DB required).
    pub async fn diff_offline(config: &PgshiftConfig, declared: &Path) -> Result<DiffReport> {
        commands::diff::execute(SchemaSource::Offline, config, declared).await
    }

    /// Write a migration pair for the differences against the live schema.
    pub async fn generate(&self, declared: &Path, name: &str) -> Result<GenerateReport> {
        commands::generate::execute(SchemaSource::Live(&self.client), &self.config, declared, name)
            .await
    }

    /// Write a migration pair against the replayed migration directory (no DB required).
    pub async fn generate_offline(
        config: &PgshiftConfig,
        declared: &Path,
        name: &str,
    ) -> Result<GenerateReport> {
        commands::generate::execute(SchemaSource::Offline, config, declared, name).await
    }

    /// Apply pending migrations, optionally only up to `target`.
    pub async fn migrate(&self, target: Option<&str>, dry_run: bool) -> Result<MigrateReport> {
        commands::migrate::execute(&self.client, &self.config, target, dry_run).await
    }

    /// Roll back applied migrations newer than `target`.
    pub async fn rollback(&self, target: &str, dry_run: bool) -> Result<RollbackReport> {
        commands::rollback::execute(&self.client, &self.config, target, dry_run).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        commands::status::execute(&self.client, &self.config).await
    }

    pub async fn validate(&self) -> Result<ValidateReport> {
        commands::validate::execute(&self.client, &self.config).await
    }

    /// Report who holds the advisory lock; `terminate` ends those backends.
    pub async fn unlock(&self, terminate: bool) -> Result<UnlockReport> {
        commands::unlock::execute(&self.client, &self.config, terminate).await
    }
}
