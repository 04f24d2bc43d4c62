//! Compare the declared model against the current schema and plan the SQL.

use std::path::Path;

use serde::Serialize;
use tokio_postgres::Client;

use crate::config::PgshiftConfig;
use crate::declared::load_declared;
use crate::diff::{compare, SchemaDiff};
use crate::error::Result;
use crate::introspect::introspect;
use crate::model::SchemaModel;
use crate::naming::TableNameResolver;
use crate::plan::{MigrationPlan, Planner};
use crate::replay::replay_directory;

/// Where the current schema comes from.
#[derive(Clone, Copy)]
pub enum SchemaSource<'a> {
    /// Introspect a live database.
    Live(&'a Client),
    /// Replay the migration directory.
    Offline,
}

impl SchemaSource<'_> {
    fn label(&self) -> &'static str {
        match self {
            SchemaSource::Live(_) => "live",
            SchemaSource::Offline => "offline",
        }
    }
}

/// Report produced by the diff command.
#[derive(Debug, Serialize)]
pub struct DiffReport {
    /// `live` or `offline`.
    pub source: &'static str,
    pub diff: SchemaDiff,
    pub up_sql: String,
    pub down_sql: String,
    pub has_changes: bool,
    /// Up statements that still need an operator's decision.
    pub manual_review: usize,
}

/// Read the current schema from `source`.
pub async fn current_model(source: SchemaSource<'_>, config: &PgshiftConfig) -> Result<SchemaModel> {
    match source {
        SchemaSource::Live(client) => {
            introspect(client, &config.migrations.schema, &config.migrations.table).await
        }
        SchemaSource::Offline => replay_directory(&config.migrations.directory),
    }
}

/// Diff and plan without touching the filesystem beyond reading inputs.
pub async fn compute(
    source: SchemaSource<'_>,
    config: &PgshiftConfig,
    declared_path: &Path,
) -> Result<(SchemaDiff, MigrationPlan)> {
    let resolver = TableNameResolver::from_config(&config.naming);
    let declared = load_declared(declared_path, &resolver)?;
    let current = current_model(source, config).await?;

    let diff = compare(&declared, &current);
    let plan = Planner::new(config.migrations.idempotent).plan(&diff);
    Ok((diff, plan))
}

/// Execute the diff command.
pub async fn execute(
    source: SchemaSource<'_>,
    config: &PgshiftConfig,
    declared_path: &Path,
) -> Result<DiffReport> {
    let (diff, plan) = compute(source, config, declared_path).await?;
    let has_changes = diff.has_changes();
    let manual_review = plan
        .up
        .iter()
        .filter(|s| crate::conversion::requires_manual_review(s))
        .count();

    log::info!(
        "Diff completed; source={}, has_changes={}, up_statements={}, manual_review={}",
        source.label(),
        has_changes,
        plan.up.len(),
        manual_review
    );

    Ok(DiffReport {
        source: source.label(),
        up_sql: plan.up_sql(),
        down_sql: plan.down_sql(),
        diff,
        has_changes,
        manual_review,
    })
}
