//! Write a new up/down migration pair for the pending schema changes.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::commands::diff::{compute, SchemaSource};
use crate::config::PgshiftConfig;
use crate::conversion::requires_manual_review;
use crate::error::Result;
use crate::migration::write_migration;

/// Report produced by the generate command.
#[derive(Debug, Serialize)]
pub struct GenerateReport {
    pub has_changes: bool,
    pub version: Option<String>,
    pub name: Option<String>,
    pub up_path: Option<PathBuf>,
    pub down_path: Option<PathBuf>,
    pub up_statements: usize,
    pub down_statements: usize,
    /// The up file carries a manual-review placeholder and will not apply as is.
    pub manual_review: bool,
}

/// Execute the generate command. Writes nothing when there are no changes.
pub async fn execute(
    source: SchemaSource<'_>,
    config: &PgshiftConfig,
    declared_path: &Path,
    name: &str,
) -> Result<GenerateReport> {
    let (diff, plan) = compute(source, config, declared_path).await?;

    if !diff.has_changes() {
        log::info!("Generate found no changes; nothing written");
        return Ok(GenerateReport {
            has_changes: false,
            version: None,
            name: None,
            up_path: None,
            down_path: None,
            up_statements: 0,
            down_statements: 0,
            manual_review: false,
        });
    }

    let migration = write_migration(&config.migrations.directory, name, &plan)?;
    let manual_review = requires_manual_review(&migration.up_sql);
    if manual_review {
        log::warn!(
            "Generated migration needs manual review before it can be applied; version={}",
            migration.version
        );
    }

    Ok(GenerateReport {
        has_changes: true,
        version: Some(migration.version),
        name: Some(migration.name),
        up_path: migration.up_path,
        down_path: migration.down_path,
        up_statements: plan.up.len(),
        down_statements: plan.down.len(),
        manual_review,
    })
}
