//! Check applied migrations against the files on disk.

use tokio_postgres::Client;

use crate::config::PgshiftConfig;
use crate::error::{PgshiftError, Result};
use crate::executor::{Executor, ValidateReport};
use crate::migration::scan_migrations;

/// Execute the validate command.
///
/// Returns the report when everything checks out and `ValidationFailed` otherwise.
pub async fn execute(client: &Client, config: &PgshiftConfig) -> Result<ValidateReport> {
    let migrations = scan_migrations(&config.migrations.directory)?;
    let report = Executor::new(client, config).validate(&migrations).await?;

    if report.valid {
        log::info!("Validation passed; migrations={}", migrations.len());
        return Ok(report);
    }

    let mut problems = Vec::new();
    for version in &report.missing {
        problems.push(format!("applied migration {} has no file", version));
    }
    for version in &report.failed {
        problems.push(format!("migration {} is recorded as failed", version));
    }
    for version in &report.manual_review {
        problems.push(format!("migration {} still needs manual review", version));
    }
    Err(PgshiftError::ValidationFailed(problems.join("; ")))
}
