//! Apply pending migrations to the database.

use tokio_postgres::Client;

use crate::config::PgshiftConfig;
use crate::error::Result;
use crate::executor::{Executor, MigrateReport};
use crate::migration::scan_migrations;

/// Execute the migrate command.
///
/// With `target` set, only migrations at or below that version are considered.
pub async fn execute(
    client: &Client,
    config: &PgshiftConfig,
    target: Option<&str>,
    dry_run: bool,
) -> Result<MigrateReport> {
    let mut migrations = scan_migrations(&config.migrations.directory)?;
    if let Some(target) = target {
        migrations.retain(|m| m.version.as_str() <= target);
    }
    log::debug!(
        "Scanned migrations; directory={}, count={}",
        config.migrations.directory.display(),
        migrations.len()
    );

    Executor::new(client, config)
        .apply_all(&migrations, dry_run)
        .await
}
