//! Roll back applied migrations down to a target version.

use tokio_postgres::Client;

use crate::config::PgshiftConfig;
use crate::error::Result;
use crate::executor::{Executor, RollbackReport};
use crate::migration::scan_migrations;

/// Execute the rollback command. `target` itself stays applied; use `"0"` to undo everything.
pub async fn execute(
    client: &Client,
    config: &PgshiftConfig,
    target: &str,
    dry_run: bool,
) -> Result<RollbackReport> {
    let migrations = scan_migrations(&config.migrations.directory)?;
    Executor::new(client, config)
        .rollback_to(target, &migrations, dry_run)
        .await
}
