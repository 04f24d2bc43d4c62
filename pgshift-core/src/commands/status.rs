//! Show migration state by merging the directory with the bookkeeping table.

use tokio_postgres::Client;

use crate::config::PgshiftConfig;
use crate::error::Result;
use crate::executor::{Executor, StatusReport};
use crate::migration::scan_migrations;

/// Execute the status command.
pub async fn execute(client: &Client, config: &PgshiftConfig) -> Result<StatusReport> {
    let migrations = scan_migrations(&config.migrations.directory)?;
    Executor::new(client, config).status(&migrations).await
}
