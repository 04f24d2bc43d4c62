//! Transactional migration execution with advisory locking and bookkeeping.
//!
//! Every migration runs in one transaction. The bookkeeping row is written
//! before a savepoint, so when a statement fails the migration's own effects
//! roll back while the `failed` status (and its error) still commits.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;

use crate::config::PgshiftConfig;
use crate::conversion::requires_manual_review;
use crate::db;
use crate::error::{format_db_error, PgshiftError, Result};
use crate::history::{self, MigrationRecord};
use crate::migration::{Direction, Migration, MigrationStatus};
use crate::sql_parser::{executable_statements, find_non_transactional};

const SAVEPOINT: &str = "pgshift_migration";

/// Outcome of applying or rolling back one migration.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetail {
    pub version: String,
    pub name: String,
    pub statements: usize,
    pub execution_time_ms: i32,
    pub dry_run: bool,
}

/// Report returned by `apply_all`.
#[derive(Debug, Serialize)]
pub struct MigrateReport {
    pub migrations_applied: usize,
    pub total_time_ms: i32,
    pub dry_run: bool,
    pub details: Vec<ExecutionDetail>,
}

/// Report returned by `rollback_to`.
#[derive(Debug, Serialize)]
pub struct RollbackReport {
    pub target: String,
    pub migrations_rolled_back: usize,
    pub total_time_ms: i32,
    pub dry_run: bool,
    pub details: Vec<ExecutionDetail>,
}

/// State of a migration as seen by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Pending,
    Applied,
    Failed,
    /// Recorded in the bookkeeping table but the file is gone.
    Missing,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationState::Pending => "pending",
            MigrationState::Applied => "applied",
            MigrationState::Failed => "failed",
            MigrationState::Missing => "missing",
        };
        f.write_str(s)
    }
}

impl From<MigrationStatus> for MigrationState {
    fn from(status: MigrationStatus) -> Self {
        match status {
            MigrationStatus::Pending => MigrationState::Pending,
            MigrationStatus::Applied => MigrationState::Applied,
            MigrationStatus::Failed => MigrationState::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub version: String,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub has_down: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
}

impl StatusReport {
    pub fn count(&self, state: MigrationState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }
}

/// Report returned by `validate`.
#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub valid: bool,
    /// Recorded versions with no migration file on disk.
    pub missing: Vec<String>,
    /// Versions whose last run failed.
    pub failed: Vec<String>,
    /// Unapplied versions still carrying the manual-review marker.
    pub manual_review: Vec<String>,
}

/// Merge bookkeeping records with the migration files on disk.
pub fn merge_status(migrations: &[Migration], records: &[MigrationRecord]) -> StatusReport {
    let by_version: BTreeMap<&str, &MigrationRecord> =
        records.iter().map(|r| (r.version.as_str(), r)).collect();

    let mut entries: Vec<StatusEntry> = migrations
        .iter()
        .map(|m| {
            let record = by_version.get(m.version.as_str());
            StatusEntry {
                version: m.version.clone(),
                name: m.name.clone(),
                state: record
                    .map(|r| MigrationState::from(r.status))
                    .unwrap_or(MigrationState::Pending),
                applied_at: record.and_then(|r| r.applied_at),
                error: record.and_then(|r| r.error.clone()),
                has_down: m.down_sql.is_some(),
            }
        })
        .collect();

    for record in records {
        if !migrations.iter().any(|m| m.version == record.version) {
            entries.push(StatusEntry {
                version: record.version.clone(),
                name: record.name.clone(),
                state: MigrationState::Missing,
                applied_at: record.applied_at,
                error: record.error.clone(),
                has_down: false,
            });
        }
    }

    entries.sort_by(|a, b| a.version.cmp(&b.version));
    StatusReport { entries }
}

/// Check bookkeeping records against the migration files on disk.
pub fn validate_records(migrations: &[Migration], records: &[MigrationRecord]) -> ValidateReport {
    let missing: Vec<String> = records
        .iter()
        .filter(|r| !migrations.iter().any(|m| m.version == r.version))
        .map(|r| r.version.clone())
        .collect();
    let failed: Vec<String> = records
        .iter()
        .filter(|r| r.status == MigrationStatus::Failed)
        .map(|r| r.version.clone())
        .collect();
    let manual_review: Vec<String> = migrations
        .iter()
        .filter(|m| {
            !records
                .iter()
                .any(|r| r.version == m.version && r.status == MigrationStatus::Applied)
        })
        .filter(|m| requires_manual_review(&m.up_sql))
        .map(|m| m.version.clone())
        .collect();

    ValidateReport {
        valid: missing.is_empty() && failed.is_empty() && manual_review.is_empty(),
        missing,
        failed,
        manual_review,
    }
}

/// Reject SQL the executor must not run inside its transaction.
fn check_runnable(version: &str, sql: &str) -> Result<()> {
    if requires_manual_review(sql) {
        return Err(PgshiftError::ManualReviewRequired {
            version: version.to_string(),
        });
    }
    if let Some(statement) = find_non_transactional(sql) {
        return Err(PgshiftError::NonTransactionalStatement {
            version: version.to_string(),
            statement,
        });
    }
    Ok(())
}

fn elapsed_ms(start: Instant) -> i32 {
    start.elapsed().as_millis().min(i32::MAX as u128) as i32
}

/// Applies and rolls back migrations against one connection.
pub struct Executor<'a> {
    client: &'a Client,
    schema: String,
    table: String,
    lock_key: i64,
    lock_timeout_secs: u32,
}

impl<'a> Executor<'a> {
    pub fn new(client: &'a Client, config: &PgshiftConfig) -> Self {
        Executor {
            client,
            schema: config.migrations.schema.clone(),
            table: config.migrations.table.clone(),
            lock_key: config.migrations.lock_key,
            lock_timeout_secs: config.migrations.lock_timeout_secs,
        }
    }

    /// Build an executor for an explicit bookkeeping location.
    pub fn with_table(
        client: &'a Client,
        schema: impl Into<String>,
        table: impl Into<String>,
        lock_key: i64,
    ) -> Self {
        Executor {
            client,
            schema: schema.into(),
            table: table.into(),
            lock_key,
            lock_timeout_secs: 0,
        }
    }

    /// Take the session advisory lock, waiting up to the configured timeout
    /// (or indefinitely when it is zero).
    pub async fn lock(&self) -> Result<()> {
        if self.lock_timeout_secs > 0 {
            db::acquire_advisory_lock_with_timeout(self.client, self.lock_key, self.lock_timeout_secs)
                .await
        } else {
            db::acquire_advisory_lock(self.client, self.lock_key).await
        }
    }

    pub async fn try_lock(&self) -> Result<bool> {
        db::try_advisory_lock(self.client, self.lock_key).await
    }

    pub async fn unlock(&self) -> Result<bool> {
        db::release_advisory_lock(self.client, self.lock_key).await
    }

    pub async fn ensure_table(&self) -> Result<()> {
        history::create_table(self.client, &self.schema, &self.table).await
    }

    /// All bookkeeping records; empty when the table does not exist yet.
    pub async fn records(&self) -> Result<Vec<MigrationRecord>> {
        if !history::table_exists(self.client, &self.schema, &self.table).await? {
            return Ok(Vec::new());
        }
        history::get_records(self.client, &self.schema, &self.table).await
    }

    async fn record(&self, version: &str) -> Result<Option<MigrationRecord>> {
        if !history::table_exists(self.client, &self.schema, &self.table).await? {
            return Ok(None);
        }
        history::get_record(self.client, &self.schema, &self.table, version).await
    }

    /// Run `work` while holding the session advisory lock. The lock is released
    /// whatever the outcome.
    async fn locked<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        self.lock().await?;
        let result = work.await;
        if let Err(e) = self.unlock().await {
            log::warn!("Failed to release advisory lock: {}", e);
        }
        result
    }

    /// Apply one migration's forward SQL under the advisory lock.
    pub async fn apply(&self, migration: &Migration, dry_run: bool) -> Result<ExecutionDetail> {
        self.locked(self.apply_unlocked(migration, dry_run)).await
    }

    async fn apply_unlocked(&self, migration: &Migration, dry_run: bool) -> Result<ExecutionDetail> {
        if let Some(record) = self.record(&migration.version).await? {
            if record.status == MigrationStatus::Applied {
                return Err(PgshiftError::AlreadyApplied {
                    version: migration.version.clone(),
                });
            }
        }
        check_runnable(&migration.version, &migration.up_sql)?;

        let statements = executable_statements(&migration.up_sql);
        if dry_run {
            log::info!(
                "Dry run, migration not applied; version={}, statements={}",
                migration.version,
                statements.len()
            );
            return Ok(ExecutionDetail {
                version: migration.version.clone(),
                name: migration.name.clone(),
                statements: statements.len(),
                execution_time_ms: 0,
                dry_run: true,
            });
        }

        self.ensure_table().await?;
        log::info!(
            "Applying migration; version={}, name={}",
            migration.version,
            migration.name
        );
        let start = Instant::now();
        self.execute_migration(migration, &statements, Direction::Up)
            .await?;
        let execution_time_ms = elapsed_ms(start);
        log::info!(
            "Migration applied; version={}, time_ms={}",
            migration.version,
            execution_time_ms
        );

        Ok(ExecutionDetail {
            version: migration.version.clone(),
            name: migration.name.clone(),
            statements: statements.len(),
            execution_time_ms,
            dry_run: false,
        })
    }

    /// Run one migration's down SQL and delete its record, under the advisory lock.
    pub async fn rollback(&self, migration: &Migration, dry_run: bool) -> Result<ExecutionDetail> {
        self.locked(self.rollback_unlocked(migration, dry_run)).await
    }

    async fn rollback_unlocked(
        &self,
        migration: &Migration,
        dry_run: bool,
    ) -> Result<ExecutionDetail> {
        let applied = matches!(
            self.record(&migration.version).await?,
            Some(ref r) if r.status == MigrationStatus::Applied
        );
        if !applied {
            return Err(PgshiftError::NotApplied {
                version: migration.version.clone(),
            });
        }
        let down_sql = migration.down_sql.as_deref().ok_or_else(|| {
            PgshiftError::MigrationParseError(format!(
                "Migration {} has no down file",
                migration.version
            ))
        })?;
        check_runnable(&migration.version, down_sql)?;

        let statements = executable_statements(down_sql);
        if dry_run {
            log::info!(
                "Dry run, migration not rolled back; version={}, statements={}",
                migration.version,
                statements.len()
            );
            return Ok(ExecutionDetail {
                version: migration.version.clone(),
                name: migration.name.clone(),
                statements: statements.len(),
                execution_time_ms: 0,
                dry_run: true,
            });
        }

        log::info!(
            "Rolling back migration; version={}, name={}",
            migration.version,
            migration.name
        );
        let start = Instant::now();
        self.execute_migration(migration, &statements, Direction::Down)
            .await?;
        let execution_time_ms = elapsed_ms(start);
        log::info!(
            "Migration rolled back; version={}, time_ms={}",
            migration.version,
            execution_time_ms
        );

        Ok(ExecutionDetail {
            version: migration.version.clone(),
            name: migration.name.clone(),
            statements: statements.len(),
            execution_time_ms,
            dry_run: false,
        })
    }

    /// Apply every migration not yet applied, in version order, under the lock.
    pub async fn apply_all(&self, migrations: &[Migration], dry_run: bool) -> Result<MigrateReport> {
        let result = self.locked(self.run_apply_all(migrations, dry_run)).await;

        match &result {
            Ok(report) => log::info!(
                "Migrate completed; migrations_applied={}, total_time_ms={}, dry_run={}",
                report.migrations_applied,
                report.total_time_ms,
                report.dry_run
            ),
            Err(e) => log::error!("Migrate failed: {}", e),
        }

        result
    }

    async fn run_apply_all(&self, migrations: &[Migration], dry_run: bool) -> Result<MigrateReport> {
        let start = Instant::now();
        let records = self.records().await?;
        let by_version: BTreeMap<&str, &MigrationRecord> =
            records.iter().map(|r| (r.version.as_str(), r)).collect();

        let mut ordered: Vec<&Migration> = migrations.iter().collect();
        ordered.sort_by(|a, b| a.version.cmp(&b.version));

        let mut details = Vec::new();
        for migration in ordered {
            match by_version.get(migration.version.as_str()) {
                Some(r) if r.status == MigrationStatus::Applied => continue,
                Some(r) if r.status == MigrationStatus::Failed => {
                    return Err(PgshiftError::MigrationBlocked {
                        version: r.version.clone(),
                        reason: r.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                _ => {}
            }
            details.push(self.apply_unlocked(migration, dry_run).await?);
        }

        Ok(MigrateReport {
            migrations_applied: details.len(),
            total_time_ms: elapsed_ms(start),
            dry_run,
            details,
        })
    }

    /// Roll back every applied migration newer than `target`, newest first, under the lock.
    pub async fn rollback_to(
        &self,
        target: &str,
        migrations: &[Migration],
        dry_run: bool,
    ) -> Result<RollbackReport> {
        let result = self
            .locked(self.run_rollback_to(target, migrations, dry_run))
            .await;

        match &result {
            Ok(report) => log::info!(
                "Rollback completed; target={}, migrations_rolled_back={}, dry_run={}",
                report.target,
                report.migrations_rolled_back,
                report.dry_run
            ),
            Err(e) => log::error!("Rollback failed: {}", e),
        }

        result
    }

    async fn run_rollback_to(
        &self,
        target: &str,
        migrations: &[Migration],
        dry_run: bool,
    ) -> Result<RollbackReport> {
        let start = Instant::now();
        let mut applied: Vec<MigrationRecord> = self
            .records()
            .await?
            .into_iter()
            .filter(|r| r.status == MigrationStatus::Applied && r.version.as_str() > target)
            .collect();
        applied.sort_by(|a, b| b.version.cmp(&a.version));

        let mut details = Vec::new();
        for record in &applied {
            let migration = migrations
                .iter()
                .find(|m| m.version == record.version)
                .ok_or_else(|| {
                    PgshiftError::ValidationFailed(format!(
                        "Applied migration {} has no migration file",
                        record.version
                    ))
                })?;
            details.push(self.rollback_unlocked(migration, dry_run).await?);
        }

        Ok(RollbackReport {
            target: target.to_string(),
            migrations_rolled_back: details.len(),
            total_time_ms: elapsed_ms(start),
            dry_run,
            details,
        })
    }

    pub async fn status(&self, migrations: &[Migration]) -> Result<StatusReport> {
        let records = self.records().await?;
        Ok(merge_status(migrations, &records))
    }

    pub async fn validate(&self, migrations: &[Migration]) -> Result<ValidateReport> {
        let records = self.records().await?;
        let report = validate_records(migrations, &records);
        if !report.valid {
            log::warn!(
                "Validation found problems; missing={}, failed={}, manual_review={}",
                report.missing.len(),
                report.failed.len(),
                report.manual_review.len()
            );
        }
        Ok(report)
    }

    async fn execute_migration(
        &self,
        migration: &Migration,
        statements: &[&str],
        direction: Direction,
    ) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;

        match self.execute_steps(migration, statements, direction).await {
            Ok(None) => {
                self.client.batch_execute("COMMIT").await?;
                Ok(())
            }
            Ok(Some((statement, reason))) => {
                let label = match direction {
                    Direction::Up => "statement",
                    Direction::Down => "rollback statement",
                };
                let error = format!("{} {}: {}", label, statement, reason);
                if let Err(e) = self.record_failure(&migration.version, &error).await {
                    log::warn!(
                        "Failed to record migration failure; version={}, error={}",
                        migration.version,
                        e
                    );
                    if let Err(rb) = self.client.batch_execute("ROLLBACK").await {
                        log::warn!("Rollback after failed status write also failed: {}", rb);
                    }
                }
                log::error!(
                    "Migration failed; version={}, statement={}, reason={}",
                    migration.version,
                    statement,
                    reason
                );
                Err(PgshiftError::MigrationFailed {
                    version: migration.version.clone(),
                    statement,
                    reason,
                })
            }
            Err(e) => {
                if let Err(rb) = self.client.batch_execute("ROLLBACK").await {
                    log::warn!("Failed to roll back transaction: {}", rb);
                }
                Err(e)
            }
        }
    }

    /// Runs inside the open transaction. Returns the 1-based index and
    /// reason of the first failing statement, leaving the transaction open.
    async fn execute_steps(
        &self,
        migration: &Migration,
        statements: &[&str],
        direction: Direction,
    ) -> Result<Option<(usize, String)>> {
        // Unqualified names in migration SQL resolve to the managed schema.
        self.client
            .batch_execute(&format!(
                "SET LOCAL search_path TO {}",
                db::quote_ident(&self.schema)
            ))
            .await?;

        if direction == Direction::Up {
            history::upsert_pending(
                self.client,
                &self.schema,
                &self.table,
                &migration.version,
                &migration.name,
            )
            .await?;
        }

        self.client
            .batch_execute(&format!("SAVEPOINT {}", SAVEPOINT))
            .await?;

        for (i, stmt) in statements.iter().enumerate() {
            log::debug!(
                "Executing statement; version={}, statement={}",
                migration.version,
                i + 1
            );
            if let Err(e) = self.client.batch_execute(stmt).await {
                return Ok(Some((i + 1, format_db_error(&e))));
            }
        }

        self.client
            .batch_execute(&format!("RELEASE SAVEPOINT {}", SAVEPOINT))
            .await?;

        match direction {
            Direction::Up => {
                history::mark_applied(self.client, &self.schema, &self.table, &migration.version)
                    .await?
            }
            Direction::Down => {
                history::delete_record(self.client, &self.schema, &self.table, &migration.version)
                    .await?;
            }
        }
        Ok(None)
    }

    async fn record_failure(&self, version: &str, error: &str) -> Result<()> {
        self.client
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT))
            .await?;
        history::mark_failed(self.client, &self.schema, &self.table, version, error).await?;
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, status: MigrationStatus) -> MigrationRecord {
        MigrationRecord {
            version: version.to_string(),
            name: format!("m{}", version),
            status,
            applied_at: None,
            error: match status {
                MigrationStatus::Failed => Some("statement 1: boom".to_string()),
                _ => None,
            },
            created_at: Utc::now(),
        }
    }

    fn migration(version: &str, up: &str) -> Migration {
        Migration::new(version, format!("m{}", version), up, Some("SELECT 1;".to_string()))
    }

    #[test]
    fn test_merge_status_reports_pending_and_missing() {
        let files = vec![
            migration("20240101000000", "SELECT 1;"),
            migration("20240102000000", "SELECT 1;"),
        ];
        let records = vec![
            record("20240101000000", MigrationStatus::Applied),
            record("20231231000000", MigrationStatus::Applied),
        ];
        let report = merge_status(&files, &records);

        let states: Vec<(&str, MigrationState)> = report
            .entries
            .iter()
            .map(|e| (e.version.as_str(), e.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("20231231000000", MigrationState::Missing),
                ("20240101000000", MigrationState::Applied),
                ("20240102000000", MigrationState::Pending),
            ]
        );
        assert_eq!(report.count(MigrationState::Pending), 1);
    }

    #[test]
    fn test_validate_lists_missing_versions() {
        let files = vec![migration("20240101000000", "SELECT 1;")];
        let records = vec![
            record("20240101000000", MigrationStatus::Applied),
            record("20231201000000", MigrationStatus::Applied),
            record("20231101000000", MigrationStatus::Applied),
        ];
        let report = validate_records(&files, &records);
        assert!(!report.valid);
        assert_eq!(report.missing, vec!["20231101000000", "20231201000000"]);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_validate_flags_failed_and_manual_review() {
        let files = vec![
            migration("20240101000000", "SELECT 1;"),
            migration(
                "20240102000000",
                "-- pgshift:manual-review column t.c: no safe conversion\n-- ALTER TABLE t ...;",
            ),
        ];
        let records = vec![record("20240101000000", MigrationStatus::Failed)];
        let report = validate_records(&files, &records);
        assert!(!report.valid);
        assert_eq!(report.failed, vec!["20240101000000"]);
        assert_eq!(report.manual_review, vec!["20240102000000"]);
    }

    #[test]
    fn test_validate_clean() {
        let files = vec![migration("20240101000000", "SELECT 1;")];
        let records = vec![record("20240101000000", MigrationStatus::Applied)];
        assert!(validate_records(&files, &records).valid);
    }

    #[test]
    fn test_check_runnable_rejects_marker_and_concurrently() {
        let err = check_runnable("1", "-- pgshift:manual-review x\n-- ALTER ...;").unwrap_err();
        assert!(matches!(err, PgshiftError::ManualReviewRequired { .. }));

        let err = check_runnable("1", "CREATE INDEX CONCURRENTLY i ON t (a);").unwrap_err();
        assert!(matches!(err, PgshiftError::NonTransactionalStatement { .. }));

        assert!(check_runnable("1", "CREATE INDEX i ON t (a);").is_ok());
    }
}
