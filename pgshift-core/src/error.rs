//! Error types for pgshift operations.

use thiserror::Error;

/// Render a driver error with the server-side detail that its `Display` omits.
///
/// Server errors carry their SQLSTATE, detail and hint; client-side failures
/// are rendered with their whole source chain.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db) = e.as_db_error() {
        let mut out = format!("{} (SQLSTATE {})", db.message(), db.code().code());
        for (label, value) in [("Detail", db.detail()), ("Hint", db.hint())] {
            if let Some(value) = value {
                out.push_str(&format!("\n  {label}: {value}"));
            }
        }
        return out;
    }

    let chain: Vec<String> = std::iter::successors(
        Some(e as &(dyn std::error::Error + 'static)),
        |err| err.source(),
    )
    .map(ToString::to_string)
    .collect();
    let mut out = chain.join(": ");
    if e.is_closed() {
        out.push_str("\n  Note: connection to the server was closed");
    }
    out
}

/// All error types that pgshift operations can produce.
#[derive(Error, Debug)]
pub enum PgshiftError {
    /// Invalid configuration: TOML, environment values or identifiers.
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Postgres error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    /// A migration filename or declared-model file could not be parsed.
    #[error("Cannot parse migration: {0}")]
    MigrationParseError(String),

    /// Catalog or migration DDL could not be parsed.
    #[error("DDL parse error: {0}")]
    DdlParseError(String),

    /// A filesystem I/O operation failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A JSON document (declared model, report) could not be read or written.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The migration is already recorded as applied.
    #[error("Migration {version} is already applied")]
    AlreadyApplied { version: String },

    /// A rollback was requested for a migration that was never applied.
    #[error("Migration {version} is not applied")]
    NotApplied { version: String },

    /// A statement inside a migration failed. `statement` is 1-based.
    #[error("Migration {version} failed at statement {statement}: {reason}")]
    MigrationFailed {
        version: String,
        statement: usize,
        reason: String,
    },

    /// A previously failed migration blocks batch application.
    #[error("Migration {version} is marked failed: {reason}. Re-apply it directly or delete its bookkeeping row.")]
    MigrationBlocked { version: String, reason: String },

    /// The migration still contains a conversion that needs an operator's decision.
    #[error("Migration {version} requires manual review before it can be applied")]
    ManualReviewRequired { version: String },

    /// A migration contains a statement that cannot run inside a transaction.
    #[error("Migration {version} contains non-transactional statement: {statement}")]
    NonTransactionalStatement { version: String, statement: String },

    /// The advisory lock could not be acquired or released.
    #[error("Advisory lock error: {0}")]
    LockError(String),

    /// One or more validation checks failed.
    #[error("Validation found problems:\n{0}")]
    ValidationFailed(String),
}

/// Convenience type alias for `Result<T, PgshiftError>`.
pub type Result<T> = std::result::Result<T, PgshiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_failed_display() {
        let err = PgshiftError::MigrationFailed {
            version: "20240101000000".to_string(),
            statement: 2,
            reason: "relation \"x\" does not exist".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Migration 20240101000000 failed at statement 2: relation \"x\" does not exist"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PgshiftError = io.into();
        assert!(matches!(err, PgshiftError::IoError(_)));
    }
}
