//! Bookkeeping table operations (create, query, upsert, mark, delete).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::{Client, Row};

use crate::db::quote_ident;
use crate::error::Result;
use crate::migration::MigrationStatus;

/// A row from the bookkeeping table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub status: MigrationStatus,
    pub applied_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn fq(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn record_from_row(row: &Row) -> Result<MigrationRecord> {
    let status: String = row.get(2);
    Ok(MigrationRecord {
        version: row.get(0),
        name: row.get(1),
        status: status.parse()?,
        applied_at: row.get(3),
        error: row.get(4),
        created_at: row.get(5),
    })
}

/// Create the bookkeeping table and its status index if they do not exist.
pub async fn create_table(client: &Client, schema: &str, table: &str) -> Result<()> {
    let idx_name = format!("{}_status_idx", table);
    let sql = format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {fq} (
    version    VARCHAR(14) PRIMARY KEY,
    name       VARCHAR(255) NOT NULL,
    status     VARCHAR(16) NOT NULL DEFAULT 'pending',
    applied_at TIMESTAMPTZ,
    error      TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS {idx_name} ON {fq} (status);
"#,
        schema = quote_ident(schema),
        fq = fq(schema, table),
        idx_name = quote_ident(&idx_name),
    );

    client.batch_execute(&sql).await?;
    Ok(())
}

/// Check if the bookkeeping table exists.
pub async fn table_exists(client: &Client, schema: &str, table: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )",
            &[&schema, &table],
        )
        .await?;

    Ok(row.get::<_, bool>(0))
}

/// All records, ordered by version.
pub async fn get_records(client: &Client, schema: &str, table: &str) -> Result<Vec<MigrationRecord>> {
    let sql = format!(
        "SELECT version, name, status, applied_at, error, created_at FROM {} ORDER BY version",
        fq(schema, table)
    );
    let rows = client.query(&sql, &[]).await?;
    rows.iter().map(record_from_row).collect()
}

/// The record for one version, if any.
pub async fn get_record(
    client: &Client,
    schema: &str,
    table: &str,
    version: &str,
) -> Result<Option<MigrationRecord>> {
    let sql = format!(
        "SELECT version, name, status, applied_at, error, created_at FROM {} WHERE version = $1",
        fq(schema, table)
    );
    let row = client.query_opt(&sql, &[&version]).await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Insert the record as pending, or reset an existing (failed) one to pending.
pub async fn upsert_pending(
    client: &Client,
    schema: &str,
    table: &str,
    version: &str,
    name: &str,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (version, name, status, applied_at, error) \
         VALUES ($1, $2, 'pending', NULL, NULL) \
         ON CONFLICT (version) DO UPDATE \
         SET name = EXCLUDED.name, status = 'pending', applied_at = NULL, error = NULL",
        fq(schema, table)
    );
    client.execute(&sql, &[&version, &name]).await?;
    Ok(())
}

pub async fn mark_applied(client: &Client, schema: &str, table: &str, version: &str) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET status = 'applied', applied_at = now(), error = NULL WHERE version = $1",
        fq(schema, table)
    );
    client.execute(&sql, &[&version]).await?;
    Ok(())
}

pub async fn mark_failed(
    client: &Client,
    schema: &str,
    table: &str,
    version: &str,
    error: &str,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET status = 'failed', error = $2 WHERE version = $1",
        fq(schema, table)
    );
    client.execute(&sql, &[&version, &error]).await?;
    Ok(())
}

/// Remove a record. Returns whether a row was deleted.
pub async fn delete_record(client: &Client, schema: &str, table: &str, version: &str) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE version = $1", fq(schema, table));
    let count = client.execute(&sql, &[&version]).await?;
    Ok(count > 0)
}
