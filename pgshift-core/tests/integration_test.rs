//! Integration tests for pgshift-core.
//!
//! Requires a running PostgreSQL instance.
//! Set TEST_DATABASE_URL env var, e.g.:
//!   TEST_DATABASE_URL="host=localhost user=postgres dbname=pgshift_test"
//!
//! Run with: cargo test --test integration_test

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use pgshift_core::config::{DatabaseConfig, MigrationSettings, PgshiftConfig};
use pgshift_core::db::{self, quote_ident};
use pgshift_core::error::PgshiftError;
use pgshift_core::executor::{Executor, MigrationState};
use pgshift_core::migration::{scan_migrations, Migration};
use pgshift_core::model::IndexTarget;
use pgshift_core::{introspect, Pgshift};

fn get_test_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Build a config pointing at a unique schema to isolate test runs.
fn test_config(schema: &str, migrations_dir: &Path) -> PgshiftConfig {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    PgshiftConfig {
        database: DatabaseConfig {
            url: Some(get_test_url()),
            ..Default::default()
        },
        migrations: MigrationSettings {
            directory: migrations_dir.to_path_buf(),
            schema: schema.to_string(),
            // Distinct keys keep parallel tests from serialising on one lock.
            lock_key: 7_100_000 + (std::process::id() as i64) * 1000 + id as i64,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper: connect, create a fresh schema, return client + schema name.
async fn setup_schema(prefix: &str) -> (tokio_postgres::Client, String) {
    let client = db::connect(&get_test_url())
        .await
        .expect("Failed to connect to DB");

    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let schema = format!("pgshift_test_{}_{}_{}", prefix, std::process::id(), id);

    client
        .batch_execute(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE; CREATE SCHEMA {}",
            quote_ident(&schema),
            quote_ident(&schema)
        ))
        .await
        .expect("Failed to create test schema");

    (client, schema)
}

async fn teardown_schema(client: &tokio_postgres::Client, schema: &str) {
    let _ = client
        .batch_execute(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            quote_ident(schema)
        ))
        .await;
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
}

async fn relation_exists(client: &tokio_postgres::Client, schema: &str, name: &str) -> bool {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2)",
            &[&schema, &name],
        )
        .await
        .unwrap();
    row.get(0)
}

const ORDERS_DECLARED: &str = r#"{
    "enum_types": [{"name": "order_status", "values": ["new", "paid", "shipped"]}],
    "tables": [
        {
            "type": "Account",
            "columns": [
                {"name": "id", "data_type": "integer", "nullable": false, "auto_increment": true},
                {"name": "email", "data_type": "varchar(255)", "nullable": false, "unique": true}
            ],
            "primary_key": {"columns": ["id"]}
        },
        {
            "type": "ShopOrder",
            "table": "orders",
            "columns": [
                {"name": "id", "data_type": "bigint", "nullable": false, "auto_increment": true},
                {"name": "account_id", "data_type": "integer", "nullable": false},
                {"name": "status", "data_type": "order_status", "nullable": false,
                 "default": "'new'::order_status", "enum_type": "order_status"},
                {"name": "total", "data_type": "numeric(10,2)", "nullable": false, "default": "0"},
                {"name": "created_at", "data_type": "timestamptz", "nullable": false, "default": "now()"},
                {"name": "shipped_at", "data_type": "timestamptz(3)"},
                {"name": "tags", "data_type": "varchar(20)[]"}
            ],
            "primary_key": {"columns": ["id"]},
            "indexes": [
                {"name": "orders_account_created_idx", "target": {"columns": ["account_id", "created_at"]}}
            ],
            "foreign_keys": [
                {
                    "name": "orders_account_id_fkey",
                    "columns": ["account_id"],
                    "referenced_table": "Account",
                    "referenced_columns": ["id"],
                    "on_delete": "cascade"
                }
            ],
            "constraints": [
                {"name": "orders_total_check", "kind": {"type": "check", "expression": "total >= 0"}}
            ]
        }
    ]
}"#;

// ─── Tests ───

#[tokio::test]
async fn test_migrate_applies_and_records_migrations() {
    let (client, schema) = setup_schema("migrate").await;
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            (
                "20240101000000_create_widgets.up.sql",
                "CREATE TABLE widgets (id serial PRIMARY KEY, label text NOT NULL);",
            ),
            (
                "20240101000000_create_widgets.down.sql",
                "DROP TABLE widgets;",
            ),
            (
                "20240102000000_add_price.up.sql",
                "-- price in cents\nALTER TABLE widgets ADD COLUMN price integer;\n\
                 CREATE INDEX widgets_price_idx ON widgets (price);",
            ),
            (
                "20240102000000_add_price.down.sql",
                "DROP INDEX widgets_price_idx;\nALTER TABLE widgets DROP COLUMN price;",
            ),
        ],
    );
    let config = test_config(&schema, dir.path());
    let shift = Pgshift::with_client(config, client);

    let report = shift.migrate(None, false).await.unwrap();
    assert_eq!(report.migrations_applied, 2);
    assert_eq!(report.details[1].statements, 2);
    assert!(relation_exists(shift.client(), &schema, "widgets").await);
    assert!(relation_exists(shift.client(), &schema, "widgets_price_idx").await);

    let status = shift.status().await.unwrap();
    assert_eq!(status.count(MigrationState::Applied), 2);
    assert!(status.entries.iter().all(|e| e.applied_at.is_some()));

    // Nothing left to do on a second run.
    let again = shift.migrate(None, false).await.unwrap();
    assert_eq!(again.migrations_applied, 0);

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_migrate_target_limits_versions() {
    let (client, schema) = setup_schema("target").await;
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("20240101000000_one.up.sql", "CREATE TABLE one (id int);"),
            ("20240102000000_two.up.sql", "CREATE TABLE two (id int);"),
        ],
    );
    let shift = Pgshift::with_client(test_config(&schema, dir.path()), client);

    let report = shift.migrate(Some("20240101000000"), false).await.unwrap();
    assert_eq!(report.migrations_applied, 1);
    assert!(relation_exists(shift.client(), &schema, "one").await);
    assert!(!relation_exists(shift.client(), &schema, "two").await);

    let status = shift.status().await.unwrap();
    assert_eq!(status.count(MigrationState::Pending), 1);

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let (client, schema) = setup_schema("dryrun").await;
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[(
            "20240101000000_create_things.up.sql",
            "CREATE TABLE things (id int);\nCREATE INDEX things_id_idx ON things (id);",
        )],
    );
    let config = test_config(&schema, dir.path());
    let shift = Pgshift::with_client(config, client);

    let report = shift.migrate(None, true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.migrations_applied, 1);
    assert_eq!(report.details[0].statements, 2);

    assert!(!relation_exists(shift.client(), &schema, "things").await);
    assert!(!relation_exists(shift.client(), &schema, "pgshift_migrations").await);

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_failed_statement_rolls_back_and_records_failure() {
    let (client, schema) = setup_schema("failure").await;
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("20240101000000_base.up.sql", "CREATE TABLE base (id int);"),
            (
                "20240102000000_broken.up.sql",
                "CREATE TABLE partial (id int);\nALTER TABLE missing_table ADD COLUMN x int;",
            ),
            ("20240103000000_after.up.sql", "CREATE TABLE after_broken (id int);"),
        ],
    );
    let shift = Pgshift::with_client(test_config(&schema, dir.path()), client);

    let err = shift.migrate(None, false).await.unwrap_err();
    match err {
        PgshiftError::MigrationFailed {
            version, statement, ..
        } => {
            assert_eq!(version, "20240102000000");
            assert_eq!(statement, 2);
        }
        other => panic!("expected MigrationFailed, got {:?}", other),
    }

    // The first migration stays; the broken one left nothing behind.
    assert!(relation_exists(shift.client(), &schema, "base").await);
    assert!(!relation_exists(shift.client(), &schema, "partial").await);
    assert!(!relation_exists(shift.client(), &schema, "after_broken").await);

    let status = shift.status().await.unwrap();
    let broken = status
        .entries
        .iter()
        .find(|e| e.version == "20240102000000")
        .unwrap();
    assert_eq!(broken.state, MigrationState::Failed);
    assert!(broken.error.as_deref().unwrap().starts_with("statement 2:"));

    // A failed record blocks batch application.
    let err = shift.migrate(None, false).await.unwrap_err();
    assert!(matches!(err, PgshiftError::MigrationBlocked { .. }));

    let err = shift.validate().await.unwrap_err();
    assert!(matches!(err, PgshiftError::ValidationFailed(_)));

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_failed_migration_can_be_fixed_and_reapplied() {
    let (client, schema) = setup_schema("retry").await;
    let dir = tempfile::tempdir().unwrap();
    let shift = Pgshift::with_client(test_config(&schema, dir.path()), client);
    let executor = Executor::new(shift.client(), &shift.config);

    let broken = Migration::new(
        "20240101000000",
        "retry",
        "CREATE TABLE retried (id int);\nSELECT 1/0;",
        None,
    );
    assert!(executor.apply(&broken, false).await.is_err());

    let fixed = Migration::new(
        "20240101000000",
        "retry",
        "CREATE TABLE retried (id int);",
        None,
    );
    executor.apply(&fixed, false).await.unwrap();
    assert!(relation_exists(shift.client(), &schema, "retried").await);

    let err = executor.apply(&fixed, false).await.unwrap_err();
    assert!(matches!(err, PgshiftError::AlreadyApplied { .. }));

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_rollback_to_target() {
    let (client, schema) = setup_schema("rollback").await;
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("20240101000000_a.up.sql", "CREATE TABLE a (id int);"),
            ("20240101000000_a.down.sql", "DROP TABLE a;"),
            ("20240102000000_b.up.sql", "CREATE TABLE b (id int);"),
            ("20240102000000_b.down.sql", "DROP TABLE b;"),
            ("20240103000000_c.up.sql", "CREATE TABLE c (id int);"),
            ("20240103000000_c.down.sql", "DROP TABLE c;"),
        ],
    );
    let shift = Pgshift::with_client(test_config(&schema, dir.path()), client);
    shift.migrate(None, false).await.unwrap();

    let dry = shift.rollback("20240101000000", true).await.unwrap();
    assert_eq!(dry.migrations_rolled_back, 2);
    assert!(relation_exists(shift.client(), &schema, "c").await);

    let report = shift.rollback("20240101000000", false).await.unwrap();
    assert_eq!(report.migrations_rolled_back, 2);
    // Newest first.
    assert_eq!(report.details[0].version, "20240103000000");
    assert_eq!(report.details[1].version, "20240102000000");

    assert!(relation_exists(shift.client(), &schema, "a").await);
    assert!(!relation_exists(shift.client(), &schema, "b").await);
    assert!(!relation_exists(shift.client(), &schema, "c").await);

    let status = shift.status().await.unwrap();
    assert_eq!(status.count(MigrationState::Applied), 1);
    assert_eq!(status.count(MigrationState::Pending), 2);

    let migrations = scan_migrations(dir.path()).unwrap();
    let err = Executor::new(shift.client(), &shift.config)
        .rollback(&migrations[2], false)
        .await
        .unwrap_err();
    assert!(matches!(err, PgshiftError::NotApplied { .. }));

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_manual_review_migration_is_refused() {
    let (client, schema) = setup_schema("manual").await;
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[(
            "20240101000000_convert.up.sql",
            "-- pgshift:manual-review\n-- ALTER TABLE t ALTER COLUMN c TYPE integer USING ...;\nSELECT 1;",
        )],
    );
    let shift = Pgshift::with_client(test_config(&schema, dir.path()), client);

    let err = shift.migrate(None, false).await.unwrap_err();
    assert!(matches!(err, PgshiftError::ManualReviewRequired { .. }));

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_non_transactional_statement_is_refused() {
    let (client, schema) = setup_schema("concurrently").await;
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[(
            "20240101000000_index.up.sql",
            "CREATE TABLE t (id int);\nCREATE INDEX CONCURRENTLY t_id_idx ON t (id);",
        )],
    );
    let shift = Pgshift::with_client(test_config(&schema, dir.path()), client);

    let err = shift.migrate(None, false).await.unwrap_err();
    assert!(matches!(
        err,
        PgshiftError::NonTransactionalStatement { .. }
    ));
    assert!(!relation_exists(shift.client(), &schema, "t").await);

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_advisory_lock_prevents_concurrent_access() {
    let (client, schema) = setup_schema("lock").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&schema, dir.path());
    let other = db::connect(&get_test_url()).await.unwrap();

    let first = Executor::new(&client, &config);
    let second = Executor::new(&other, &config);

    assert!(first.try_lock().await.unwrap());
    assert!(!second.try_lock().await.unwrap());

    let holders = db::advisory_lock_holders(&other, config.migrations.lock_key)
        .await
        .unwrap();
    assert_eq!(holders.len(), 1);

    // Only the holding session can release it.
    assert!(!second.unlock().await.unwrap());
    assert!(first.unlock().await.unwrap());
    assert!(second.try_lock().await.unwrap());
    assert!(second.unlock().await.unwrap());

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_lock_timeout_expires() {
    let (client, schema) = setup_schema("locktimeout").await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&schema, dir.path());
    config.migrations.lock_timeout_secs = 1;
    let other = db::connect(&get_test_url()).await.unwrap();

    let holder = Executor::new(&client, &config);
    assert!(holder.try_lock().await.unwrap());

    let err = Executor::new(&other, &config).lock().await.unwrap_err();
    assert!(matches!(err, PgshiftError::LockError(_)));

    holder.unlock().await.unwrap();
    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_unlock_reports_and_terminates_holder() {
    let (client, schema) = setup_schema("unlock").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&schema, dir.path());
    let lock_key = config.migrations.lock_key;
    let shift = Pgshift::with_client(config, client);

    let holder = db::connect(&get_test_url()).await.unwrap();
    let holder_pid: i32 = holder
        .query_one("SELECT pg_backend_pid()", &[])
        .await
        .unwrap()
        .get(0);
    assert!(db::try_advisory_lock(&holder, lock_key).await.unwrap());

    let report = shift.unlock(false).await.unwrap();
    assert_eq!(report.holders, vec![holder_pid]);
    assert!(report.terminated.is_empty());
    assert!(report.still_held);

    let report = shift.unlock(true).await.unwrap();
    assert_eq!(report.terminated, vec![holder_pid]);
    assert!(!report.still_held);
    assert!(db::advisory_lock_holders(shift.client(), lock_key)
        .await
        .unwrap()
        .is_empty());

    let report = shift.unlock(false).await.unwrap();
    assert!(report.holders.is_empty());
    assert!(!report.still_held);

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_single_apply_and_rollback_wait_for_the_lock() {
    let (client, schema) = setup_schema("applylock").await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&schema, dir.path());
    config.migrations.lock_timeout_secs = 1;
    let other = db::connect(&get_test_url()).await.unwrap();

    let holder = Executor::new(&client, &config);
    let runner = Executor::new(&other, &config);
    let migration = Migration::new(
        "20240101000000",
        "guarded",
        "CREATE TABLE guarded (id int);",
        Some("DROP TABLE guarded;".to_string()),
    );

    assert!(holder.try_lock().await.unwrap());
    let err = runner.apply(&migration, false).await.unwrap_err();
    assert!(matches!(err, PgshiftError::LockError(_)));
    assert!(!relation_exists(&client, &schema, "guarded").await);
    assert!(!relation_exists(&client, &schema, "pgshift_migrations").await);

    // The lock is taken before the applied state is read.
    let err = runner.rollback(&migration, false).await.unwrap_err();
    assert!(matches!(err, PgshiftError::LockError(_)));
    holder.unlock().await.unwrap();

    runner.apply(&migration, false).await.unwrap();
    assert!(relation_exists(&client, &schema, "guarded").await);
    // apply released its lock.
    assert!(holder.try_lock().await.unwrap());
    holder.unlock().await.unwrap();

    runner.rollback(&migration, false).await.unwrap();
    assert!(!relation_exists(&client, &schema, "guarded").await);

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_introspect_reads_catalog() {
    let (client, schema) = setup_schema("introspect").await;
    client
        .batch_execute(&format!(
            r#"
SET search_path TO {schema};
CREATE TYPE mood AS ENUM ('sad', 'ok', 'happy');
CREATE TABLE people (
    id bigserial PRIMARY KEY,
    handle varchar(40) NOT NULL,
    feeling mood,
    tags text[] DEFAULT '{{}}',
    aliases varchar(20)[],
    history mood[],
    seen_at timestamptz(3),
    score integer CHECK (score >= 0),
    CONSTRAINT people_handle_key UNIQUE (handle)
);
CREATE TABLE posts (
    id integer GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    person_id bigint NOT NULL REFERENCES people (id) ON DELETE CASCADE,
    body text
);
CREATE INDEX posts_recent_idx ON posts (person_id, id DESC) WHERE body IS NOT NULL;
CREATE INDEX posts_lower_body_idx ON posts (lower(body));
RESET search_path;
"#,
            schema = quote_ident(&schema)
        ))
        .await
        .unwrap();

    let model = introspect::introspect(&client, &schema, "pgshift_migrations")
        .await
        .unwrap();

    let people = model.table("people").unwrap();
    let id = people.column("id").unwrap();
    assert!(id.auto_increment);
    assert!(!id.nullable);
    assert_eq!(people.column("handle").unwrap().data_type, "varchar(40)");
    let normalized = |name: &str| {
        pgshift_core::normalize::normalize_type(&people.column(name).unwrap().data_type)
    };
    assert_eq!(normalized("aliases"), "varchar(20)[]");
    assert_eq!(normalized("history"), "mood[]");
    assert_eq!(normalized("seen_at"), "timestamptz(3)");
    assert_eq!(normalized("tags"), "text[]");
    assert_eq!(
        people.column("feeling").unwrap().enum_type.as_deref(),
        Some("mood")
    );
    assert_eq!(people.primary_key.as_ref().unwrap().columns, vec!["id"]);
    // The unique constraint's backing index is not reported as an index.
    assert!(people.indexes.is_empty());
    assert!(people
        .constraints
        .iter()
        .any(|c| c.name == "people_handle_key"));
    assert!(people
        .constraints
        .iter()
        .any(|c| c.name == "people_score_check"));

    let posts = model.table("posts").unwrap();
    assert!(posts.column("id").unwrap().identity.is_some());
    let fk = &posts.foreign_keys[0];
    assert_eq!(fk.referenced_table, "people");
    assert_eq!(fk.columns, vec!["person_id"]);

    let recent = posts
        .indexes
        .iter()
        .find(|i| i.name == "posts_recent_idx")
        .unwrap();
    assert!(!recent.unparsed);
    assert_eq!(
        recent.target,
        IndexTarget::Columns(vec!["person_id".to_string(), "id".to_string()])
    );
    assert!(recent.predicate.is_some());

    let lower = posts
        .indexes
        .iter()
        .find(|i| i.name == "posts_lower_body_idx")
        .unwrap();
    assert!(matches!(lower.target, IndexTarget::Expression(_)));

    assert!(model.enum_types().contains_key("mood"));

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_generate_migrate_then_no_diff() {
    let (client, schema) = setup_schema("roundtrip").await;
    let dir = tempfile::tempdir().unwrap();
    let declared = dir.path().join("schema.json");
    std::fs::write(&declared, ORDERS_DECLARED).unwrap();
    let migrations_dir = dir.path().join("migrations");
    let shift = Pgshift::with_client(test_config(&schema, &migrations_dir), client);

    let generated = shift.generate(&declared, "create orders").await.unwrap();
    assert!(generated.has_changes);
    assert!(!generated.manual_review);

    let applied = shift.migrate(None, false).await.unwrap();
    assert_eq!(applied.migrations_applied, 1);

    let diff = shift.diff(&declared).await.unwrap();
    assert!(
        !diff.has_changes,
        "unexpected differences after migrate:\n{}",
        diff.diff
    );

    // The offline replay agrees with the live database.
    let offline = Pgshift::diff_offline(&shift.config, &declared).await.unwrap();
    assert!(!offline.has_changes, "offline diff:\n{}", offline.diff);

    // Down SQL removes everything it created.
    let report = shift.rollback("0", false).await.unwrap();
    assert_eq!(report.migrations_rolled_back, 1);
    assert!(!relation_exists(shift.client(), &schema, "orders").await);
    assert!(!relation_exists(shift.client(), &schema, "account").await);

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_idempotent_up_sql_can_run_twice() {
    let (client, schema) = setup_schema("idempotent").await;
    let dir = tempfile::tempdir().unwrap();
    let declared = dir.path().join("schema.json");
    std::fs::write(&declared, ORDERS_DECLARED).unwrap();
    let shift = Pgshift::with_client(test_config(&schema, &dir.path().join("m")), client);

    let report = shift.diff(&declared).await.unwrap();
    let script = format!(
        "SET search_path TO {};\n{}\n{}",
        quote_ident(&schema),
        report.up_sql,
        report.up_sql
    );
    shift.client().batch_execute(&script).await.unwrap();
    shift
        .client()
        .batch_execute("RESET search_path")
        .await
        .unwrap();

    assert!(relation_exists(shift.client(), &schema, "orders").await);

    teardown_schema(shift.client(), &schema).await;
}

#[tokio::test]
async fn test_validate_reports_missing_file() {
    let (client, schema) = setup_schema("validate").await;
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[("20240101000000_only.up.sql", "CREATE TABLE only_one (id int);")],
    );
    let shift = Pgshift::with_client(test_config(&schema, dir.path()), client);
    shift.migrate(None, false).await.unwrap();

    let report = shift.validate().await.unwrap();
    assert!(report.valid);

    std::fs::remove_file(dir.path().join("20240101000000_only.up.sql")).unwrap();
    let status = shift.status().await.unwrap();
    assert_eq!(status.count(MigrationState::Missing), 1);
    let err = shift.validate().await.unwrap_err();
    assert!(matches!(err, PgshiftError::ValidationFailed(_)));

    teardown_schema(shift.client(), &schema).await;
}
