//! Migration files on disk.
//!
//! Each migration is a pair `{version}_{name}.up.sql` / `{version}_{name}.down.sql`
//! where `version` is a sortable `YYYYMMDDHHmmss` UTC timestamp. The down
//! file is optional when scanning.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PgshiftError, Result};
use crate::plan::MigrationPlan;

const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{14})_([A-Za-z0-9][A-Za-z0-9_\-]*)\.(up|down)\.sql$").unwrap()
});

/// Bookkeeping status of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = PgshiftError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MigrationStatus::Pending),
            "applied" => Ok(MigrationStatus::Applied),
            "failed" => Ok(MigrationStatus::Failed),
            other => Err(PgshiftError::MigrationParseError(format!(
                "unknown migration status '{}'",
                other
            ))),
        }
    }
}

/// Which half of a migration pair a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// A migration loaded from disk (or built in memory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub up_sql: String,
    pub down_sql: Option<String>,
    pub up_path: Option<PathBuf>,
    pub down_path: Option<PathBuf>,
}

impl Migration {
    pub fn new(
        version: impl Into<String>,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: Option<String>,
    ) -> Self {
        Migration {
            version: version.into(),
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql,
            up_path: None,
            down_path: None,
        }
    }

    /// `{version}_{name}`
    pub fn stem(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }
}

/// Split a migration filename into version, name and direction.
pub fn parse_filename(filename: &str) -> Result<(String, String, Direction)> {
    let caps = FILENAME_RE.captures(filename).ok_or_else(|| {
        PgshiftError::MigrationParseError(format!(
            "'{}' does not match {{version}}_{{name}}.up.sql / .down.sql",
            filename
        ))
    })?;
    let version = caps[1].to_string();
    NaiveDateTime::parse_from_str(&version, VERSION_FORMAT).map_err(|_| {
        PgshiftError::MigrationParseError(format!(
            "'{}' has an invalid version timestamp '{}'",
            filename, version
        ))
    })?;
    let direction = if &caps[3] == "up" {
        Direction::Up
    } else {
        Direction::Down
    };
    Ok((version, caps[2].to_string(), direction))
}

#[derive(Default)]
struct Pair {
    name: String,
    up: Option<(PathBuf, String)>,
    down: Option<(PathBuf, String)>,
}

/// Load every migration in `dir`, sorted by version.
///
/// A missing directory yields an empty list. Non-`.sql` files are ignored;
/// a `.sql` file with a malformed name, two files claiming the same version,
/// or a down file without its up file is an error.
pub fn scan_migrations(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        log::debug!("Migration directory does not exist; path={}", dir.display());
        return Ok(Vec::new());
    }

    let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !path.extension().is_some_and(|e| e == "sql") {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        let (version, name, direction) = parse_filename(&filename)?;

        let pair = pairs.entry(version.clone()).or_default();
        if pair.name.is_empty() {
            pair.name = name.clone();
        } else if pair.name != name {
            return Err(PgshiftError::MigrationParseError(format!(
                "duplicate version {}: '{}' and '{}'",
                version, pair.name, name
            )));
        }

        let slot = match direction {
            Direction::Up => &mut pair.up,
            Direction::Down => &mut pair.down,
        };
        if slot.is_some() {
            return Err(PgshiftError::MigrationParseError(format!(
                "duplicate migration file for version {}: {}",
                version, filename
            )));
        }
        let sql = std::fs::read_to_string(&path)?;
        *slot = Some((path, sql));
    }

    let mut migrations = Vec::with_capacity(pairs.len());
    for (version, pair) in pairs {
        let (up_path, up_sql) = pair.up.ok_or_else(|| {
            PgshiftError::MigrationParseError(format!(
                "migration {}_{} has a down file but no up file",
                version, pair.name
            ))
        })?;
        let (down_path, down_sql) = match pair.down {
            Some((p, s)) => (Some(p), Some(s)),
            None => (None, None),
        };
        migrations.push(Migration {
            version,
            name: pair.name,
            up_sql,
            down_sql,
            up_path: Some(up_path),
            down_path,
        });
    }

    log::debug!(
        "Scanned migrations; path={}, count={}",
        dir.display(),
        migrations.len()
    );
    Ok(migrations)
}

/// A version derived from `now`, moved forward one second at a time
/// until it does not collide with `taken`.
pub fn next_version(now: DateTime<Utc>, taken: &BTreeSet<String>) -> String {
    let mut at = now;
    loop {
        let version = at.format(VERSION_FORMAT).to_string();
        if !taken.contains(&version) {
            return version;
        }
        at += Duration::seconds(1);
    }
}

/// Turn a free-form description into a filename-safe name.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() {
        "migration".to_string()
    } else {
        out
    }
}

/// Write a migration pair for `plan` into `dir` and return it.
pub fn write_migration(dir: &Path, name: &str, plan: &MigrationPlan) -> Result<Migration> {
    std::fs::create_dir_all(dir)?;
    let taken: BTreeSet<String> = scan_migrations(dir)?
        .into_iter()
        .map(|m| m.version)
        .collect();

    let version = next_version(Utc::now(), &taken);
    let name = sanitize_name(name);
    let up_sql = plan.up_sql();
    let down_sql = plan.down_sql();

    let up_path = dir.join(format!("{}_{}.up.sql", version, name));
    let down_path = dir.join(format!("{}_{}.down.sql", version, name));
    std::fs::write(&up_path, &up_sql)?;
    std::fs::write(&down_path, &down_sql)?;

    log::info!(
        "Wrote migration; version={}, name={}, up_statements={}, down_statements={}",
        version,
        name,
        plan.up.len(),
        plan.down.len()
    );

    Ok(Migration {
        version,
        name,
        up_sql,
        down_sql: Some(down_sql),
        up_path: Some(up_path),
        down_path: Some(down_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_filename() {
        let (version, name, direction) =
            parse_filename("20240115093000_add_orders.up.sql").unwrap();
        assert_eq!(version, "20240115093000");
        assert_eq!(name, "add_orders");
        assert_eq!(direction, Direction::Up);

        let (_, _, direction) = parse_filename("20240115093000_add_orders.down.sql").unwrap();
        assert_eq!(direction, Direction::Down);
    }

    #[test]
    fn test_parse_filename_rejects_malformed() {
        assert!(parse_filename("V1__init.sql").is_err());
        assert!(parse_filename("2024011509300_short.up.sql").is_err());
        assert!(parse_filename("20241345093000_bad_month.up.sql").is_err());
        assert!(parse_filename("20240115093000_x.sideways.sql").is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            MigrationStatus::Pending,
            MigrationStatus::Applied,
            MigrationStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<MigrationStatus>().unwrap(), s);
        }
        assert!("done".parse::<MigrationStatus>().is_err());
    }

    #[test]
    fn test_scan_sorted_and_paired() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240102000000_second.up.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("20240101000000_first.up.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("20240101000000_first.down.sql"), "SELECT -1;").unwrap();
        std::fs::write(dir.path().join("README.md"), "notes").unwrap();

        let migrations = scan_migrations(dir.path()).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, "20240101000000");
        assert_eq!(migrations[0].down_sql.as_deref(), Some("SELECT -1;"));
        assert_eq!(migrations[1].name, "second");
        assert!(migrations[1].down_sql.is_none());
    }

    #[test]
    fn test_scan_rejects_duplicate_versions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240101000000_a.up.sql"), "").unwrap();
        std::fs::write(dir.path().join("20240101000000_b.up.sql"), "").unwrap();
        assert!(scan_migrations(dir.path()).is_err());
    }

    #[test]
    fn test_scan_rejects_orphan_down() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240101000000_a.down.sql"), "").unwrap();
        assert!(scan_migrations(dir.path()).is_err());
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_migrations(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_next_version_bumps_on_collision() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        let mut taken = BTreeSet::new();
        assert_eq!(next_version(now, &taken), "20240115093000");
        taken.insert("20240115093000".to_string());
        taken.insert("20240115093001".to_string());
        assert_eq!(next_version(now, &taken), "20240115093002");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Add Orders table!"), "add_orders_table");
        assert_eq!(sanitize_name("  --  "), "migration");
        assert_eq!(sanitize_name("v2-users"), "v2_users");
    }

    #[test]
    fn test_write_migration_creates_pair() {
        let dir = tempfile::tempdir().unwrap();
        let plan = MigrationPlan {
            up: vec!["CREATE TABLE IF NOT EXISTS t (\n    id integer\n);".to_string()],
            down: vec!["DROP TABLE IF EXISTS \"t\";".to_string()],
        };
        let first = write_migration(dir.path(), "create t", &plan).unwrap();
        let second = write_migration(dir.path(), "create t", &plan).unwrap();
        assert_ne!(first.version, second.version);
        assert_eq!(first.name, "create_t");

        let scanned = scan_migrations(dir.path()).unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].up_sql, plan.up_sql());
        assert_eq!(scanned[0].down_sql.as_deref(), Some("DROP TABLE IF EXISTS \"t\";\n"));
    }
}
