//! Inspect, and optionally clear, the migration advisory lock.
//!
//! Advisory locks belong to the session that took them, so this command
//! cannot release another run's lock directly. It reports the holding
//! backends from `pg_locks`; with `terminate` it ends those backends, which
//! frees their session locks.

use std::time::Duration;

use serde::Serialize;
use tokio_postgres::Client;

use crate::config::PgshiftConfig;
use crate::db;
use crate::error::Result;

const TERMINATE_POLL_ATTEMPTS: u32 = 10;

#[derive(Debug, Serialize)]
pub struct UnlockReport {
    pub lock_key: i64,
    /// Backends holding the key when the command started.
    pub holders: Vec<i32>,
    /// Holders whose backend was terminated.
    pub terminated: Vec<i32>,
    /// Whether the key is still held when the command finishes.
    pub still_held: bool,
}

pub async fn execute(client: &Client, config: &PgshiftConfig, terminate: bool) -> Result<UnlockReport> {
    let lock_key = config.migrations.lock_key;
    let holders = db::advisory_lock_holders(client, lock_key).await?;

    let mut terminated = Vec::new();
    if terminate {
        for &pid in &holders {
            if db::terminate_backend(client, pid).await? {
                log::warn!("Terminated lock holder; lock_key={}, pid={}", lock_key, pid);
                terminated.push(pid);
            }
        }
    }

    let still_held = if terminated.is_empty() {
        !holders.is_empty()
    } else {
        wait_until_free(client, lock_key).await?
    };

    if holders.is_empty() {
        log::info!("Advisory lock is not held; lock_key={}", lock_key);
    } else if still_held {
        log::warn!(
            "Advisory lock is held by another session; lock_key={}, pids={:?}",
            lock_key,
            holders
        );
    }

    Ok(UnlockReport {
        lock_key,
        holders,
        terminated,
        still_held,
    })
}

/// Terminated backends drop their locks as they exit. Returns whether the key
/// is still held after polling.
async fn wait_until_free(client: &Client, lock_key: i64) -> Result<bool> {
    for _ in 0..TERMINATE_POLL_ATTEMPTS {
        if db::advisory_lock_holders(client, lock_key).await?.is_empty() {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(!db::advisory_lock_holders(client, lock_key).await?.is_empty())
}
