//! The persistence boundary: a single SQLite file in WAL mode,
//! written through one serialized connection, read concurrently.
//!
//! Every multi-row change runs inside one transaction. Transient
//! busy/locked errors are retried by [with_busy_retry].

#[macro_use]
extern crate tracing;

use std::{path::Path, time::Duration};

use anyhow::Context;
use sqlx::{
  SqlitePool,
  sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
  },
};
use tokio_util::sync::CancellationToken;

mod audit;
mod cache;
mod config;
pub mod operations;
mod policies;
mod queue;

pub use sqlx;

const READ_POOL_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_BASE: Duration = Duration::from_millis(10);
const RETRY_CAP: Duration = Duration::from_secs(1);
const RETRY_ATTEMPTS: u32 = 5;

/// Minimum effective version cache TTL. Configured values are
/// clamped up to this.
pub const MIN_CACHE_TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct DbClient {
  /// Single-connection pool. All mutations go through here, which
  /// serializes writers without holding a process-wide lock.
  write: SqlitePool,
  /// Concurrent readers. WAL keeps them from blocking the writer.
  read: SqlitePool,
  cache_ttl_ms: i64,
}

impl DbClient {
  pub async fn init(
    db_path: &Path,
    cache_ttl: Duration,
  ) -> anyhow::Result<DbClient> {
    if let Some(parent) = db_path.parent()
      && !parent.as_os_str().is_empty()
    {
      tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| {
          format!("Failed to create db directory {parent:?}")
        })?;
    }

    let options = SqliteConnectOptions::new()
      .filename(db_path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .synchronous(SqliteSynchronous::Normal)
      .busy_timeout(BUSY_TIMEOUT)
      .foreign_keys(true);

    let write = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options.clone())
      .await
      .context("Failed to open database for writing")?;

    sqlx::migrate!()
      .run(&write)
      .await
      .context("Failed to run database migrations")?;

    let read = SqlitePoolOptions::new()
      .max_connections(READ_POOL_CONNECTIONS)
      .connect_with(options)
      .await
      .context("Failed to open database for reading")?;

    let cache_ttl = cache_ttl.max(MIN_CACHE_TTL);

    Ok(DbClient {
      write,
      read,
      cache_ttl_ms: cache_ttl.as_millis() as i64,
    })
  }

  pub fn writer(&self) -> &SqlitePool {
    &self.write
  }

  pub fn reader(&self) -> &SqlitePool {
    &self.read
  }

  pub fn cache_ttl_ms(&self) -> i64 {
    self.cache_ttl_ms
  }
}

/// Whether an error is sqlite telling us to back off and try again.
pub fn is_busy(e: &sqlx::Error) -> bool {
  match e {
    sqlx::Error::Database(db) => {
      let message = db.message().to_lowercase();
      message.contains("locked") || message.contains("busy")
    }
    _ => false,
  }
}

/// Retry `run` on busy/locked errors with exponential backoff
/// (10ms base, 1s cap, 5 attempts). Cancellation breaks out of the
/// backoff sleep with the cancellation error.
pub async fn with_busy_retry<T, F, Fut>(
  cancel: Option<&CancellationToken>,
  mut run: F,
) -> anyhow::Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, sqlx::Error>>,
{
  let mut delay = RETRY_BASE;
  let mut attempt = 1;
  loop {
    match run().await {
      Ok(value) => return Ok(value),
      Err(e) if is_busy(&e) && attempt < RETRY_ATTEMPTS => {
        debug!(
          "database busy (attempt {attempt}/{RETRY_ATTEMPTS}), \
           retrying in {delay:?}"
        );
        match cancel {
          Some(cancel) => {
            tokio::select! {
              _ = cancel.cancelled() => {
                return Err(anyhow::anyhow!("cancelled"));
              }
              _ = tokio::time::sleep(delay) => {}
            }
          }
          None => tokio::time::sleep(delay).await,
        }
        delay = (delay * 2).min(RETRY_CAP);
        attempt += 1;
      }
      Err(e) => {
        return Err(e).context("database call failed");
      }
    }
  }
}
