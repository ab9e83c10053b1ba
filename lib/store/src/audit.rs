use std::str::FromStr;

use anyhow::Context;
use docksmith_client::entities::{
  container::ContainerStatus,
  docksmith_timestamp,
  update::{CheckHistoryEntry, UpdateLogEntry, UpdateLogOperation},
};
use sqlx::{Row, sqlite::SqliteRow};

use crate::{DbClient, with_busy_retry};

impl DbClient {
  /// Append one audit row. The operation kind is validated here:
  /// only `pull`, `restart` and `rollback` are accepted. Accepted
  /// rows are never modified afterwards.
  pub async fn log_update(
    &self,
    container_name: &str,
    operation: &str,
    from_version: &str,
    to_version: &str,
    success: bool,
    error: Option<&str>,
  ) -> anyhow::Result<i64> {
    let operation = UpdateLogOperation::from_str(operation)
      .map_err(|_| {
        anyhow::anyhow!(
          "Invalid update log operation: {operation}. \
           Must be one of: pull, restart, rollback"
        )
      })?;
    let now = docksmith_timestamp();
    let result = with_busy_retry(None, || {
      sqlx::query(
        "INSERT INTO update_log (
          container_name, operation, from_version, to_version,
          timestamp, success, error
        ) VALUES (?, ?, ?, ?, ?, ?, ?)",
      )
      .bind(container_name)
      .bind(operation.to_string())
      .bind(from_version)
      .bind(to_version)
      .bind(now)
      .bind(success)
      .bind(error)
      .execute(&self.write)
    })
    .await
    .context("Failed to append update log")?;
    Ok(result.last_insert_rowid())
  }

  pub async fn list_update_log(
    &self,
    container: Option<&str>,
    limit: i64,
  ) -> anyhow::Result<Vec<UpdateLogEntry>> {
    let rows = match container {
      Some(container) => {
        sqlx::query(
          "SELECT * FROM update_log WHERE container_name = ?
           ORDER BY id DESC LIMIT ?",
        )
        .bind(container)
        .bind(limit)
        .fetch_all(&self.read)
        .await
      }
      None => {
        sqlx::query(
          "SELECT * FROM update_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.read)
        .await
      }
    }
    .context("Failed to list update log")?;
    rows.iter().map(row_to_log_entry).collect()
  }

  /// Write a whole check cycle's history in one transaction.
  /// All rows commit or none do.
  pub async fn log_check_batch(
    &self,
    entries: &[CheckHistoryEntry],
  ) -> anyhow::Result<()> {
    if entries.is_empty() {
      return Ok(());
    }
    let mut tx = self
      .write
      .begin()
      .await
      .context("Failed to open check history transaction")?;
    for entry in entries {
      sqlx::query(
        "INSERT INTO check_history (
          container_name, image, check_time, current_version,
          latest_version, status, error
        ) VALUES (?, ?, ?, ?, ?, ?, ?)",
      )
      .bind(&entry.container_name)
      .bind(&entry.image)
      .bind(entry.check_time)
      .bind(&entry.current_version)
      .bind(&entry.latest_version)
      .bind(status_str(entry.status))
      .bind(&entry.error)
      .execute(&mut *tx)
      .await
      .with_context(|| {
        format!(
          "Failed to insert check history for {}",
          entry.container_name
        )
      })?;
    }
    tx.commit()
      .await
      .context("Failed to commit check history batch")?;
    Ok(())
  }

  pub async fn list_check_history(
    &self,
    container: Option<&str>,
    limit: i64,
  ) -> anyhow::Result<Vec<CheckHistoryEntry>> {
    let rows = match container {
      Some(container) => {
        sqlx::query(
          "SELECT * FROM check_history WHERE container_name = ?
           ORDER BY id DESC LIMIT ?",
        )
        .bind(container)
        .bind(limit)
        .fetch_all(&self.read)
        .await
      }
      None => {
        sqlx::query(
          "SELECT * FROM check_history ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.read)
        .await
      }
    }
    .context("Failed to list check history")?;
    rows.iter().map(row_to_check_entry).collect()
  }

  /// Trim check history to the newest `keep` rows per run.
  pub async fn prune_check_history(
    &self,
    keep: i64,
  ) -> anyhow::Result<u64> {
    let result = with_busy_retry(None, || {
      sqlx::query(
        "DELETE FROM check_history WHERE id NOT IN (
          SELECT id FROM check_history ORDER BY id DESC LIMIT ?
        )",
      )
      .bind(keep)
      .execute(&self.write)
    })
    .await
    .context("Failed to prune check history")?;
    Ok(result.rows_affected())
  }
}

fn status_str(status: ContainerStatus) -> String {
  status.to_string()
}

fn row_to_log_entry(
  row: &SqliteRow,
) -> anyhow::Result<UpdateLogEntry> {
  let operation: String = row.try_get("operation")?;
  Ok(UpdateLogEntry {
    id: row.try_get("id")?,
    container_name: row.try_get("container_name")?,
    operation: UpdateLogOperation::from_str(&operation)
      .with_context(|| {
        format!("Unknown update log operation: {operation}")
      })?,
    from_version: row.try_get("from_version")?,
    to_version: row.try_get("to_version")?,
    timestamp: row.try_get("timestamp")?,
    success: row.try_get("success")?,
    error: row.try_get("error")?,
  })
}

fn row_to_check_entry(
  row: &SqliteRow,
) -> anyhow::Result<CheckHistoryEntry> {
  let status: String = row.try_get("status")?;
  Ok(CheckHistoryEntry {
    id: row.try_get("id")?,
    container_name: row.try_get("container_name")?,
    image: row.try_get("image")?,
    check_time: row.try_get("check_time")?,
    current_version: row.try_get("current_version")?,
    latest_version: row.try_get("latest_version")?,
    status: parse_status(&status)?,
    error: row.try_get("error")?,
  })
}

fn parse_status(status: &str) -> anyhow::Result<ContainerStatus> {
  ContainerStatus::from_str(status)
    .map_err(|_| anyhow::anyhow!("Unknown container status: {status}"))
}
