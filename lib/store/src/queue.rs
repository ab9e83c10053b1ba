use anyhow::Context;
use docksmith_client::entities::update::QueuedUpdate;
use sqlx::{Row, sqlite::SqliteRow};
use tokio_util::sync::CancellationToken;

use crate::{DbClient, with_busy_retry};

impl DbClient {
  /// Park an operation in the persistent queue. The operation id is
  /// the primary key, so re-queueing the same operation is an error.
  pub async fn queue_update(
    &self,
    queued: &QueuedUpdate,
    cancel: Option<&CancellationToken>,
  ) -> anyhow::Result<()> {
    let containers = serde_json::to_string(&queued.containers)
      .context("Failed to serialize container list")?;
    with_busy_retry(cancel, || {
      sqlx::query(
        "INSERT INTO update_queue (
          operation_id, stack_name, containers, priority,
          queued_at, estimated_start_time
        ) VALUES (?, ?, ?, ?, ?, ?)",
      )
      .bind(&queued.operation_id)
      .bind(&queued.stack_name)
      .bind(&containers)
      .bind(queued.priority)
      .bind(queued.queued_at)
      .bind(queued.estimated_start_time)
      .execute(&self.write)
    })
    .await
    .context("Failed to queue update")?;
    Ok(())
  }

  /// Atomically pop the next row for a stack: highest priority
  /// first, then oldest. The select and delete commit together; a
  /// failed commit leaves the operation queued.
  pub async fn dequeue_update(
    &self,
    stack_name: &str,
  ) -> anyhow::Result<Option<QueuedUpdate>> {
    let mut tx = self
      .write
      .begin()
      .await
      .context("Failed to open dequeue transaction")?;

    let row = sqlx::query(
      "SELECT * FROM update_queue WHERE stack_name = ?
       ORDER BY priority DESC, queued_at ASC LIMIT 1",
    )
    .bind(stack_name)
    .fetch_optional(&mut *tx)
    .await
    .context("Failed to select next queued update")?;

    let Some(row) = row else {
      return Ok(None);
    };
    let queued = row_to_queued(&row)?;

    sqlx::query("DELETE FROM update_queue WHERE operation_id = ?")
      .bind(&queued.operation_id)
      .execute(&mut *tx)
      .await
      .context("Failed to delete dequeued row")?;

    tx.commit().await.context("Failed to commit dequeue")?;
    Ok(Some(queued))
  }

  pub async fn get_queued_updates(
    &self,
  ) -> anyhow::Result<Vec<QueuedUpdate>> {
    let rows = sqlx::query(
      "SELECT * FROM update_queue
       ORDER BY priority DESC, queued_at ASC",
    )
    .fetch_all(&self.read)
    .await
    .context("Failed to list queued updates")?;
    rows.iter().map(row_to_queued).collect()
  }

  /// Stacks that currently have queued work, for startup resume.
  pub async fn queued_stacks(&self) -> anyhow::Result<Vec<String>> {
    let rows = sqlx::query(
      "SELECT DISTINCT stack_name FROM update_queue",
    )
    .fetch_all(&self.read)
    .await
    .context("Failed to list queued stacks")?;
    rows
      .iter()
      .map(|row| {
        row
          .try_get::<String, _>("stack_name")
          .context("No stack_name on row")
      })
      .collect()
  }

  pub async fn remove_queued_update(
    &self,
    operation_id: &str,
  ) -> anyhow::Result<bool> {
    let result = with_busy_retry(None, || {
      sqlx::query(
        "DELETE FROM update_queue WHERE operation_id = ?",
      )
      .bind(operation_id)
      .execute(&self.write)
    })
    .await
    .context("Failed to remove queued update")?;
    Ok(result.rows_affected() > 0)
  }
}

fn row_to_queued(row: &SqliteRow) -> anyhow::Result<QueuedUpdate> {
  let containers: String = row.try_get("containers")?;
  Ok(QueuedUpdate {
    operation_id: row.try_get("operation_id")?,
    stack_name: row.try_get("stack_name")?,
    containers: serde_json::from_str(&containers)
      .context("Corrupt containers json")?,
    priority: row.try_get("priority")?,
    queued_at: row.try_get("queued_at")?,
    estimated_start_time: row.try_get("estimated_start_time")?,
  })
}
