use std::str::FromStr;

use anyhow::Context;
use docksmith_client::entities::{
  docksmith_timestamp,
  update::{
    BatchDetail, OperationParams, OperationStatus, OperationType,
    UpdateOperation,
  },
};
use sqlx::{Row, sqlite::SqliteRow};
use tokio_util::sync::CancellationToken;

use crate::{DbClient, with_busy_retry};

/// Filters for listing recent operations.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
  pub limit: Option<i64>,
  pub status: Option<OperationStatus>,
  pub container: Option<String>,
}

const DEFAULT_LIST_LIMIT: i64 = 100;

impl DbClient {
  /// Upsert by `operation_id`. The original `created_at` is kept on
  /// upsert; `updated_at` always moves. Returns the row id.
  pub async fn save_update_operation(
    &self,
    op: &UpdateOperation,
    cancel: Option<&CancellationToken>,
  ) -> anyhow::Result<i64> {
    let dependents = serde_json::to_string(&op.dependents_affected)
      .context("Failed to serialize dependents_affected")?;
    let details = serde_json::to_string(&op.batch_details)
      .context("Failed to serialize batch_details")?;
    let params = serde_json::to_string(&op.params)
      .context("Failed to serialize params")?;
    let now = docksmith_timestamp();
    let created_at =
      if op.created_at == 0 { now } else { op.created_at };

    with_busy_retry(cancel, || {
      sqlx::query(
        "INSERT INTO update_operations (
          operation_id, batch_group_id, container_id,
          container_name, stack_name, operation_type, status,
          old_version, new_version, error_message,
          dependents_affected, rollback_occurred, batch_details,
          target_operation_id, params,
          started_at, completed_at, created_at, updated_at
        ) VALUES (
          ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
        )
        ON CONFLICT (operation_id) DO UPDATE SET
          batch_group_id = excluded.batch_group_id,
          container_id = excluded.container_id,
          container_name = excluded.container_name,
          stack_name = excluded.stack_name,
          operation_type = excluded.operation_type,
          status = excluded.status,
          old_version = excluded.old_version,
          new_version = excluded.new_version,
          error_message = excluded.error_message,
          dependents_affected = excluded.dependents_affected,
          rollback_occurred = excluded.rollback_occurred,
          batch_details = excluded.batch_details,
          target_operation_id = excluded.target_operation_id,
          params = excluded.params,
          started_at = excluded.started_at,
          completed_at = excluded.completed_at,
          updated_at = excluded.updated_at",
      )
      .bind(&op.operation_id)
      .bind(&op.batch_group_id)
      .bind(&op.container_id)
      .bind(&op.container_name)
      .bind(&op.stack_name)
      .bind(op.operation_type.to_string())
      .bind(op.status.to_string())
      .bind(&op.old_version)
      .bind(&op.new_version)
      .bind(&op.error_message)
      .bind(&dependents)
      .bind(op.rollback_occurred)
      .bind(&details)
      .bind(&op.target_operation_id)
      .bind(&params)
      .bind(op.started_at)
      .bind(op.completed_at)
      .bind(created_at)
      .bind(now)
      .execute(&self.write)
    })
    .await
    .context("Failed to save update operation")?;

    let row = sqlx::query(
      "SELECT id FROM update_operations WHERE operation_id = ?",
    )
    .bind(&op.operation_id)
    .fetch_one(&self.read)
    .await
    .context("Failed to read back operation row id")?;
    row.try_get("id").context("No id on operation row")
  }

  pub async fn get_update_operation(
    &self,
    operation_id: &str,
  ) -> anyhow::Result<Option<UpdateOperation>> {
    let row = sqlx::query(
      "SELECT * FROM update_operations WHERE operation_id = ?",
    )
    .bind(operation_id)
    .fetch_optional(&self.read)
    .await
    .context("Failed to query update operation")?;
    row.map(|row| row_to_operation(&row)).transpose()
  }

  pub async fn list_update_operations(
    &self,
    filter: &OperationFilter,
  ) -> anyhow::Result<Vec<UpdateOperation>> {
    let mut sql =
      String::from("SELECT * FROM update_operations WHERE 1 = 1");
    if filter.status.is_some() {
      sql.push_str(" AND status = ?");
    }
    if filter.container.is_some() {
      sql.push_str(" AND container_name = ?");
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(status) = filter.status {
      query = query.bind(status.to_string());
    }
    if let Some(container) = &filter.container {
      query = query.bind(container);
    }
    query = query.bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT));

    let rows = query
      .fetch_all(&self.read)
      .await
      .context("Failed to list update operations")?;
    rows.iter().map(row_to_operation).collect()
  }

  pub async fn get_update_operations_by_batch_group(
    &self,
    batch_group_id: &str,
  ) -> anyhow::Result<Vec<UpdateOperation>> {
    let rows = sqlx::query(
      "SELECT * FROM update_operations
       WHERE batch_group_id = ? ORDER BY id ASC",
    )
    .bind(batch_group_id)
    .fetch_all(&self.read)
    .await
    .context("Failed to query batch group")?;
    rows.iter().map(row_to_operation).collect()
  }

  /// Startup sweep: anything a previous process left in a
  /// non-terminal state becomes `failed`. Returns how many rows
  /// were swept.
  pub async fn fail_non_terminal_operations(
    &self,
    reason: &str,
  ) -> anyhow::Result<u64> {
    let now = docksmith_timestamp();
    let result = with_busy_retry(None, || {
      sqlx::query(
        "UPDATE update_operations
         SET status = 'failed', error_message = ?,
             completed_at = ?, updated_at = ?
         WHERE status NOT IN ('complete', 'failed')",
      )
      .bind(reason)
      .bind(now)
      .bind(now)
      .execute(&self.write)
    })
    .await
    .context("Failed to sweep non-terminal operations")?;
    Ok(result.rows_affected())
  }
}

fn row_to_operation(
  row: &SqliteRow,
) -> anyhow::Result<UpdateOperation> {
  let operation_type: String = row.try_get("operation_type")?;
  let status: String = row.try_get("status")?;
  let dependents: String = row.try_get("dependents_affected")?;
  let details: String = row.try_get("batch_details")?;
  let params: String = row.try_get("params")?;
  Ok(UpdateOperation {
    id: row.try_get("id")?,
    operation_id: row.try_get("operation_id")?,
    batch_group_id: row.try_get("batch_group_id")?,
    container_id: row.try_get("container_id")?,
    container_name: row.try_get("container_name")?,
    stack_name: row.try_get("stack_name")?,
    operation_type: OperationType::from_str(&operation_type)
      .with_context(|| {
        format!("Unknown operation type: {operation_type}")
      })?,
    status: OperationStatus::from_str(&status)
      .with_context(|| format!("Unknown status: {status}"))?,
    old_version: row.try_get("old_version")?,
    new_version: row.try_get("new_version")?,
    error_message: row.try_get("error_message")?,
    dependents_affected: serde_json::from_str(&dependents)
      .context("Corrupt dependents_affected json")?,
    rollback_occurred: row.try_get("rollback_occurred")?,
    batch_details: serde_json::from_str::<Vec<BatchDetail>>(&details)
      .context("Corrupt batch_details json")?,
    target_operation_id: row.try_get("target_operation_id")?,
    params: serde_json::from_str::<OperationParams>(&params)
      .context("Corrupt params json")?,
    started_at: row.try_get("started_at")?,
    completed_at: row.try_get("completed_at")?,
    created_at: row.try_get("created_at")?,
    updated_at: row.try_get("updated_at")?,
  })
}
