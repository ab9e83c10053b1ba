use std::str::FromStr;

use anyhow::Context;
use docksmith_client::entities::{
  docksmith_timestamp,
  policy::{PolicyEntityType, RollbackPolicy, ScriptAssignment},
};
use sqlx::{Row, sqlite::SqliteRow};

use crate::{DbClient, with_busy_retry};

impl DbClient {
  /// Upsert by container name. `assigned_at` is preserved on
  /// update; `updated_at` always moves.
  pub async fn upsert_script_assignment(
    &self,
    assignment: &ScriptAssignment,
  ) -> anyhow::Result<()> {
    let now = docksmith_timestamp();
    let assigned_at = if assignment.assigned_at == 0 {
      now
    } else {
      assignment.assigned_at
    };
    with_busy_retry(None, || {
      sqlx::query(
        "INSERT INTO script_assignments (
          container_name, script_path, enabled, ignored,
          allow_latest, assigned_by, assigned_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (container_name) DO UPDATE SET
          script_path = excluded.script_path,
          enabled = excluded.enabled,
          ignored = excluded.ignored,
          allow_latest = excluded.allow_latest,
          assigned_by = excluded.assigned_by,
          updated_at = excluded.updated_at",
      )
      .bind(&assignment.container_name)
      .bind(&assignment.script_path)
      .bind(assignment.enabled)
      .bind(assignment.ignore)
      .bind(assignment.allow_latest)
      .bind(&assignment.assigned_by)
      .bind(assigned_at)
      .bind(now)
      .execute(&self.write)
    })
    .await
    .context("Failed to upsert script assignment")?;
    Ok(())
  }

  pub async fn get_script_assignment(
    &self,
    container_name: &str,
  ) -> anyhow::Result<Option<ScriptAssignment>> {
    let row = sqlx::query(
      "SELECT * FROM script_assignments WHERE container_name = ?",
    )
    .bind(container_name)
    .fetch_optional(&self.read)
    .await
    .context("Failed to query script assignment")?;
    row.map(|row| row_to_assignment(&row)).transpose()
  }

  pub async fn list_script_assignments(
    &self,
  ) -> anyhow::Result<Vec<ScriptAssignment>> {
    let rows = sqlx::query(
      "SELECT * FROM script_assignments ORDER BY container_name",
    )
    .fetch_all(&self.read)
    .await
    .context("Failed to list script assignments")?;
    rows.iter().map(row_to_assignment).collect()
  }

  pub async fn delete_script_assignment(
    &self,
    container_name: &str,
  ) -> anyhow::Result<bool> {
    let result = with_busy_retry(None, || {
      sqlx::query(
        "DELETE FROM script_assignments WHERE container_name = ?",
      )
      .bind(container_name)
      .execute(&self.write)
    })
    .await
    .context("Failed to delete script assignment")?;
    Ok(result.rows_affected() > 0)
  }

  /// Upsert a rollback policy. An empty `entity_id` is stored as
  /// NULL (the global policy).
  pub async fn set_rollback_policy(
    &self,
    policy: &RollbackPolicy,
  ) -> anyhow::Result<()> {
    let entity_id = policy
      .entity_id
      .as_deref()
      .filter(|id| !id.is_empty());
    let now = docksmith_timestamp();

    let mut tx = self
      .write
      .begin()
      .await
      .context("Failed to open rollback policy transaction")?;

    let updated = sqlx::query(
      "UPDATE rollback_policies
       SET auto_rollback_enabled = ?, health_check_required = ?,
           updated_at = ?
       WHERE entity_type = ? AND entity_id IS ?",
    )
    .bind(policy.auto_rollback_enabled)
    .bind(policy.health_check_required)
    .bind(now)
    .bind(policy.entity_type.to_string())
    .bind(entity_id)
    .execute(&mut *tx)
    .await
    .context("Failed to update rollback policy")?;

    if updated.rows_affected() == 0 {
      sqlx::query(
        "INSERT INTO rollback_policies (
          entity_type, entity_id, auto_rollback_enabled,
          health_check_required, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?)",
      )
      .bind(policy.entity_type.to_string())
      .bind(entity_id)
      .bind(policy.auto_rollback_enabled)
      .bind(policy.health_check_required)
      .bind(now)
      .bind(now)
      .execute(&mut *tx)
      .await
      .context("Failed to insert rollback policy")?;
    }

    tx.commit()
      .await
      .context("Failed to commit rollback policy")?;
    Ok(())
  }

  /// Lookup honours the `''`/NULL equivalence for the global row.
  pub async fn get_rollback_policy(
    &self,
    entity_type: PolicyEntityType,
    entity_id: Option<&str>,
  ) -> anyhow::Result<Option<RollbackPolicy>> {
    let entity_id = entity_id.filter(|id| !id.is_empty());
    let row = sqlx::query(
      "SELECT * FROM rollback_policies
       WHERE entity_type = ? AND entity_id IS ?",
    )
    .bind(entity_type.to_string())
    .bind(entity_id)
    .fetch_optional(&self.read)
    .await
    .context("Failed to query rollback policy")?;
    row.map(|row| row_to_policy(&row)).transpose()
  }

  pub async fn list_rollback_policies(
    &self,
  ) -> anyhow::Result<Vec<RollbackPolicy>> {
    let rows = sqlx::query(
      "SELECT * FROM rollback_policies
       ORDER BY entity_type, entity_id",
    )
    .fetch_all(&self.read)
    .await
    .context("Failed to list rollback policies")?;
    rows.iter().map(row_to_policy).collect()
  }

  /// Most specific wins: container, then stack, then global.
  /// Falls back to a default (no auto rollback) when nothing is
  /// configured.
  pub async fn effective_rollback_policy(
    &self,
    container: &str,
    stack: &str,
  ) -> anyhow::Result<RollbackPolicy> {
    if let Some(policy) = self
      .get_rollback_policy(
        PolicyEntityType::Container,
        Some(container),
      )
      .await?
    {
      return Ok(policy);
    }
    if let Some(policy) = self
      .get_rollback_policy(PolicyEntityType::Stack, Some(stack))
      .await?
    {
      return Ok(policy);
    }
    if let Some(policy) = self
      .get_rollback_policy(PolicyEntityType::Global, None)
      .await?
    {
      return Ok(policy);
    }
    Ok(RollbackPolicy::default())
  }
}

fn row_to_assignment(
  row: &SqliteRow,
) -> anyhow::Result<ScriptAssignment> {
  Ok(ScriptAssignment {
    container_name: row.try_get("container_name")?,
    script_path: row.try_get("script_path")?,
    enabled: row.try_get("enabled")?,
    ignore: row.try_get("ignored")?,
    allow_latest: row.try_get("allow_latest")?,
    assigned_by: row.try_get("assigned_by")?,
    assigned_at: row.try_get("assigned_at")?,
    updated_at: row.try_get("updated_at")?,
  })
}

fn row_to_policy(row: &SqliteRow) -> anyhow::Result<RollbackPolicy> {
  let entity_type: String = row.try_get("entity_type")?;
  Ok(RollbackPolicy {
    entity_type: PolicyEntityType::from_str(&entity_type).map_err(
      |_| anyhow::anyhow!("Unknown entity type: {entity_type}"),
    )?,
    entity_id: row.try_get("entity_id")?,
    auto_rollback_enabled: row.try_get("auto_rollback_enabled")?,
    health_check_required: row.try_get("health_check_required")?,
  })
}
