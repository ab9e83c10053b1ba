use std::collections::HashMap;

use anyhow::Context;
use docksmith_client::entities::{
  docksmith_timestamp, policy::ConfigSnapshot,
};
use sqlx::{Row, sqlite::SqliteRow};

use crate::{DbClient, with_busy_retry};

impl DbClient {
  pub async fn get_config(
    &self,
  ) -> anyhow::Result<HashMap<String, String>> {
    let rows = sqlx::query("SELECT key, value FROM config")
      .fetch_all(&self.read)
      .await
      .context("Failed to read config")?;
    rows
      .iter()
      .map(|row| {
        anyhow::Ok((row.try_get("key")?, row.try_get("value")?))
      })
      .collect()
  }

  /// Apply key/value updates and append a snapshot of the full
  /// resulting config, all in one transaction.
  pub async fn set_config_many(
    &self,
    updates: &HashMap<String, String>,
    changed_by: &str,
  ) -> anyhow::Result<i64> {
    let now = docksmith_timestamp();
    let mut tx = self
      .write
      .begin()
      .await
      .context("Failed to open config transaction")?;

    for (key, value) in updates {
      sqlx::query(
        "INSERT INTO config (key, value, updated_at)
         VALUES (?, ?, ?)
         ON CONFLICT (key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
      )
      .bind(key)
      .bind(value)
      .bind(now)
      .execute(&mut *tx)
      .await
      .with_context(|| format!("Failed to set config key {key}"))?;
    }

    let rows = sqlx::query("SELECT key, value FROM config")
      .fetch_all(&mut *tx)
      .await
      .context("Failed to read config for snapshot")?;
    let full: HashMap<String, String> = rows
      .iter()
      .map(|row| {
        anyhow::Ok((row.try_get("key")?, row.try_get("value")?))
      })
      .collect::<anyhow::Result<_>>()?;
    let data = serde_json::to_string(&full)
      .context("Failed to serialize config snapshot")?;

    let result = sqlx::query(
      "INSERT INTO config_history (config_data, changed_by, created_at)
       VALUES (?, ?, ?)",
    )
    .bind(&data)
    .bind(changed_by)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("Failed to append config snapshot")?;

    tx.commit()
      .await
      .context("Failed to commit config update")?;
    Ok(result.last_insert_rowid())
  }

  pub async fn save_config_snapshot(
    &self,
    config_data: &HashMap<String, String>,
    changed_by: &str,
  ) -> anyhow::Result<i64> {
    let data = serde_json::to_string(config_data)
      .context("Failed to serialize config snapshot")?;
    let now = docksmith_timestamp();
    let result = with_busy_retry(None, || {
      sqlx::query(
        "INSERT INTO config_history (config_data, changed_by, created_at)
         VALUES (?, ?, ?)",
      )
      .bind(&data)
      .bind(changed_by)
      .bind(now)
      .execute(&self.write)
    })
    .await
    .context("Failed to save config snapshot")?;
    Ok(result.last_insert_rowid())
  }

  pub async fn get_config_snapshot_by_id(
    &self,
    id: i64,
  ) -> anyhow::Result<Option<ConfigSnapshot>> {
    let row = sqlx::query(
      "SELECT * FROM config_history WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&self.read)
    .await
    .context("Failed to query config snapshot")?;
    row.map(|row| row_to_snapshot(&row)).transpose()
  }

  pub async fn list_config_snapshots(
    &self,
    limit: i64,
  ) -> anyhow::Result<Vec<ConfigSnapshot>> {
    let rows = sqlx::query(
      "SELECT * FROM config_history ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(&self.read)
    .await
    .context("Failed to list config snapshots")?;
    rows.iter().map(row_to_snapshot).collect()
  }

  /// Atomic revert: delete all current config rows, restore the
  /// snapshot's pairs, and record a `revert-to-snapshot-<id>`
  /// history row, in a single transaction.
  pub async fn revert_to_snapshot(
    &self,
    id: i64,
  ) -> anyhow::Result<ConfigSnapshot> {
    let snapshot = self
      .get_config_snapshot_by_id(id)
      .await?
      .with_context(|| format!("No config snapshot with id {id}"))?;
    let now = docksmith_timestamp();

    let mut tx = self
      .write
      .begin()
      .await
      .context("Failed to open revert transaction")?;

    sqlx::query("DELETE FROM config")
      .execute(&mut *tx)
      .await
      .context("Failed to clear config")?;

    for (key, value) in &snapshot.config_data {
      sqlx::query(
        "INSERT INTO config (key, value, updated_at)
         VALUES (?, ?, ?)",
      )
      .bind(key)
      .bind(value)
      .bind(now)
      .execute(&mut *tx)
      .await
      .with_context(|| {
        format!("Failed to restore config key {key}")
      })?;
    }

    let data = serde_json::to_string(&snapshot.config_data)
      .context("Failed to serialize reverted snapshot")?;
    sqlx::query(
      "INSERT INTO config_history (config_data, changed_by, created_at)
       VALUES (?, ?, ?)",
    )
    .bind(&data)
    .bind(format!("revert-to-snapshot-{id}"))
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("Failed to record revert snapshot")?;

    tx.commit().await.context("Failed to commit revert")?;
    Ok(snapshot)
  }
}

fn row_to_snapshot(row: &SqliteRow) -> anyhow::Result<ConfigSnapshot> {
  let data: String = row.try_get("config_data")?;
  Ok(ConfigSnapshot {
    id: row.try_get("id")?,
    config_data: serde_json::from_str(&data)
      .context("Corrupt config snapshot json")?,
    changed_by: row.try_get("changed_by")?,
    created_at: row.try_get("created_at")?,
  })
}
