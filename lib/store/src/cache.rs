use anyhow::Context;
use docksmith_client::entities::docksmith_timestamp;
use sqlx::Row;

use crate::{DbClient, with_busy_retry};

impl DbClient {
  /// Cache a sha -> version resolution. Keyed by
  /// `(sha256, image_ref, architecture)`; re-saving refreshes
  /// `resolved_at`.
  pub async fn save_version_cache(
    &self,
    sha256: &str,
    image_ref: &str,
    architecture: &str,
    resolved_version: &str,
  ) -> anyhow::Result<()> {
    let now = docksmith_timestamp();
    with_busy_retry(None, || {
      sqlx::query(
        "INSERT INTO version_cache (
          sha256, image_ref, architecture,
          resolved_version, resolved_at
        ) VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (sha256, image_ref, architecture) DO UPDATE SET
          resolved_version = excluded.resolved_version,
          resolved_at = excluded.resolved_at",
      )
      .bind(sha256)
      .bind(image_ref)
      .bind(architecture)
      .bind(resolved_version)
      .bind(now)
      .execute(&self.write)
    })
    .await
    .context("Failed to save version cache entry")?;
    Ok(())
  }

  /// Rows older than the effective TTL are treated as absent.
  pub async fn get_version_cache(
    &self,
    sha256: &str,
    image_ref: &str,
    architecture: &str,
  ) -> anyhow::Result<Option<String>> {
    let oldest = docksmith_timestamp() - self.cache_ttl_ms;
    let row = sqlx::query(
      "SELECT resolved_version FROM version_cache
       WHERE sha256 = ? AND image_ref = ? AND architecture = ?
         AND resolved_at > ?",
    )
    .bind(sha256)
    .bind(image_ref)
    .bind(architecture)
    .bind(oldest)
    .fetch_optional(&self.read)
    .await
    .context("Failed to query version cache")?;
    row
      .map(|row| {
        row
          .try_get("resolved_version")
          .context("No resolved_version on cache row")
      })
      .transpose()
  }

  /// Drop expired rows. Returns how many were removed.
  pub async fn prune_version_cache(&self) -> anyhow::Result<u64> {
    let oldest = docksmith_timestamp() - self.cache_ttl_ms;
    let result = with_busy_retry(None, || {
      sqlx::query("DELETE FROM version_cache WHERE resolved_at <= ?")
        .bind(oldest)
        .execute(&self.write)
    })
    .await
    .context("Failed to prune version cache")?;
    Ok(result.rows_affected())
  }
}
