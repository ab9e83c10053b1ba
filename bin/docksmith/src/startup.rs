use std::{sync::Arc, time::Duration};

use crate::{queue, state::AppState};

/// Recovery work after the database is up: orphaned operations
/// from a prior process fail out (never auto-retried), stale cache
/// rows drop, and stacks with queued rows get workers again.
pub async fn on_startup(state: &Arc<AppState>) {
  if let Some(db) = &state.db {
    match db
      .fail_non_terminal_operations("process restarted")
      .await
    {
      Ok(0) => {}
      Ok(swept) => {
        info!(
          "marked {swept} interrupted operation(s) as failed"
        );
      }
      Err(e) => {
        error!("startup operation sweep failed | {e:#}");
      }
    }
    match db.prune_version_cache().await {
      Ok(0) => {}
      Ok(pruned) => {
        debug!("pruned {pruned} expired version cache row(s)");
      }
      Err(e) => {
        warn!("version cache prune failed | {e:#}");
      }
    }
  }
  queue::resume_workers(state).await;
}

/// Periodically drop event channels for operations that finished
/// minutes ago.
pub fn spawn_event_gc_loop(state: Arc<AppState>) {
  tokio::spawn(async move {
    let mut ticker =
      tokio::time::interval(Duration::from_secs(60));
    loop {
      ticker.tick().await;
      let collected = state.events.collect_garbage();
      if collected > 0 {
        debug!("collected {collected} finished event channel(s)");
      }
    }
  });
}
