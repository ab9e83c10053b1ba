//! Per-stack serialization: at most one mutating operation per
//! stack executes at any time, across restarts.
//!
//! The queue itself is persistent (`update_queue`); this module
//! owns the lazily-spawned worker task per stack and the global
//! admission semaphore bounding concurrently active stacks.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use docksmith_client::{
  entities::{
    docksmith_timestamp,
    event::EventKind,
    update::{QueuedUpdate, UpdateOperation},
  },
  error::CoreError,
};
use tokio::sync::mpsc;

use crate::{orchestrator, state::AppState};

const NUDGE_BUFFER: usize = 8;

/// Persist the operation, park it in the queue and make sure a
/// worker exists for its stack.
pub async fn enqueue_operation(
  state: &Arc<AppState>,
  op: &UpdateOperation,
  containers: Vec<String>,
  priority: i64,
) -> Result<(), CoreError> {
  let db = state.db()?;
  db.save_update_operation(op, None)
    .await
    .map_err(|e| CoreError::Persistence(format!("{e:#}")))?;
  db.queue_update(
    &QueuedUpdate {
      operation_id: op.operation_id.clone(),
      stack_name: op.stack_name.clone(),
      containers,
      priority,
      queued_at: docksmith_timestamp(),
      estimated_start_time: None,
    },
    None,
  )
  .await
  .map_err(|e| CoreError::Persistence(format!("{e:#}")))?;

  state.events.publish(
    &op.operation_id,
    EventKind::Status,
    serde_json::json!({ "status": "queued" }),
  );

  ensure_worker(state.clone(), op.stack_name.clone());
  Ok(())
}

/// Spawn the stack's worker if missing, nudge it if present. The
/// entry lock makes check-and-spawn atomic, so a stack never gets
/// two workers.
pub fn ensure_worker(state: Arc<AppState>, stack: String) {
  match state.workers.entry(stack.clone()) {
    Entry::Occupied(entry) => {
      // A full buffer means the worker has wakeups pending anyway.
      let _ = entry.get().try_send(());
    }
    Entry::Vacant(entry) => {
      let (tx, rx) = mpsc::channel(NUDGE_BUFFER);
      entry.insert(tx);
      tokio::spawn(worker_loop(state.clone(), stack, rx));
    }
  }
}

/// On startup, revive workers for stacks with persisted rows.
pub async fn resume_workers(state: &Arc<AppState>) {
  let Some(db) = &state.db else { return };
  match db.queued_stacks().await {
    Ok(stacks) => {
      if !stacks.is_empty() {
        info!(
          "resuming queued work for {} stack(s)",
          stacks.len()
        );
      }
      for stack in stacks {
        ensure_worker(state.clone(), stack);
      }
    }
    Err(e) => {
      error!("failed to scan queue on startup | {e:#}");
    }
  }
}

async fn worker_loop(
  state: Arc<AppState>,
  stack: String,
  mut nudges: mpsc::Receiver<()>,
) {
  debug!("worker up for stack {stack}");
  loop {
    drain(&state, &stack).await;

    tokio::select! {
      nudge = nudges.recv() => {
        if nudge.is_none() {
          // Sender dropped from the registry; shut down.
          break;
        }
      }
      _ = tokio::time::sleep(state.settings.worker_idle) => {
        state.workers.remove(&stack);
        // A row may have landed between the last empty dequeue
        // and the removal; hand it a fresh worker.
        if let Some(db) = &state.db
          && let Ok(stacks) = db.queued_stacks().await
          && stacks.contains(&stack)
        {
          ensure_worker(state.clone(), stack.clone());
        }
        debug!("worker idle-stop for stack {stack}");
        break;
      }
    }
  }
}

/// Execute queued operations for a stack until the queue is empty.
/// Admission is held only while an operation actually runs.
async fn drain(state: &Arc<AppState>, stack: &str) {
  let Some(db) = &state.db else { return };
  loop {
    let permit = match state
      .admission
      .clone()
      .acquire_owned()
      .await
    {
      Ok(permit) => permit,
      Err(_) => return,
    };
    match db.dequeue_update(stack).await {
      Ok(Some(queued)) => {
        orchestrator::execute(state, queued).await;
        drop(permit);
      }
      Ok(None) => return,
      Err(e) => {
        error!("dequeue failed for stack {stack} | {e:#}");
        return;
      }
    }
  }
}
