//! Tracked operations: recoverable state machines over Docker and
//! compose files, with observable progress.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use docksmith_client::{
  entities::{
    container::{Container, UpdatePolicy},
    docksmith_timestamp,
    event::EventKind,
    update::{
      BatchDetail, Log, OperationParams, OperationStatus,
      OperationType, QueuedUpdate, UpdateOperation,
    },
    version::ChangeType,
  },
  error::CoreError,
};
use tokio_util::sync::CancellationToken;

use crate::{
  checker, queue, state::AppState, version,
};

mod dependents;
#[cfg(test)]
mod e2e;
mod restart;
mod rollback;
mod update;

/// Execute one dequeued operation to a terminal state. Deadline
/// expiry trips the cancel token rather than dropping the work
/// mid-phase.
pub async fn execute(state: &Arc<AppState>, queued: QueuedUpdate) {
  let Ok(db) = state.db() else { return };
  let op = match db
    .get_update_operation(&queued.operation_id)
    .await
  {
    Ok(Some(op)) => op,
    Ok(None) => {
      warn!(
        "queued operation {} has no row, skipping",
        queued.operation_id
      );
      return;
    }
    Err(e) => {
      error!(
        "failed to load operation {} | {e:#}",
        queued.operation_id
      );
      return;
    }
  };
  if op.status.is_terminal() {
    return;
  }

  let cancel = CancellationToken::new();
  state
    .cancels
    .insert(op.operation_id.clone(), cancel.clone());

  let deadline_hit = Arc::new(AtomicBool::new(false));
  let deadline_task = tokio::spawn({
    let cancel = cancel.clone();
    let deadline_hit = deadline_hit.clone();
    let timeout = state.settings.operation_timeout;
    async move {
      tokio::time::sleep(timeout).await;
      deadline_hit.store(true, Ordering::SeqCst);
      cancel.cancel();
    }
  });

  let operation_id = op.operation_id.clone();
  let mut ctx = OpCtx {
    state: state.clone(),
    op,
    queued_containers: queued.containers,
    cancel,
  };

  let result = match ctx.op.operation_type {
    OperationType::Single | OperationType::FixMismatch => {
      update::run_update(&mut ctx).await
    }
    OperationType::Batch => update::run_batch(&mut ctx).await,
    OperationType::Restart => restart::run_restart(&mut ctx).await,
    OperationType::Stop => restart::run_stop(&mut ctx).await,
    OperationType::Remove => restart::run_remove(&mut ctx).await,
    OperationType::Rollback => {
      rollback::run_rollback(&mut ctx).await
    }
  };
  deadline_task.abort();

  match result {
    Ok(()) => {}
    Err(error) => {
      let error = match error {
        CoreError::Cancelled
          if deadline_hit.load(Ordering::SeqCst) =>
        {
          CoreError::DeadlineExceeded
        }
        other => other,
      };
      ctx.fail(error).await;
    }
  }

  state.cancels.remove(&operation_id);
}

/// Everything one executing operation owns. The operation row is
/// mutated only through here while the worker runs it.
pub struct OpCtx {
  pub state: Arc<AppState>,
  pub op: UpdateOperation,
  pub queued_containers: Vec<String>,
  pub cancel: CancellationToken,
}

impl OpCtx {
  pub fn check_cancel(&self) -> Result<(), CoreError> {
    if self.cancel.is_cancelled() {
      Err(CoreError::Cancelled)
    } else {
      Ok(())
    }
  }

  /// Move to the next phase: persist, then announce.
  pub async fn set_status(
    &mut self,
    status: OperationStatus,
  ) -> Result<(), CoreError> {
    self.check_cancel()?;
    self.set_status_unchecked(status).await
  }

  /// Status transition that ignores cancellation; rollback runs
  /// even for cancelled operations.
  pub async fn set_status_unchecked(
    &mut self,
    status: OperationStatus,
  ) -> Result<(), CoreError> {
    self.op.status = status;
    if status != OperationStatus::Queued
      && self.op.started_at.is_none()
    {
      self.op.started_at = Some(docksmith_timestamp());
    }
    self.persist().await?;
    self.state.events.publish(
      &self.op.operation_id,
      EventKind::Status,
      serde_json::json!({ "status": status.to_string() }),
    );
    Ok(())
  }

  pub async fn persist(&self) -> Result<(), CoreError> {
    let db = self.state.db()?;
    db.save_update_operation(&self.op, Some(&self.cancel))
      .await
      .map(|_| ())
      .map_err(|e| CoreError::Persistence(format!("{e:#}")))
  }

  pub fn progress(&self, message: impl Into<String>) {
    self.state.events.publish(
      &self.op.operation_id,
      EventKind::Progress,
      serde_json::json!({ "message": message.into() }),
    );
  }

  pub fn emit_log(&self, log: &Log) {
    self.state.events.publish(
      &self.op.operation_id,
      EventKind::Log,
      serde_json::to_value(log).unwrap_or_default(),
    );
  }

  /// Terminal success. `complete` is also the terminal state of a
  /// successfully rolled back operation (`rollback_occurred`).
  pub async fn complete(&mut self) -> Result<(), CoreError> {
    self.op.status = OperationStatus::Complete;
    self.op.completed_at = Some(docksmith_timestamp());
    self.persist().await?;
    self.state.events.publish(
      &self.op.operation_id,
      EventKind::Complete,
      serde_json::to_value(&self.op).unwrap_or_default(),
    );
    Ok(())
  }

  /// Terminal failure. Best-effort persistence: the event is
  /// emitted even when the database write fails.
  pub async fn fail(&mut self, error: CoreError) {
    self.op.status = OperationStatus::Failed;
    self.op.completed_at = Some(docksmith_timestamp());
    self.op.error_message = Some(error.to_string());
    if let Err(e) = self.persist().await {
      error!(
        "failed to persist terminal failure for {} | {e:#}",
        self.op.operation_id
      );
    }
    self.state.events.publish(
      &self.op.operation_id,
      EventKind::Fail,
      serde_json::json!({ "error": error.to_string() }),
    );
  }

  /// Audit row; failures logged, never fatal.
  pub async fn audit(
    &self,
    container: &str,
    operation: &str,
    from: &str,
    to: &str,
    success: bool,
    error: Option<&str>,
  ) {
    let Ok(db) = self.state.db() else { return };
    if let Err(e) = db
      .log_update(container, operation, from, to, success, error)
      .await
    {
      warn!("failed to write update log | {e:#}");
    }
  }
}

/// Find a container in the published status view, falling back to
/// a live recheck when discovery has not seen it yet.
pub async fn lookup_container(
  state: &Arc<AppState>,
  name: &str,
) -> Result<Container, CoreError> {
  let view = state.status.load_full();
  if let Some(container) = view
    .containers
    .iter()
    .find(|container| container.name == name)
  {
    return Ok(container.clone());
  }
  checker::check_one(state, name).await
}

/// Effective policy for a container: labels overlaid by the stored
/// assignment.
pub async fn effective_policy(
  state: &Arc<AppState>,
  container: &Container,
) -> UpdatePolicy {
  let mut policy = UpdatePolicy::from_labels(&container.labels);
  if let Some(db) = &state.db
    && let Ok(Some(assignment)) =
      db.get_script_assignment(&container.name).await
  {
    policy.apply_assignment(&assignment);
  }
  policy
}

/// `POST /api/update`: validate the target against policy and
/// queue a single update.
pub async fn create_single_update(
  state: &Arc<AppState>,
  container_name: &str,
  target_version: &str,
  force: bool,
) -> Result<UpdateOperation, CoreError> {
  if target_version.trim().is_empty() {
    return Err(CoreError::Validation(String::from(
      "target_version is required",
    )));
  }
  let container = lookup_container(state, container_name).await?;
  let policy = effective_policy(state, &container).await;
  if !force {
    version::policy_admits(
      &policy,
      &container.running_version,
      target_version,
    )?;
  }

  let mut op = UpdateOperation::new(
    OperationType::Single,
    container_name,
    container.stack.clone(),
  );
  op.container_id = container.id.clone();
  op.old_version = container.running_version.clone();
  op.new_version = target_version.to_string();
  op.params = OperationParams {
    force,
    ..Default::default()
  };
  queue::enqueue_operation(
    state,
    &op,
    vec![container_name.to_string()],
    0,
  )
  .await?;
  Ok(op)
}

/// One batch request item after validation.
pub struct BatchItem {
  pub container: Container,
  pub target_version: String,
  pub force: bool,
  pub change_type: Option<ChangeType>,
}

/// `POST /api/update/batch`: sibling `batch` operations, one per
/// stack, sharing a batch group id.
pub async fn create_batch_update(
  state: &Arc<AppState>,
  items: Vec<BatchItem>,
) -> Result<(String, Vec<UpdateOperation>), CoreError> {
  if items.is_empty() {
    return Err(CoreError::Validation(String::from(
      "containers list is empty",
    )));
  }
  let batch_group_id =
    docksmith_client::entities::new_operation_id();

  // Group by stack, preserving request order within each.
  let mut stacks: Vec<(String, Vec<BatchItem>)> = Vec::new();
  for item in items {
    let stack = item.container.stack.clone();
    match stacks.iter_mut().find(|(name, _)| *name == stack) {
      Some((_, group)) => group.push(item),
      None => stacks.push((stack, vec![item])),
    }
  }

  let mut ops = Vec::new();
  for (stack, mut group) in stacks {
    // Within a stack, containers recreate in compose-declared
    // dependency order.
    let stack_order: Vec<String> =
      checker::stack_containers(state, &stack)
        .await
        .iter()
        .map(|container| container.name.clone())
        .collect();
    group.sort_by_key(|item| {
      stack_order
        .iter()
        .position(|name| *name == item.container.name)
        .unwrap_or(usize::MAX)
    });
    let first = &group[0].container;
    let mut op = UpdateOperation::new(
      OperationType::Batch,
      first.name.clone(),
      stack.clone(),
    );
    op.batch_group_id = Some(batch_group_id.clone());
    op.params = OperationParams {
      force: group.iter().all(|item| item.force),
      ..Default::default()
    };
    op.batch_details = group
      .iter()
      .map(|item| BatchDetail {
        container_name: item.container.name.clone(),
        stack_name: stack.clone(),
        old_declared_version: item
          .container
          .declared_version
          .clone(),
        new_declared_version: item.target_version.clone(),
        old_resolved_version: item
          .container
          .running_version
          .clone(),
        new_resolved_version: item.target_version.clone(),
        change_type: item.change_type,
      })
      .collect();
    let containers: Vec<String> = group
      .iter()
      .map(|item| item.container.name.clone())
      .collect();
    queue::enqueue_operation(state, &op, containers, 0).await?;
    ops.push(op);
  }
  Ok((batch_group_id, ops))
}

/// Restart one container (or start it, for start requests).
pub async fn create_restart(
  state: &Arc<AppState>,
  container_name: &str,
  force: bool,
  start_only: bool,
  batch_group_id: Option<String>,
) -> Result<UpdateOperation, CoreError> {
  let container = lookup_container(state, container_name).await?;
  let mut op = UpdateOperation::new(
    OperationType::Restart,
    container_name,
    container.stack.clone(),
  );
  op.batch_group_id = batch_group_id;
  op.container_id = container.id.clone();
  op.old_version = container.running_version.clone();
  op.new_version = container.running_version.clone();
  op.params = OperationParams {
    force,
    start_only,
    ..Default::default()
  };
  queue::enqueue_operation(
    state,
    &op,
    vec![container_name.to_string()],
    0,
  )
  .await?;
  Ok(op)
}

/// Restart a whole stack in dependency order.
pub async fn create_stack_restart(
  state: &Arc<AppState>,
  stack: &str,
  start_only: bool,
) -> Result<UpdateOperation, CoreError> {
  let containers = checker::stack_containers(state, stack).await;
  if containers.is_empty() {
    return Err(CoreError::NotFound(format!("Stack {stack}")));
  }
  let mut op = UpdateOperation::new(
    OperationType::Restart,
    containers[0].name.clone(),
    stack,
  );
  op.params = OperationParams {
    start_only,
    ..Default::default()
  };
  let names: Vec<String> =
    containers.iter().map(|c| c.name.clone()).collect();
  queue::enqueue_operation(state, &op, names, 0).await?;
  Ok(op)
}

pub async fn create_stop(
  state: &Arc<AppState>,
  container_name: &str,
  timeout: Option<i64>,
  batch_group_id: Option<String>,
) -> Result<UpdateOperation, CoreError> {
  let container = lookup_container(state, container_name).await?;
  let mut op = UpdateOperation::new(
    OperationType::Stop,
    container_name,
    container.stack.clone(),
  );
  op.batch_group_id = batch_group_id;
  op.container_id = container.id.clone();
  op.params = OperationParams {
    stop_timeout: timeout,
    ..Default::default()
  };
  queue::enqueue_operation(
    state,
    &op,
    vec![container_name.to_string()],
    0,
  )
  .await?;
  Ok(op)
}

pub async fn create_remove(
  state: &Arc<AppState>,
  container_name: &str,
  force: bool,
  volumes: bool,
  batch_group_id: Option<String>,
) -> Result<UpdateOperation, CoreError> {
  let container = lookup_container(state, container_name).await?;
  let mut op = UpdateOperation::new(
    OperationType::Remove,
    container_name,
    container.stack.clone(),
  );
  op.batch_group_id = batch_group_id;
  op.container_id = container.id.clone();
  op.params = OperationParams {
    force,
    remove_volumes: volumes,
    ..Default::default()
  };
  queue::enqueue_operation(
    state,
    &op,
    vec![container_name.to_string()],
    0,
  )
  .await?;
  Ok(op)
}

/// `fix_mismatch`: realign the container to whatever the compose
/// file currently declares.
pub async fn create_fix_mismatch(
  state: &Arc<AppState>,
  container_name: &str,
) -> Result<UpdateOperation, CoreError> {
  let container = lookup_container(state, container_name).await?;
  let mut op = UpdateOperation::new(
    OperationType::FixMismatch,
    container_name,
    container.stack.clone(),
  );
  op.container_id = container.id.clone();
  op.old_version = container.running_version.clone();
  // Resolved at validation time from the compose file.
  op.new_version = container.declared_version.clone();
  queue::enqueue_operation(
    state,
    &op,
    vec![container_name.to_string()],
    0,
  )
  .await?;
  Ok(op)
}

/// Roll a prior operation back to its `old_version`(s).
pub async fn create_rollback(
  state: &Arc<AppState>,
  target_operation_id: &str,
  container_names: Option<Vec<String>>,
  force: bool,
) -> Result<UpdateOperation, CoreError> {
  let db = state.db()?;
  let target = db
    .get_update_operation(target_operation_id)
    .await
    .map_err(|e| CoreError::Persistence(format!("{e:#}")))?
    .ok_or_else(|| {
      CoreError::NotFound(format!(
        "Operation {target_operation_id}"
      ))
    })?;

  let containers = match &container_names {
    Some(names) if !names.is_empty() => names.clone(),
    _ if !target.batch_details.is_empty() => target
      .batch_details
      .iter()
      .map(|detail| detail.container_name.clone())
      .collect(),
    _ => vec![target.container_name.clone()],
  };

  let mut op = UpdateOperation::new(
    OperationType::Rollback,
    target.container_name.clone(),
    target.stack_name.clone(),
  );
  op.target_operation_id =
    Some(target.operation_id.clone());
  op.old_version = target.new_version.clone();
  op.new_version = target.old_version.clone();
  op.params = OperationParams {
    force,
    ..Default::default()
  };
  queue::enqueue_operation(state, &op, containers, 0).await?;
  Ok(op)
}

/// Trip a live operation's cancel token, or fail a still-queued
/// one cleanly. Returns whether anything was cancelled.
pub async fn cancel_operation(
  state: &Arc<AppState>,
  operation_id: &str,
) -> Result<bool, CoreError> {
  if let Some(cancel) = state.cancels.get(operation_id) {
    cancel.cancel();
    return Ok(true);
  }
  // Not executing: if still queued, pull it out and fail it.
  let db = state.db()?;
  let removed = db
    .remove_queued_update(operation_id)
    .await
    .map_err(|e| CoreError::Persistence(format!("{e:#}")))?;
  if !removed {
    return Ok(false);
  }
  if let Ok(Some(mut op)) =
    db.get_update_operation(operation_id).await
  {
    op.status = OperationStatus::Failed;
    op.error_message = Some(String::from("cancelled"));
    op.completed_at = Some(docksmith_timestamp());
    let _ = db.save_update_operation(&op, None).await;
    state.events.publish(
      operation_id,
      EventKind::Fail,
      serde_json::json!({ "error": "cancelled" }),
    );
  }
  Ok(true)
}

/// Wait until an operation reaches a terminal state (for the
/// synchronous endpoints). Returns the final row.
pub async fn wait_terminal(
  state: &Arc<AppState>,
  operation_id: &str,
  timeout: std::time::Duration,
) -> Result<UpdateOperation, CoreError> {
  let (cached, mut receiver) =
    state.events.subscribe(operation_id);
  if cached.is_none() {
    let wait = async {
      loop {
        match receiver.recv().await {
          Ok(event) if event.is_terminal() => break,
          Ok(_) => continue,
          Err(
            tokio::sync::broadcast::error::RecvError::Lagged(_),
          ) => continue,
          Err(_) => break,
        }
      }
    };
    if tokio::time::timeout(timeout, wait).await.is_err() {
      return Err(CoreError::DeadlineExceeded);
    }
  }
  let db = state.db()?;
  db.get_update_operation(operation_id)
    .await
    .map_err(|e| CoreError::Persistence(format!("{e:#}")))?
    .ok_or_else(|| {
      CoreError::NotFound(format!("Operation {operation_id}"))
    })
}
