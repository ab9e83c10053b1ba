//! Restart, stop and remove: the reduced state machines.

use docksmith_client::{
  entities::update::OperationStatus,
  error::CoreError,
};

use crate::orchestrator::{OpCtx, update};

/// restart: queued -> validating -> recreating -> health_check ->
/// complete | failed. Multi-container rows (stack restarts) bounce
/// every container in queue order.
pub(super) async fn run_restart(
  ctx: &mut OpCtx,
) -> Result<(), CoreError> {
  ctx.set_status(OperationStatus::Validating).await?;

  let names = if ctx.queued_containers.is_empty() {
    vec![ctx.op.container_name.clone()]
  } else {
    ctx.queued_containers.clone()
  };
  let mut existing = Vec::new();
  for name in &names {
    let container = ctx
      .state
      .docker
      .inspect_container(name)
      .await
      .map_err(CoreError::external)?
      .ok_or_else(|| {
        CoreError::NotFound(format!("Container {name}"))
      })?;
    existing.push(container);
  }

  ctx.set_status(OperationStatus::Recreating).await?;
  for container in &existing {
    ctx.check_cancel()?;
    let start_only = ctx.op.params.start_only;
    let log = if start_only {
      if container.is_running() {
        ctx.progress(format!(
          "{} already running, skipping",
          container.name
        ));
        continue;
      }
      ctx.state.docker.start_container(&container.name).await
    } else {
      ctx.state.docker.restart_container(&container.name).await
    };
    ctx.emit_log(&log);
    ctx
      .audit(
        &container.name,
        "restart",
        "",
        "",
        log.success,
        (!log.success).then(|| log.stderr.clone()).as_deref(),
      )
      .await;
    if !log.success {
      return Err(CoreError::External(format!(
        "Failed to restart {}: {}",
        container.name,
        log.stderr.trim()
      )));
    }
  }

  ctx.set_status(OperationStatus::HealthCheck).await?;
  for container in &existing {
    let healthy =
      update::wait_healthy(ctx, &container.name, false).await?;
    if !healthy {
      return Err(CoreError::External(format!(
        "Container {} is unhealthy after restart",
        container.name
      )));
    }
  }

  ctx.complete().await
}

/// stop: queued -> validating -> in_progress -> complete | failed.
pub(super) async fn run_stop(
  ctx: &mut OpCtx,
) -> Result<(), CoreError> {
  ctx.set_status(OperationStatus::Validating).await?;
  let name = ctx.op.container_name.clone();
  ctx
    .state
    .docker
    .inspect_container(&name)
    .await
    .map_err(CoreError::external)?
    .ok_or_else(|| {
      CoreError::NotFound(format!("Container {name}"))
    })?;

  ctx.set_status(OperationStatus::InProgress).await?;
  let timeout = ctx
    .op
    .params
    .stop_timeout
    .or(Some(ctx.state.settings.stop_timeout));
  let log = ctx.state.docker.stop_container(&name, timeout).await;
  ctx.emit_log(&log);
  if !log.success {
    return Err(CoreError::External(format!(
      "Failed to stop {name}: {}",
      log.stderr.trim()
    )));
  }
  ctx.complete().await
}

/// remove: queued -> validating -> in_progress -> complete |
/// failed. Running containers are stopped first unless force.
pub(super) async fn run_remove(
  ctx: &mut OpCtx,
) -> Result<(), CoreError> {
  ctx.set_status(OperationStatus::Validating).await?;
  let name = ctx.op.container_name.clone();
  let container = ctx
    .state
    .docker
    .inspect_container(&name)
    .await
    .map_err(CoreError::external)?
    .ok_or_else(|| {
      CoreError::NotFound(format!("Container {name}"))
    })?;

  ctx.set_status(OperationStatus::InProgress).await?;
  if container.is_running() && !ctx.op.params.force {
    let stop = ctx
      .state
      .docker
      .stop_container(
        &name,
        Some(ctx.state.settings.stop_timeout),
      )
      .await;
    ctx.emit_log(&stop);
    if !stop.success {
      return Err(CoreError::External(format!(
        "Failed to stop {name} before removal: {}",
        stop.stderr.trim()
      )));
    }
  }
  let log = ctx
    .state
    .docker
    .remove_container(
      &name,
      ctx.op.params.force,
      ctx.op.params.remove_volumes,
    )
    .await;
  ctx.emit_log(&log);
  if !log.success {
    return Err(CoreError::External(format!(
      "Failed to remove {name}: {}",
      log.stderr.trim()
    )));
  }
  ctx.complete().await
}
