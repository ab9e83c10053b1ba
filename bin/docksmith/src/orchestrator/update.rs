//! The update state machine:
//! validating -> backup -> pulling_image -> recreating ->
//! health_check -> complete, with rolling_back on failure after
//! recreation when policy allows.

use std::path::PathBuf;

use docksmith_client::{
  entities::{
    split_image_ref,
    update::{OperationStatus, OperationType},
  },
  error::CoreError,
};

use crate::{
  composefile::ComposeFile,
  docker::HealthState,
  orchestrator::{
    OpCtx, dependents, effective_policy, lookup_container,
  },
  version,
};

/// Everything needed to update one container, collected during
/// validation. `backup` holds the pre-edit compose content for
/// rollback.
pub(super) struct ContainerWork {
  pub name: String,
  pub service: String,
  pub compose_path: PathBuf,
  pub project: String,
  pub repository: String,
  pub old_tag: String,
  pub target_tag: String,
  pub backup: String,
  pub recreated: bool,
}

impl ContainerWork {
  pub fn old_image(&self) -> String {
    format!("{}:{}", self.repository, self.old_tag)
  }

  pub fn target_image(&self) -> String {
    format!("{}:{}", self.repository, self.target_tag)
  }
}

pub(super) async fn prepare(
  ctx: &OpCtx,
  container_name: &str,
  target_tag: Option<&str>,
) -> Result<ContainerWork, CoreError> {
  let raw = ctx
    .state
    .docker
    .inspect_container(container_name)
    .await
    .map_err(CoreError::external)?
    .ok_or_else(|| {
      CoreError::NotFound(format!("Container {container_name}"))
    })?;

  let compose_path = raw
    .compose_file()
    .map(PathBuf::from)
    .ok_or_else(|| {
      CoreError::Validation(format!(
        "Container {container_name} is not managed by compose"
      ))
    })?;
  let project = raw
    .compose_project()
    .map(str::to_string)
    .unwrap_or_default();

  let file = ComposeFile::load(&compose_path)
    .await
    .map_err(CoreError::external)?;

  let service = match raw.compose_service() {
    Some(service) => service.to_string(),
    None => file
      .service_for_container(container_name, &project)
      .map_err(CoreError::external)?
      .ok_or_else(|| {
        CoreError::NotFound(format!(
          "Service for container {container_name} in \
           {compose_path:?}"
        ))
      })?,
  };

  let declared_image = file
    .service_image(&service)
    .map_err(CoreError::external)?
    .ok_or_else(|| {
      CoreError::Validation(format!(
        "Service {service} declares no image"
      ))
    })?;
  let (repository, declared_tag) =
    split_image_ref(&declared_image);
  let declared_tag =
    declared_tag.unwrap_or_else(|| String::from("latest"));

  let target_tag = target_tag
    .map(str::to_string)
    .unwrap_or_else(|| declared_tag.clone());

  Ok(ContainerWork {
    name: container_name.to_string(),
    service,
    compose_path,
    project,
    repository,
    old_tag: declared_tag,
    target_tag,
    backup: file.contents().to_string(),
    recreated: false,
  })
}

/// Single update and fix_mismatch (which realigns to the compose
/// declaration instead of a requested tag).
pub(super) async fn run_update(
  ctx: &mut OpCtx,
) -> Result<(), CoreError> {
  ctx.set_status(OperationStatus::Validating).await?;

  let container_name = ctx.op.container_name.clone();
  let fix_mismatch =
    ctx.op.operation_type == OperationType::FixMismatch;
  let requested = ctx.op.new_version.clone();

  let mut work = prepare(
    ctx,
    &container_name,
    (!fix_mismatch).then_some(requested.as_str()),
  )
  .await?;

  let container =
    lookup_container(&ctx.state, &container_name).await?;
  let policy = effective_policy(&ctx.state, &container).await;

  if !fix_mismatch && !ctx.op.params.force {
    version::policy_admits(
      &policy,
      &work.old_tag,
      &work.target_tag,
    )?;
  }

  // Dependency closure is validated up front so a cycle fails the
  // operation before any Docker state changes.
  let view = ctx.state.status.load_full();
  let dependents = dependents::restart_closure_seeded(
    &view.containers,
    &container_name,
    &policy.restart_after,
  )?;

  if let Some(script) = &policy.pre_update_check
    && !ctx.op.params.force
  {
    let log = ctx.state.docker.exec(&container_name, script).await;
    ctx.emit_log(&log);
    if !log.success {
      return Err(CoreError::PreUpdateCheck(format!(
        "{script} exited non-zero: {}",
        log.stderr.trim()
      )));
    }
  }

  // Keep the persisted row's version fields truthful for
  // fix_mismatch, where the target comes from the compose file.
  ctx.op.new_version = work.target_tag.clone();
  if ctx.op.old_version.is_empty() {
    ctx.op.old_version = work.old_tag.clone();
  }

  ctx.set_status(OperationStatus::Backup).await?;

  ctx.set_status(OperationStatus::PullingImage).await?;
  pull_target(ctx, &work).await?;

  ctx.set_status(OperationStatus::Recreating).await?;
  recreate_with_audit(ctx, &mut work, "restart").await?;

  ctx.set_status(OperationStatus::HealthCheck).await?;
  let rollback_policy = rollback_policy(ctx, &container_name).await;
  match wait_healthy(
    ctx,
    &container_name,
    rollback_policy.health_check_required,
  )
  .await
  {
    Ok(true) => {
      restart_dependents(ctx, dependents).await;
      ctx.complete().await
    }
    Ok(false) => {
      if rollback_policy.auto_rollback_enabled {
        roll_back_stack(ctx, std::slice::from_mut(&mut work))
          .await?;
        ctx.op.rollback_occurred = true;
        return ctx.complete().await;
      }
      Err(CoreError::External(format!(
        "Container {container_name} failed its health check \
         after update to {}",
        work.target_tag
      )))
    }
    // Cancelled after recreation: best effort, roll back when
    // policy permits, otherwise surface the cancellation.
    Err(CoreError::Cancelled)
      if rollback_policy.auto_rollback_enabled =>
    {
      roll_back_stack(ctx, std::slice::from_mut(&mut work))
        .await?;
      ctx.op.rollback_occurred = true;
      ctx.op.error_message =
        Some(CoreError::Cancelled.to_string());
      ctx.complete().await
    }
    Err(error) => Err(error),
  }
}

/// Batch update: every container of one stack, staged together so
/// the operation status stays monotonic. Containers come in
/// dependency order from the queue row.
pub(super) async fn run_batch(
  ctx: &mut OpCtx,
) -> Result<(), CoreError> {
  ctx.set_status(OperationStatus::Validating).await?;

  let targets: Vec<(String, String)> = ctx
    .op
    .batch_details
    .iter()
    .map(|detail| {
      (
        detail.container_name.clone(),
        detail.new_resolved_version.clone(),
      )
    })
    .collect();

  let mut ordered: Vec<(String, String)> = Vec::new();
  for name in &ctx.queued_containers {
    if let Some(target) =
      targets.iter().find(|(n, _)| n == name)
    {
      ordered.push(target.clone());
    }
  }

  let mut works = Vec::new();
  for (name, target) in &ordered {
    let work = prepare(ctx, name, Some(target.as_str())).await?;
    let container = lookup_container(&ctx.state, name).await?;
    let policy = effective_policy(&ctx.state, &container).await;
    if !ctx.op.params.force {
      version::policy_admits(
        &policy,
        &work.old_tag,
        &work.target_tag,
      )?;
    }
    works.push(work);
  }

  ctx.set_status(OperationStatus::Backup).await?;

  ctx.set_status(OperationStatus::PullingImage).await?;
  for work in &works {
    pull_target(ctx, work).await?;
  }

  ctx.set_status(OperationStatus::Recreating).await?;
  let rollback_policy =
    rollback_policy(ctx, &ctx.op.container_name.clone()).await;
  for index in 0..works.len() {
    if let Err(error) =
      recreate_with_audit(ctx, &mut works[index], "restart").await
    {
      // One container failing rolls the whole stack back when
      // policy allows; other stacks in the batch group are
      // independent operations and unaffected.
      if rollback_policy.auto_rollback_enabled {
        roll_back_stack(ctx, &mut works[..=index]).await?;
        ctx.op.rollback_occurred = true;
        return ctx.complete().await;
      }
      return Err(error);
    }
  }

  ctx.set_status(OperationStatus::HealthCheck).await?;
  for index in 0..works.len() {
    let name = works[index].name.clone();
    let healthy = wait_healthy(
      ctx,
      &name,
      rollback_policy.health_check_required,
    )
    .await?;
    if !healthy {
      if rollback_policy.auto_rollback_enabled {
        roll_back_stack(ctx, &mut works).await?;
        ctx.op.rollback_occurred = true;
        return ctx.complete().await;
      }
      return Err(CoreError::External(format!(
        "Container {name} failed its health check"
      )));
    }
  }

  ctx.complete().await
}

async fn pull_target(
  ctx: &OpCtx,
  work: &ContainerWork,
) -> Result<(), CoreError> {
  ctx.check_cancel()?;
  let target_image = work.target_image();
  let log = ctx.state.docker.pull_image(&target_image).await;
  ctx.emit_log(&log);
  ctx
    .audit(
      &work.name,
      "pull",
      &work.old_tag,
      &work.target_tag,
      log.success,
      (!log.success).then(|| log.stderr.clone()).as_deref(),
    )
    .await;
  if !log.success {
    return Err(CoreError::External(format!(
      "Failed to pull {target_image}: {}",
      log.stderr.trim()
    )));
  }
  Ok(())
}

/// Edit the compose file to the target tag and force-recreate the
/// service. Edits are on disk before `compose up`, so a failure
/// here can leave a visible mismatch; that is reported by the
/// next check and fixable via fix_mismatch.
async fn recreate_with_audit(
  ctx: &OpCtx,
  work: &mut ContainerWork,
  audit_op: &str,
) -> Result<(), CoreError> {
  ctx.check_cancel()?;
  if work.target_tag != work.old_tag {
    let mut file = ComposeFile::load(&work.compose_path)
      .await
      .map_err(CoreError::external)?;
    file
      .set_service_image(&work.service, &work.target_image())
      .map_err(CoreError::external)?;
    file.save().await.map_err(CoreError::external)?;
  }
  let log = ctx
    .state
    .docker
    .compose_up(&work.compose_path, &work.project, &work.service)
    .await;
  ctx.emit_log(&log);
  ctx
    .audit(
      &work.name,
      audit_op,
      &work.old_tag,
      &work.target_tag,
      log.success,
      (!log.success).then(|| log.stderr.clone()).as_deref(),
    )
    .await;
  if !log.success {
    return Err(CoreError::External(format!(
      "Failed to recreate {}: {}",
      work.name,
      log.stderr.trim()
    )));
  }
  work.recreated = true;
  Ok(())
}

/// Rollback operations pull the version being restored.
pub(super) async fn pull_for_rollback(
  ctx: &OpCtx,
  work: &ContainerWork,
) -> Result<(), CoreError> {
  pull_target(ctx, work).await
}

/// Rollback recreates audit as `rollback` rows.
pub(super) async fn recreate_for_rollback(
  ctx: &OpCtx,
  work: &mut ContainerWork,
) -> Result<(), CoreError> {
  recreate_with_audit(ctx, work, "rollback").await
}

pub(super) async fn rollback_policy(
  ctx: &OpCtx,
  container: &str,
) -> docksmith_client::entities::policy::RollbackPolicy {
  let Ok(db) = ctx.state.db() else {
    return Default::default();
  };
  db.effective_rollback_policy(container, &ctx.op.stack_name)
    .await
    .unwrap_or_default()
}

/// Bounded wait for the container to report healthy. A container
/// without a declared healthcheck passes after a fixed grace
/// unless policy requires one.
pub(super) async fn wait_healthy(
  ctx: &OpCtx,
  container: &str,
  health_check_required: bool,
) -> Result<bool, CoreError> {
  let settings = &ctx.state.settings;
  let deadline = tokio::time::Instant::now()
    + settings.health_check_timeout;
  loop {
    ctx.check_cancel()?;
    let health = ctx
      .state
      .docker
      .health(container)
      .await
      .map_err(CoreError::external)?;
    match health {
      HealthState::Healthy => return Ok(true),
      HealthState::Unhealthy => return Ok(false),
      HealthState::None => {
        if health_check_required {
          return Ok(false);
        }
        tokio::time::sleep(settings.no_healthcheck_grace).await;
        ctx.check_cancel()?;
        let running = ctx
          .state
          .docker
          .inspect_container(container)
          .await
          .map_err(CoreError::external)?
          .map(|c| c.is_running())
          .unwrap_or(false);
        return Ok(running);
      }
      HealthState::Starting => {
        if tokio::time::Instant::now() >= deadline {
          return Ok(false);
        }
        tokio::time::sleep(settings.health_poll_interval).await;
      }
    }
  }
}

/// Restore compose files from their backups and recreate every
/// container that was already recreated. Emits one `rollback`
/// audit row per container.
pub(super) async fn roll_back_stack(
  ctx: &mut OpCtx,
  works: &mut [ContainerWork],
) -> Result<(), CoreError> {
  ctx
    .set_status_unchecked(OperationStatus::RollingBack)
    .await?;
  for work in works.iter_mut().rev() {
    ComposeFile::restore(&work.compose_path, &work.backup)
      .await
      .map_err(CoreError::external)?;
    if !work.recreated {
      continue;
    }
    let pull = ctx.state.docker.pull_image(&work.old_image()).await;
    if !pull.success {
      debug!(
        "rollback pull of {} failed (may exist locally)",
        work.old_image()
      );
    }
    let log = ctx
      .state
      .docker
      .compose_up(&work.compose_path, &work.project, &work.service)
      .await;
    ctx.emit_log(&log);
    ctx
      .audit(
        &work.name,
        "rollback",
        &work.target_tag,
        &work.old_tag,
        log.success,
        (!log.success).then(|| log.stderr.clone()).as_deref(),
      )
      .await;
    if !log.success {
      return Err(CoreError::External(format!(
        "Rollback recreate failed for {}: {}",
        work.name,
        log.stderr.trim()
      )));
    }
  }
  Ok(())
}

/// Restart `docksmith.restart-after` dependents in order. Failures
/// are surfaced on the event stream but never fail the primary
/// operation.
pub(super) async fn restart_dependents(
  ctx: &mut OpCtx,
  dependents: Vec<String>,
) {
  for name in dependents {
    let log = ctx.state.docker.restart_container(&name).await;
    ctx.emit_log(&log);
    if log.success {
      ctx.progress(format!("restarted dependent {name}"));
      ctx.op.dependents_affected.push(name);
    } else {
      ctx.progress(format!(
        "dependent {name} failed to restart: {}",
        log.stderr.trim()
      ));
    }
  }
}
