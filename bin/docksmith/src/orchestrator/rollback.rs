//! Rollback of a prior operation: set the compose declaration
//! back to the recorded old version(s) and recreate, sharing the
//! update sub-phases. Success marks the original operation
//! `rollback_occurred`.

use docksmith_client::{
  entities::update::{OperationStatus, UpdateOperation},
  error::CoreError,
};

use crate::orchestrator::{OpCtx, update};

pub(super) async fn run_rollback(
  ctx: &mut OpCtx,
) -> Result<(), CoreError> {
  ctx.set_status(OperationStatus::Validating).await?;

  let db = ctx.state.db()?;
  let target_id = ctx
    .op
    .target_operation_id
    .clone()
    .ok_or_else(|| {
      CoreError::Validation(String::from(
        "Rollback operation has no target operation",
      ))
    })?;
  let target = db
    .get_update_operation(&target_id)
    .await
    .map_err(|e| CoreError::Persistence(format!("{e:#}")))?
    .ok_or_else(|| {
      CoreError::NotFound(format!("Operation {target_id}"))
    })?;

  // Which containers, and what old version each goes back to.
  let restores: Vec<(String, String)> =
    if target.batch_details.is_empty() {
      vec![(
        target.container_name.clone(),
        target.old_version.clone(),
      )]
    } else {
      target
        .batch_details
        .iter()
        .filter(|detail| {
          ctx.queued_containers.is_empty()
            || ctx
              .queued_containers
              .iter()
              .any(|name| *name == detail.container_name)
        })
        .map(|detail| {
          (
            detail.container_name.clone(),
            detail.old_resolved_version.clone(),
          )
        })
        .collect()
    };
  if restores.is_empty() {
    return Err(CoreError::Validation(String::from(
      "No containers to roll back",
    )));
  }

  let mut works = Vec::new();
  for (name, old_version) in &restores {
    let work =
      update::prepare(ctx, name, Some(old_version.as_str()))
        .await?;
    works.push(work);
  }

  ctx.set_status(OperationStatus::Backup).await?;

  ctx.set_status(OperationStatus::PullingImage).await?;
  for work in &works {
    update::pull_for_rollback(ctx, work).await?;
  }

  ctx.set_status(OperationStatus::Recreating).await?;
  for work in &mut works {
    update::recreate_for_rollback(ctx, work).await?;
  }

  ctx.set_status(OperationStatus::HealthCheck).await?;
  let rollback_policy =
    update::rollback_policy(ctx, &ctx.op.container_name.clone())
      .await;
  for work in &works {
    let healthy = update::wait_healthy(
      ctx,
      &work.name,
      rollback_policy.health_check_required,
    )
    .await?;
    if !healthy {
      return Err(CoreError::External(format!(
        "Container {} is unhealthy after rollback",
        work.name
      )));
    }
  }

  mark_target_rolled_back(ctx, target).await;
  ctx.complete().await
}

async fn mark_target_rolled_back(
  ctx: &OpCtx,
  mut target: UpdateOperation,
) {
  let Ok(db) = ctx.state.db() else { return };
  target.rollback_occurred = true;
  if let Err(e) =
    db.save_update_operation(&target, Some(&ctx.cancel)).await
  {
    warn!(
      "failed to flag rollback on operation {} | {e:#}",
      target.operation_id
    );
  }
}
