use axum::extract::{Path, Query};
use docksmith_client::{
  api::OperationCreated,
  entities::{new_operation_id, update::UpdateOperation},
  error::CoreError,
};
use serde::Deserialize;

use crate::{
  api::{ApiResult, respond},
  orchestrator,
  state::app_state,
};

#[derive(Deserialize)]
pub struct ForceQuery {
  #[serde(default)]
  force: bool,
}

#[derive(Deserialize)]
pub struct StopQuery {
  timeout: Option<i64>,
}

#[derive(Deserialize)]
pub struct RemoveQuery {
  #[serde(default)]
  force: bool,
  #[serde(default)]
  volumes: bool,
}

#[derive(Deserialize)]
pub struct BatchActionRequest {
  container_names: Vec<String>,
}

fn created(op: UpdateOperation) -> OperationCreated {
  OperationCreated {
    batch_group_id: op.batch_group_id.clone(),
    operation_id: op.operation_id,
  }
}

/// Synchronous restart: returns the terminal operation row.
pub async fn restart_sync(
  Path(name): Path<String>,
  Query(query): Query<ForceQuery>,
) -> ApiResult<UpdateOperation> {
  let state = app_state();
  let result = async {
    let op = orchestrator::create_restart(
      state, &name, query.force, false, None,
    )
    .await?;
    orchestrator::wait_terminal(
      state,
      &op.operation_id,
      state.settings.operation_timeout,
    )
    .await
  }
  .await;
  respond(result)
}

/// Async restart: returns the operation id immediately.
pub async fn restart_start(
  Path(name): Path<String>,
  Query(query): Query<ForceQuery>,
) -> ApiResult<OperationCreated> {
  let result = orchestrator::create_restart(
    app_state(),
    &name,
    query.force,
    false,
    None,
  )
  .await
  .map(created);
  respond(result)
}

pub async fn restart_stack_sync(
  Path(name): Path<String>,
) -> ApiResult<UpdateOperation> {
  let state = app_state();
  let result = async {
    let op =
      orchestrator::create_stack_restart(state, &name, false)
        .await?;
    orchestrator::wait_terminal(
      state,
      &op.operation_id,
      state.settings.operation_timeout,
    )
    .await
  }
  .await;
  respond(result)
}

pub async fn restart_stack_start(
  Path(name): Path<String>,
) -> ApiResult<OperationCreated> {
  let result =
    orchestrator::create_stack_restart(app_state(), &name, false)
      .await
      .map(created);
  respond(result)
}

pub async fn stop(
  Path(name): Path<String>,
  Query(query): Query<StopQuery>,
) -> ApiResult<OperationCreated> {
  let result = orchestrator::create_stop(
    app_state(),
    &name,
    query.timeout,
    None,
  )
  .await
  .map(created);
  respond(result)
}

/// Start a stopped container; modeled as a start-only restart
/// operation so it serializes with everything else on the stack.
pub async fn start(
  Path(name): Path<String>,
) -> ApiResult<OperationCreated> {
  let result = orchestrator::create_restart(
    app_state(),
    &name,
    false,
    true,
    None,
  )
  .await
  .map(created);
  respond(result)
}

pub async fn remove(
  Path(name): Path<String>,
  Query(query): Query<RemoveQuery>,
) -> ApiResult<OperationCreated> {
  let result = orchestrator::create_remove(
    app_state(),
    &name,
    query.force,
    query.volumes,
    None,
  )
  .await
  .map(created);
  respond(result)
}

/// Batch start/stop/restart/remove. One operation per container,
/// all sharing a batch group id.
pub async fn batch_action(
  Path(action): Path<String>,
  axum::Json(request): axum::Json<BatchActionRequest>,
) -> ApiResult<serde_json::Value> {
  let state = app_state();
  if request.container_names.is_empty() {
    return respond(Err(CoreError::Validation(String::from(
      "container_names is empty",
    ))));
  }
  let batch_group_id = new_operation_id();
  let mut operation_ids = Vec::new();
  for name in &request.container_names {
    let group = Some(batch_group_id.clone());
    let created = match action.as_str() {
      "start" => {
        orchestrator::create_restart(
          state, name, false, true, group,
        )
        .await
      }
      "stop" => {
        orchestrator::create_stop(state, name, None, group).await
      }
      "restart" => {
        orchestrator::create_restart(
          state, name, false, false, group,
        )
        .await
      }
      "remove" => {
        orchestrator::create_remove(
          state, name, false, false, group,
        )
        .await
      }
      other => {
        return respond(Err(CoreError::Validation(format!(
          "Unknown batch action: {other}"
        ))));
      }
    };
    match created {
      Ok(op) => operation_ids.push(op.operation_id),
      Err(e) => return respond(Err(e)),
    }
  }
  respond(Ok(serde_json::json!({
    "batch_group_id": batch_group_id,
    "operation_ids": operation_ids,
  })))
}
