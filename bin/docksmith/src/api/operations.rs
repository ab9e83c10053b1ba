use axum::{
  Json,
  extract::{Path, Query},
};
use docksmith_client::{
  api::{
    BatchUpdateRequest, OperationCreated, OperationsQuery,
    RollbackContainersRequest, RollbackRequest, UpdateRequest,
  },
  entities::update::{OperationStatus, UpdateOperation},
  error::CoreError,
};
use store::operations::OperationFilter;

use crate::{
  api::{ApiResult, respond, respond_any},
  orchestrator,
  state::app_state,
};

pub async fn list(
  Query(query): Query<OperationsQuery>,
) -> ApiResult<Vec<UpdateOperation>> {
  let state = app_state();
  let db = match state.db() {
    Ok(db) => db,
    Err(e) => return respond(Err(e)),
  };
  let status = match query.status.as_deref() {
    Some(status) => {
      match status.parse::<OperationStatus>() {
        Ok(status) => Some(status),
        Err(_) => {
          return respond(Err(CoreError::Validation(format!(
            "Unknown status filter: {status}"
          ))));
        }
      }
    }
    None => None,
  };
  respond_any(
    db.list_update_operations(&OperationFilter {
      limit: query.limit,
      status,
      container: query.container,
    })
    .await,
  )
}

pub async fn get_one(
  Path(id): Path<String>,
) -> ApiResult<UpdateOperation> {
  let state = app_state();
  let db = match state.db() {
    Ok(db) => db,
    Err(e) => return respond(Err(e)),
  };
  let result = match db.get_update_operation(&id).await {
    Ok(Some(op)) => Ok(op),
    Ok(None) => Err(CoreError::NotFound(format!("Operation {id}"))),
    Err(e) => Err(CoreError::Persistence(format!("{e:#}"))),
  };
  respond(result)
}

pub async fn by_group(
  Path(id): Path<String>,
) -> ApiResult<Vec<UpdateOperation>> {
  let state = app_state();
  let db = match state.db() {
    Ok(db) => db,
    Err(e) => return respond(Err(e)),
  };
  respond_any(db.get_update_operations_by_batch_group(&id).await)
}

pub async fn cancel(Path(id): Path<String>) -> ApiResult<bool> {
  respond(
    orchestrator::cancel_operation(app_state(), &id).await,
  )
}

/// `POST /api/update`: queue a single update.
pub async fn update(
  Json(request): Json<UpdateRequest>,
) -> ApiResult<OperationCreated> {
  let result = orchestrator::create_single_update(
    app_state(),
    &request.container_name,
    &request.target_version,
    request.force,
  )
  .await
  .map(|op| OperationCreated {
    operation_id: op.operation_id,
    batch_group_id: None,
  });
  respond(result)
}

/// `POST /api/update/batch`: sibling operations per stack under
/// one batch group.
pub async fn update_batch(
  Json(request): Json<BatchUpdateRequest>,
) -> ApiResult<serde_json::Value> {
  let state = app_state();
  let mut items = Vec::new();
  for item in request.containers {
    let container =
      match orchestrator::lookup_container(state, &item.name).await
      {
        Ok(container) => container,
        Err(e) => return respond(Err(e)),
      };
    items.push(orchestrator::BatchItem {
      container,
      target_version: item.target_version,
      force: item.force,
      change_type: item.change_type,
    });
  }
  let result = orchestrator::create_batch_update(state, items)
    .await
    .map(|(batch_group_id, ops)| {
      serde_json::json!({
        "batch_group_id": batch_group_id,
        "operation_ids": ops
          .iter()
          .map(|op| op.operation_id.clone())
          .collect::<Vec<_>>(),
      })
    });
  respond(result)
}

pub async fn rollback(
  Json(request): Json<RollbackRequest>,
) -> ApiResult<OperationCreated> {
  let result = orchestrator::create_rollback(
    app_state(),
    &request.operation_id,
    None,
    false,
  )
  .await
  .map(|op| OperationCreated {
    operation_id: op.operation_id,
    batch_group_id: None,
  });
  respond(result)
}

pub async fn rollback_containers(
  Json(request): Json<RollbackContainersRequest>,
) -> ApiResult<OperationCreated> {
  let result = orchestrator::create_rollback(
    app_state(),
    &request.operation_id,
    Some(request.container_names),
    request.force,
  )
  .await
  .map(|op| OperationCreated {
    operation_id: op.operation_id,
    batch_group_id: None,
  });
  respond(result)
}

pub async fn fix_mismatch(
  Path(name): Path<String>,
) -> ApiResult<OperationCreated> {
  let result =
    orchestrator::create_fix_mismatch(app_state(), &name)
      .await
      .map(|op| OperationCreated {
        operation_id: op.operation_id,
        batch_group_id: None,
      });
  respond(result)
}
