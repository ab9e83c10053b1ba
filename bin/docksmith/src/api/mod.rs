//! The REST surface: thin handlers over the core, sharing the
//! `{success, data?, error?}` envelope.

use axum::{
  Json, Router,
  http::StatusCode,
  routing::{delete, get, post},
};
use docksmith_client::{api::ApiResponse, error::CoreError};
use serde::Serialize;

mod config_api;
mod containers;
mod events;
mod labels;
mod operations;
mod policies;
mod registry_api;
mod scripts;
mod status;

pub fn router() -> Router {
  Router::new()
    .route("/api/status", get(status::get_status))
    .route("/api/check", get(status::check_now))
    .route("/api/trigger-check", post(status::trigger_check))
    .route(
      "/api/container/{name}/recheck",
      get(status::recheck_container),
    )
    .route("/api/check-history", get(status::check_history))
    .route("/api/operations", get(operations::list))
    .route("/api/operations/{id}", get(operations::get_one))
    .route(
      "/api/operations/group/{id}",
      get(operations::by_group),
    )
    .route(
      "/api/operations/{id}/cancel",
      post(operations::cancel),
    )
    .route("/api/update", post(operations::update))
    .route("/api/update/batch", post(operations::update_batch))
    .route("/api/rollback", post(operations::rollback))
    .route(
      "/api/rollback/containers",
      post(operations::rollback_containers),
    )
    .route(
      "/api/fix-compose-mismatch/{name}",
      post(operations::fix_mismatch),
    )
    .route(
      "/api/restart/container/{name}",
      post(containers::restart_sync),
    )
    .route(
      "/api/restart/start/{name}",
      post(containers::restart_start),
    )
    .route(
      "/api/restart/stack/{name}",
      post(containers::restart_stack_sync),
    )
    .route(
      "/api/restart/stack/start/{name}",
      post(containers::restart_stack_start),
    )
    .route(
      "/api/containers/{name}/stop",
      post(containers::stop),
    )
    .route(
      "/api/containers/{name}/start",
      post(containers::start),
    )
    .route("/api/containers/{name}", delete(containers::remove))
    .route(
      "/api/containers/batch/{action}",
      post(containers::batch_action),
    )
    .route("/api/labels/{name}", get(labels::get_labels))
    .route("/api/labels/set", post(labels::set_label))
    .route("/api/labels/remove", post(labels::remove_label))
    .route("/api/labels/batch", post(labels::batch))
    .route("/api/labels/rollback", post(labels::rollback))
    .route("/api/scripts", get(scripts::list))
    .route("/api/scripts/assigned", get(scripts::assigned))
    .route("/api/scripts/assign", post(scripts::assign))
    .route(
      "/api/scripts/assign/{name}",
      delete(scripts::unassign),
    )
    .route(
      "/api/registry/tags/{*image_ref}",
      get(registry_api::tags),
    )
    .route(
      "/api/policies",
      get(policies::list).post(policies::set),
    )
    .route(
      "/api/config",
      get(config_api::get_config).post(config_api::set_config),
    )
    .route("/api/config/snapshots", get(config_api::snapshots))
    .route("/api/config/revert/{id}", post(config_api::revert))
    .route("/events/{operation_id}", get(events::stream))
    .route("/health", get(health))
}

async fn health() -> &'static str {
  "ok"
}

pub type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
  (StatusCode::OK, Json(ApiResponse::ok(data)))
}

pub fn err<T: Serialize>(error: CoreError) -> ApiResult<T> {
  let status = match &error {
    CoreError::Validation(_) | CoreError::PolicyBlock(_) => {
      StatusCode::BAD_REQUEST
    }
    CoreError::NotFound(_) => StatusCode::NOT_FOUND,
    CoreError::Cancelled | CoreError::DeadlineExceeded => {
      StatusCode::CONFLICT
    }
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  };
  (status, Json(ApiResponse::err(error.to_string())))
}

pub fn respond<T: Serialize>(
  result: Result<T, CoreError>,
) -> ApiResult<T> {
  match result {
    Ok(data) => ok(data),
    Err(error) => err(error),
  }
}

/// anyhow errors surface as internal persistence-ish failures.
pub fn respond_any<T: Serialize>(
  result: anyhow::Result<T>,
) -> ApiResult<T> {
  respond(
    result.map_err(|e| CoreError::Persistence(format!("{e:#}"))),
  )
}
