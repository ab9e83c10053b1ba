use std::collections::HashMap;

use axum::{Json, extract::Path};
use docksmith_client::{
  api::UpdateConfigRequest,
  entities::policy::ConfigSnapshot,
  error::CoreError,
};

use crate::{
  api::{ApiResult, respond, respond_any},
  state::app_state,
};

pub async fn get_config() -> ApiResult<HashMap<String, String>> {
  let state = app_state();
  let db = match state.db() {
    Ok(db) => db,
    Err(e) => return respond(Err(e)),
  };
  respond_any(db.get_config().await)
}

/// Apply key/value updates; every write appends a snapshot.
pub async fn set_config(
  Json(request): Json<UpdateConfigRequest>,
) -> ApiResult<i64> {
  let state = app_state();
  let result = async {
    if request.config.is_empty() {
      return Err(CoreError::Validation(String::from(
        "config is empty",
      )));
    }
    let db = state.db()?;
    db.set_config_many(&request.config, &request.changed_by)
      .await
      .map_err(|e| CoreError::Persistence(format!("{e:#}")))
  }
  .await;
  respond(result)
}

pub async fn snapshots() -> ApiResult<Vec<ConfigSnapshot>> {
  let state = app_state();
  let db = match state.db() {
    Ok(db) => db,
    Err(e) => return respond(Err(e)),
  };
  respond_any(db.list_config_snapshots(100).await)
}

/// Atomic revert to a snapshot; records a
/// `revert-to-snapshot-<id>` history row.
pub async fn revert(
  Path(id): Path<i64>,
) -> ApiResult<ConfigSnapshot> {
  let state = app_state();
  let result = async {
    let db = state.db()?;
    db.revert_to_snapshot(id).await.map_err(|e| {
      let message = format!("{e:#}");
      if message.contains("No config snapshot") {
        CoreError::NotFound(format!("Snapshot {id}"))
      } else {
        CoreError::Persistence(message)
      }
    })
  }
  .await;
  respond(result)
}
