use axum::Json;
use docksmith_client::{
  api::SetRollbackPolicyRequest,
  entities::policy::RollbackPolicy,
  error::CoreError,
};

use crate::{
  api::{ApiResult, respond, respond_any},
  state::app_state,
};

pub async fn list() -> ApiResult<Vec<RollbackPolicy>> {
  let state = app_state();
  let db = match state.db() {
    Ok(db) => db,
    Err(e) => return respond(Err(e)),
  };
  respond_any(db.list_rollback_policies().await)
}

pub async fn set(
  Json(request): Json<SetRollbackPolicyRequest>,
) -> ApiResult<RollbackPolicy> {
  let state = app_state();
  let result = async {
    let db = state.db()?;
    let policy = RollbackPolicy {
      entity_type: request.entity_type,
      entity_id: request.entity_id.clone(),
      auto_rollback_enabled: request.auto_rollback_enabled,
      health_check_required: request.health_check_required,
    };
    db.set_rollback_policy(&policy)
      .await
      .map_err(|e| CoreError::Persistence(format!("{e:#}")))?;
    db.get_rollback_policy(
      request.entity_type,
      request.entity_id.as_deref(),
    )
    .await
    .map_err(|e| CoreError::Persistence(format!("{e:#}")))?
    .ok_or_else(|| {
      CoreError::Persistence(String::from(
        "Policy vanished after upsert",
      ))
    })
  }
  .await;
  respond(result)
}
