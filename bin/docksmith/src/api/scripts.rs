use axum::{Json, extract::Path};
use docksmith_client::{
  api::AssignScriptRequest,
  entities::policy::ScriptAssignment,
  error::CoreError,
};

use crate::{
  api::{ApiResult, respond, respond_any},
  config::core_config,
  state::app_state,
};

/// Scripts available for assignment: files in the scripts dir.
pub async fn list() -> ApiResult<Vec<String>> {
  let dir = &core_config().scripts_dir;
  let result = async {
    let mut scripts = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
      Ok(entries) => entries,
      // A missing directory just means no scripts yet.
      Err(_) => return Ok(scripts),
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
      if entry
        .file_type()
        .await
        .map(|kind| kind.is_file())
        .unwrap_or(false)
      {
        scripts.push(entry.path().display().to_string());
      }
    }
    scripts.sort();
    Ok(scripts)
  }
  .await;
  respond(result)
}

pub async fn assigned() -> ApiResult<Vec<ScriptAssignment>> {
  let state = app_state();
  let db = match state.db() {
    Ok(db) => db,
    Err(e) => return respond(Err(e)),
  };
  respond_any(db.list_script_assignments().await)
}

pub async fn assign(
  Json(request): Json<AssignScriptRequest>,
) -> ApiResult<ScriptAssignment> {
  let state = app_state();
  let result = async {
    if request.container_name.trim().is_empty() {
      return Err(CoreError::Validation(String::from(
        "container_name is required",
      )));
    }
    let db = state.db()?;
    let assignment = ScriptAssignment {
      container_name: request.container_name.clone(),
      script_path: request.script_path.clone(),
      enabled: request.enabled,
      ignore: request.ignore,
      allow_latest: request.allow_latest,
      assigned_by: request.assigned_by.clone(),
      assigned_at: 0,
      updated_at: 0,
    };
    db.upsert_script_assignment(&assignment)
      .await
      .map_err(|e| CoreError::Persistence(format!("{e:#}")))?;
    db.get_script_assignment(&request.container_name)
      .await
      .map_err(|e| CoreError::Persistence(format!("{e:#}")))?
      .ok_or_else(|| {
        CoreError::Persistence(String::from(
          "Assignment vanished after upsert",
        ))
      })
  }
  .await;
  respond(result)
}

pub async fn unassign(
  Path(name): Path<String>,
) -> ApiResult<bool> {
  let state = app_state();
  let result = async {
    let db = state.db()?;
    let removed = db
      .delete_script_assignment(&name)
      .await
      .map_err(|e| CoreError::Persistence(format!("{e:#}")))?;
    if !removed {
      return Err(CoreError::NotFound(format!(
        "Assignment for {name}"
      )));
    }
    Ok(true)
  }
  .await;
  respond(result)
}
