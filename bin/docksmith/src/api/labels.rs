use std::collections::HashMap;

use axum::{Json, extract::Path};
use docksmith_client::{
  api::{BatchLabelRequest, RemoveLabelRequest, SetLabelRequest},
  entities::container::{labels, validate_label},
  error::CoreError,
};

use crate::{
  api::{ApiResult, respond},
  composefile::ComposeFile,
  orchestrator,
  state::{AppState, app_state},
};

struct LabelTarget {
  file: ComposeFile,
  service: String,
}

async fn target(
  state: &'static std::sync::Arc<AppState>,
  container_name: &str,
) -> Result<LabelTarget, CoreError> {
  let container =
    orchestrator::lookup_container(state, container_name).await?;
  if container.compose_file.is_empty() {
    return Err(CoreError::Validation(format!(
      "Container {container_name} is not managed by compose"
    )));
  }
  let file = ComposeFile::load(&container.compose_file)
    .await
    .map_err(CoreError::external)?;
  let service = if container.service.is_empty() {
    file
      .service_for_container(container_name, &container.stack)
      .map_err(CoreError::external)?
      .ok_or_else(|| {
        CoreError::NotFound(format!(
          "Service for {container_name}"
        ))
      })?
  } else {
    container.service.clone()
  };
  Ok(LabelTarget { file, service })
}

fn docksmith_labels(
  all: &HashMap<String, String>,
) -> HashMap<String, String> {
  all
    .iter()
    .filter(|(key, _)| key.starts_with(labels::PREFIX))
    .map(|(key, value)| (key.clone(), value.clone()))
    .collect()
}

/// Snapshot the current `docksmith.*` labels of a container so a
/// label change can be rolled back.
async fn snapshot_labels(
  state: &AppState,
  container_name: &str,
  current: &HashMap<String, String>,
) {
  let Ok(db) = state.db() else { return };
  if let Err(e) = db
    .save_config_snapshot(
      current,
      &format!("label-change-{container_name}"),
    )
    .await
  {
    warn!(
      "failed to snapshot labels for {container_name} | {e:#}"
    );
  }
}

pub async fn get_labels(
  Path(name): Path<String>,
) -> ApiResult<HashMap<String, String>> {
  let state = app_state();
  let result = async {
    let target = target(state, &name).await?;
    let all = target
      .file
      .service_labels(&target.service)
      .map_err(CoreError::external)?;
    Ok(docksmith_labels(&all))
  }
  .await;
  respond(result)
}

pub async fn set_label(
  Json(request): Json<SetLabelRequest>,
) -> ApiResult<&'static str> {
  respond(
    apply_labels(
      &request.container_name,
      vec![(request.label, Some(request.value))],
    )
    .await,
  )
}

pub async fn remove_label(
  Json(request): Json<RemoveLabelRequest>,
) -> ApiResult<&'static str> {
  respond(
    apply_labels(
      &request.container_name,
      vec![(request.label, None)],
    )
    .await,
  )
}

/// Apply several label writes to one container's compose service
/// in one file save.
async fn apply_labels(
  container_name: &str,
  changes: Vec<(String, Option<String>)>,
) -> Result<&'static str, CoreError> {
  let state = app_state();
  for (label, value) in &changes {
    validate_label(label, value.as_deref().unwrap_or_default())?;
  }
  let mut target = target(state, container_name).await?;
  let current = target
    .file
    .service_labels(&target.service)
    .map_err(CoreError::external)?;
  snapshot_labels(state, container_name, &docksmith_labels(&current))
    .await;
  for (label, value) in &changes {
    match value {
      Some(value) => target
        .file
        .set_service_label(&target.service, label, value)
        .map_err(CoreError::external)?,
      None => {
        target
          .file
          .remove_service_label(&target.service, label)
          .map_err(CoreError::external)?;
      }
    }
  }
  target.file.save().await.map_err(CoreError::external)?;
  Ok("labels updated")
}

pub async fn batch(
  Json(request): Json<BatchLabelRequest>,
) -> ApiResult<&'static str> {
  let result = async {
    // Group changes per container so each file saves once.
    let mut per_container: Vec<(
      String,
      Vec<(String, Option<String>)>,
    )> = Vec::new();
    for update in request.updates {
      match per_container
        .iter_mut()
        .find(|(name, _)| *name == update.container_name)
      {
        Some((_, changes)) => {
          changes.push((update.label, Some(update.value)))
        }
        None => per_container.push((
          update.container_name,
          vec![(update.label, Some(update.value))],
        )),
      }
    }
    for (container_name, changes) in per_container {
      apply_labels(&container_name, changes).await?;
    }
    Ok("labels updated")
  }
  .await;
  respond(result)
}

#[derive(serde::Deserialize)]
pub struct LabelRollbackRequest {
  container_name: String,
}

/// Restore a container's `docksmith.*` labels from the most
/// recent pre-change snapshot.
pub async fn rollback(
  Json(request): Json<LabelRollbackRequest>,
) -> ApiResult<&'static str> {
  let state = app_state();
  let result = async {
    let db = state.db()?;
    let marker =
      format!("label-change-{}", request.container_name);
    let snapshots = db
      .list_config_snapshots(500)
      .await
      .map_err(|e| CoreError::Persistence(format!("{e:#}")))?;
    let snapshot = snapshots
      .into_iter()
      .find(|snapshot| snapshot.changed_by == marker)
      .ok_or_else(|| {
        CoreError::NotFound(format!(
          "Label history for {}",
          request.container_name
        ))
      })?;

    let mut target =
      target(state, &request.container_name).await?;
    let current = target
      .file
      .service_labels(&target.service)
      .map_err(CoreError::external)?;
    for key in docksmith_labels(&current).keys() {
      if !snapshot.config_data.contains_key(key) {
        target
          .file
          .remove_service_label(&target.service, key)
          .map_err(CoreError::external)?;
      }
    }
    for (key, value) in &snapshot.config_data {
      target
        .file
        .set_service_label(&target.service, key, value)
        .map_err(CoreError::external)?;
    }
    target.file.save().await.map_err(CoreError::external)?;
    Ok("labels rolled back")
  }
  .await;
  respond(result)
}
