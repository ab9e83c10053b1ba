//! Discovery: enumerate containers, classify each against its
//! compose declaration and update policy, publish the result as an
//! atomic status view.

use std::{
  collections::HashMap, path::PathBuf, sync::Arc, time::Duration,
};

use anyhow::Context;
use docksmith_client::{
  entities::{
    container::{
      Container, ContainerStatus, UpdatePolicy, labels,
    },
    docksmith_timestamp, image_tag, split_image_ref,
    update::{CheckHistoryEntry, StatusView},
  },
  error::CoreError,
};
use futures::{StreamExt, stream::FuturesUnordered};
use tokio::sync::Semaphore;

use crate::{
  composefile::ComposeFile,
  docker::DockerContainer,
  state::AppState,
  version,
};

/// Run discovery on a period, and on demand via the state's
/// notify. Triggers arriving mid-cycle coalesce into one
/// follow-up cycle.
pub fn spawn_check_loop(state: Arc<AppState>, period: Duration) {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(
      tokio::time::MissedTickBehavior::Delay,
    );
    loop {
      tokio::select! {
        _ = ticker.tick() => {}
        _ = state.check_notify.notified() => {}
      }
      if let Err(e) = run_cycle(&state).await {
        error!("discovery cycle failed | {e:#}");
      }
    }
  });
}

/// Request a fresh cycle without waiting for it.
pub fn trigger(state: &AppState) {
  state.check_notify.notify_one();
}

/// One full discovery cycle. Docker enumeration failure aborts the
/// cycle and leaves the previous view visible; per-container
/// failures only mark that container.
pub async fn run_cycle(
  state: &Arc<AppState>,
) -> anyhow::Result<Arc<StatusView>> {
  let _cycle = state.check_lock.lock().await;

  let raw = state
    .docker
    .list_containers()
    .await
    .context("Failed to enumerate containers")?;

  // Load each stack's compose file once per cycle.
  let mut compose_files: HashMap<PathBuf, Option<ComposeFile>> =
    HashMap::new();
  for container in &raw {
    if let Some(file) = container.compose_file() {
      let path = PathBuf::from(file);
      if !compose_files.contains_key(&path) {
        let loaded = match ComposeFile::load(&path).await {
          Ok(file) => Some(file),
          Err(e) => {
            warn!("failed to load compose file {path:?} | {e:#}");
            None
          }
        };
        compose_files.insert(path, loaded);
      }
    }
  }
  let compose_files = Arc::new(compose_files);

  let limiter =
    Arc::new(Semaphore::new(state.settings.check_concurrency));
  let mut checks = FuturesUnordered::new();
  for container in raw {
    let state = state.clone();
    let compose_files = compose_files.clone();
    let limiter = limiter.clone();
    checks.push(async move {
      let _permit = limiter.acquire().await;
      check_container(&state, &compose_files, container).await
    });
  }
  let mut containers = Vec::new();
  while let Some(container) = checks.next().await {
    containers.push(container);
  }
  containers.sort_by(|a, b| a.name.cmp(&b.name));

  let view = Arc::new(StatusView {
    checked_at: docksmith_timestamp(),
    containers,
  });

  if let Some(db) = &state.db {
    let entries: Vec<CheckHistoryEntry> = view
      .containers
      .iter()
      .map(|container| CheckHistoryEntry {
        id: 0,
        container_name: container.name.clone(),
        image: container.image.clone(),
        check_time: view.checked_at,
        current_version: container.running_version.clone(),
        latest_version: container.latest_version.clone(),
        status: container.status,
        error: container.error.clone(),
      })
      .collect();
    if let Err(e) = db.log_check_batch(&entries).await {
      warn!("failed to persist check history | {e:#}");
    }
  }

  state.status.store(view.clone());
  info!(
    "discovery cycle complete | {} containers",
    view.containers.len()
  );
  Ok(view)
}

/// Synchronous single-container recheck. The published view is
/// patched in place with the fresh entry.
pub async fn check_one(
  state: &Arc<AppState>,
  name: &str,
) -> Result<Container, CoreError> {
  let raw = state
    .docker
    .inspect_container(name)
    .await
    .map_err(CoreError::external)?
    .ok_or_else(|| CoreError::NotFound(format!("Container {name}")))?;

  let mut compose_files = HashMap::new();
  if let Some(file) = raw.compose_file() {
    let path = PathBuf::from(file);
    let loaded = ComposeFile::load(&path).await.ok();
    compose_files.insert(path, loaded);
  }
  let container =
    check_container(state, &compose_files, raw).await;

  let previous = state.status.load_full();
  let mut containers = previous.containers.clone();
  match containers
    .iter_mut()
    .find(|existing| existing.name == container.name)
  {
    Some(existing) => *existing = container.clone(),
    None => containers.push(container.clone()),
  }
  containers.sort_by(|a, b| a.name.cmp(&b.name));
  state.status.store(Arc::new(StatusView {
    checked_at: previous.checked_at,
    containers,
  }));

  Ok(container)
}

/// Classify one container. Registry errors taint only this
/// container.
pub async fn check_container(
  state: &Arc<AppState>,
  compose_files: &HashMap<PathBuf, Option<ComposeFile>>,
  raw: DockerContainer,
) -> Container {
  let stack = raw
    .compose_project()
    .map(str::to_string)
    .unwrap_or_else(|| raw.name.clone());
  let service = raw
    .compose_service()
    .map(str::to_string)
    .unwrap_or_default();
  let compose_path = raw
    .compose_file()
    .map(PathBuf::from)
    .unwrap_or_default();

  let mut container = Container {
    name: raw.name.clone(),
    id: raw.id.clone(),
    image: raw.image.clone(),
    stack,
    compose_file: compose_path.display().to_string(),
    service: service.clone(),
    running_version: image_tag(&raw.image).unwrap_or_default(),
    labels: raw.labels.clone(),
    ..Default::default()
  };

  // Effective policy: compose labels overlaid by any stored
  // assignment; labels seen for the first time migrate into the
  // assignment table.
  let mut policy = UpdatePolicy::from_labels(&raw.labels);
  if let Some(db) = &state.db {
    match db.get_script_assignment(&raw.name).await {
      Ok(Some(assignment)) => {
        policy.apply_assignment(&assignment)
      }
      Ok(None) => {
        maybe_migrate_labels(state, &raw, &policy).await;
      }
      Err(e) => {
        warn!(
          "failed to load script assignment for {} | {e:#}",
          raw.name
        );
      }
    }
  }

  if policy.ignore {
    container.status = ContainerStatus::Ignored;
    return container;
  }

  let compose_file = compose_files
    .get(&compose_path)
    .and_then(|loaded| loaded.as_ref());
  if let Some(file) = compose_file {
    match file.service_tag(&service) {
      Ok(Some(declared)) => {
        container.declared_version = declared;
      }
      Ok(None) => {}
      Err(e) => {
        warn!("compose parse failed for {} | {e:#}", raw.name);
      }
    }
  }

  // A bare digest reference, or tag drift against the compose
  // declaration, is a mismatch before any registry traffic.
  let bare_digest = raw.image.contains('@');
  if bare_digest
    || (!container.declared_version.is_empty()
      && normalize_tag(&container.declared_version)
        != normalize_tag(&container.running_version))
  {
    container.status = ContainerStatus::ComposeMismatch;
    return container;
  }

  let (repository, _) = split_image_ref(&raw.image);
  match version::resolve(
    state.registry.as_ref(),
    state.db.as_ref(),
    &repository,
    &raw.image_id,
    &state.settings.architecture,
    &container.running_version,
    &policy,
  )
  .await
  {
    Ok(resolution) => {
      if resolution.latest != container.running_version {
        container.status = ContainerStatus::UpdateAvailable;
        container.latest_version = Some(resolution.latest);
        container.change_type = resolution.change_type;
      } else if resolution.blocked.is_some() {
        container.status =
          ContainerStatus::UpdateAvailableBlocked;
        container.latest_version = resolution.blocked;
      } else if resolution.pinnable {
        container.status = ContainerStatus::UpToDatePinnable;
        container.latest_version =
          Some(container.running_version.clone());
      } else {
        container.status = ContainerStatus::UpToDate;
        container.latest_version =
          Some(container.running_version.clone());
      }
    }
    Err(CoreError::NotFound(_)) => {
      container.status = ContainerStatus::LocalImage;
    }
    Err(e) => {
      container.status = ContainerStatus::Error;
      container.error = Some(e.to_string());
    }
  }
  container
}

/// First sight of `docksmith.*` labels with no assignment row:
/// mirror them into the database so the API can mutate policy
/// without compose edits.
async fn maybe_migrate_labels(
  state: &Arc<AppState>,
  raw: &DockerContainer,
  policy: &UpdatePolicy,
) {
  let has_policy_labels = raw
    .labels
    .keys()
    .any(|key| key.starts_with(labels::PREFIX));
  if !has_policy_labels {
    return;
  }
  let Some(db) = &state.db else { return };
  let assignment =
    docksmith_client::entities::policy::ScriptAssignment {
      container_name: raw.name.clone(),
      script_path: policy.pre_update_check.clone(),
      enabled: true,
      ignore: policy.ignore,
      allow_latest: policy.allow_latest,
      assigned_by: String::from("label-migration"),
      assigned_at: 0,
      updated_at: 0,
    };
  if let Err(e) = db.upsert_script_assignment(&assignment).await {
    warn!(
      "failed to migrate labels for {} | {e:#}",
      raw.name
    );
  }
}

fn normalize_tag(tag: &str) -> &str {
  tag.trim().trim_start_matches(['v', 'V'])
}

/// Containers of one stack from the published view, in
/// compose-declared dependency order where resolvable.
pub async fn stack_containers(
  state: &Arc<AppState>,
  stack: &str,
) -> Vec<Container> {
  let view = state.status.load_full();
  let mut containers: Vec<Container> = view
    .containers
    .iter()
    .filter(|container| container.stack == stack)
    .cloned()
    .collect();
  if containers.is_empty() {
    return containers;
  }
  let compose_path =
    PathBuf::from(&containers[0].compose_file);
  if let Ok(file) = ComposeFile::load(&compose_path).await {
    sort_by_dependencies(&mut containers, &file);
  }
  containers
}

/// Topological-ish order: dependencies before dependents. Falls
/// back to the incoming order on cycles.
pub fn sort_by_dependencies(
  containers: &mut [Container],
  file: &ComposeFile,
) {
  let mut ranks: HashMap<String, usize> = HashMap::new();
  for container in containers.iter() {
    let rank = dependency_depth(
      file,
      &container.service,
      &mut Vec::new(),
    );
    ranks.insert(container.name.clone(), rank);
  }
  containers.sort_by_key(|container| {
    ranks.get(&container.name).copied().unwrap_or(0)
  });
}

fn dependency_depth(
  file: &ComposeFile,
  service: &str,
  seen: &mut Vec<String>,
) -> usize {
  if seen.iter().any(|s| s == service) {
    return 0;
  }
  seen.push(service.to_string());
  let depends = file.depends_on(service).unwrap_or_default();
  depends
    .iter()
    .map(|dep| dependency_depth(file, dep, seen) + 1)
    .max()
    .unwrap_or(0)
}
