//! In-memory adapters and state builders for exercising the
//! checker, queue and orchestrator without a Docker engine.

use std::{
  collections::{HashMap, HashSet},
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
  time::Duration,
};

use async_trait::async_trait;
use docksmith_client::{
  entities::{docksmith_timestamp, update::Log},
  error::CoreError,
};
use store::DbClient;

use crate::{
  composefile::ComposeFile,
  docker::{
    COMPOSE_CONFIG_FILES_LABEL, COMPOSE_PROJECT_LABEL,
    COMPOSE_SERVICE_LABEL, DockerAdapter, DockerContainer,
    HealthState,
  },
  registry::RegistryAdapter,
  state::{AppState, Settings},
};

fn ok_log(stage: &str, command: String) -> Log {
  let now = docksmith_timestamp();
  Log {
    stage: stage.to_string(),
    command,
    success: true,
    start_ts: now,
    end_ts: now,
    ..Default::default()
  }
}

fn err_log(stage: &str, command: String, stderr: &str) -> Log {
  Log {
    stderr: stderr.to_string(),
    success: false,
    ..ok_log(stage, command)
  }
}

/// An engine simulated over real (temp) compose files: compose_up
/// reads the file on disk and "recreates" the container to the
/// declared image, like the real CLI would.
#[derive(Default)]
pub struct FakeDocker {
  pub containers: Mutex<HashMap<String, DockerContainer>>,
  /// Images whose pull fails.
  pub pull_failures: Mutex<HashSet<String>>,
  /// Health assigned to a container once it runs a given image.
  pub health_by_image: Mutex<HashMap<String, HealthState>>,
  /// Per-script exec outcomes; default success.
  pub exec_failures: Mutex<HashSet<String>>,
  /// Extra latency injected into compose_up.
  pub recreate_delay: Mutex<Duration>,
}

impl FakeDocker {
  pub fn add_compose_container(
    &self,
    name: &str,
    image: &str,
    project: &str,
    compose_file: &Path,
    service: &str,
    extra_labels: &[(&str, &str)],
  ) {
    let mut labels = HashMap::new();
    labels.insert(
      COMPOSE_PROJECT_LABEL.to_string(),
      project.to_string(),
    );
    labels.insert(
      COMPOSE_SERVICE_LABEL.to_string(),
      service.to_string(),
    );
    labels.insert(
      COMPOSE_CONFIG_FILES_LABEL.to_string(),
      compose_file.display().to_string(),
    );
    for (key, value) in extra_labels {
      labels.insert(key.to_string(), value.to_string());
    }
    let container = DockerContainer {
      id: format!("id-{name}"),
      name: name.to_string(),
      image: image.to_string(),
      image_id: format!("sha256:{name}-{image}"),
      labels,
      state: String::from("running"),
      health: self.health_for(image),
    };
    self.containers.lock().unwrap().insert(
      name.to_string(),
      container,
    );
  }

  fn health_for(&self, image: &str) -> HealthState {
    self
      .health_by_image
      .lock()
      .unwrap()
      .get(image)
      .copied()
      .unwrap_or(HealthState::Healthy)
  }

  pub fn running_image(&self, name: &str) -> Option<String> {
    self
      .containers
      .lock()
      .unwrap()
      .get(name)
      .map(|container| container.image.clone())
  }

  pub fn set_recreate_delay(&self, delay: Duration) {
    *self.recreate_delay.lock().unwrap() = delay;
  }
}

#[async_trait]
impl DockerAdapter for FakeDocker {
  async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<DockerContainer>> {
    Ok(
      self.containers.lock().unwrap().values().cloned().collect(),
    )
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<DockerContainer>> {
    Ok(self.containers.lock().unwrap().get(name).cloned())
  }

  async fn pull_image(&self, image: &str) -> Log {
    let command = format!("docker pull {image}");
    if self.pull_failures.lock().unwrap().contains(image) {
      err_log("Docker Pull", command, "manifest unknown")
    } else {
      ok_log("Docker Pull", command)
    }
  }

  async fn compose_up(
    &self,
    compose_file: &Path,
    project: &str,
    service: &str,
  ) -> Log {
    let delay = *self.recreate_delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    let command = format!(
      "docker compose -f {} -p {project} up -d \
       --force-recreate {service}",
      compose_file.display()
    );
    let file = match ComposeFile::load(compose_file).await {
      Ok(file) => file,
      Err(e) => {
        return err_log("Compose Up", command, &format!("{e:#}"));
      }
    };
    let Ok(Some(image)) = file.service_image(service) else {
      return err_log("Compose Up", command, "no such service");
    };
    let health = self.health_for(&image);
    let mut containers = self.containers.lock().unwrap();
    let target = containers.values_mut().find(|container| {
      container.labels.get(COMPOSE_PROJECT_LABEL)
        == Some(&project.to_string())
        && container.labels.get(COMPOSE_SERVICE_LABEL)
          == Some(&service.to_string())
    });
    match target {
      Some(container) => {
        container.image = image.clone();
        container.image_id =
          format!("sha256:{}-{image}", container.name);
        container.state = String::from("running");
        container.health = health;
        ok_log("Compose Up", command)
      }
      None => err_log("Compose Up", command, "no such container"),
    }
  }

  async fn restart_container(&self, name: &str) -> Log {
    let command = format!("docker restart {name}");
    let mut containers = self.containers.lock().unwrap();
    match containers.get_mut(name) {
      Some(container) => {
        container.state = String::from("running");
        ok_log("Docker Restart", command)
      }
      None => {
        err_log("Docker Restart", command, "No such container")
      }
    }
  }

  async fn start_container(&self, name: &str) -> Log {
    let command = format!("docker start {name}");
    let mut containers = self.containers.lock().unwrap();
    match containers.get_mut(name) {
      Some(container) => {
        container.state = String::from("running");
        ok_log("Docker Start", command)
      }
      None => err_log("Docker Start", command, "No such container"),
    }
  }

  async fn stop_container(
    &self,
    name: &str,
    _timeout: Option<i64>,
  ) -> Log {
    let command = format!("docker stop {name}");
    let mut containers = self.containers.lock().unwrap();
    match containers.get_mut(name) {
      Some(container) => {
        container.state = String::from("exited");
        ok_log("Docker Stop", command)
      }
      None => err_log("Docker Stop", command, "No such container"),
    }
  }

  async fn remove_container(
    &self,
    name: &str,
    _force: bool,
    _volumes: bool,
  ) -> Log {
    let command = format!("docker rm {name}");
    let removed =
      self.containers.lock().unwrap().remove(name).is_some();
    if removed {
      ok_log("Docker Remove", command)
    } else {
      err_log("Docker Remove", command, "No such container")
    }
  }

  async fn exec(&self, name: &str, command: &str) -> Log {
    let full = format!("docker exec {name} sh -c '{command}'");
    if self.exec_failures.lock().unwrap().contains(command) {
      err_log("Container Exec", full, "check failed")
    } else {
      ok_log("Container Exec", full)
    }
  }

  async fn health(&self, name: &str) -> anyhow::Result<HealthState> {
    self
      .containers
      .lock()
      .unwrap()
      .get(name)
      .map(|container| container.health)
      .ok_or_else(|| anyhow::anyhow!("No container named {name}"))
  }
}

/// Registry with fixed tag lists per repository.
#[derive(Default)]
pub struct FakeRegistry {
  pub tags: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeRegistry {
  pub fn set_tags(&self, image_ref: &str, tags: &[&str]) {
    self.tags.lock().unwrap().insert(
      image_ref.to_string(),
      tags.iter().map(|tag| tag.to_string()).collect(),
    );
  }
}

#[async_trait]
impl RegistryAdapter for FakeRegistry {
  async fn list_tags(
    &self,
    image_ref: &str,
  ) -> Result<Vec<String>, CoreError> {
    self
      .tags
      .lock()
      .unwrap()
      .get(image_ref)
      .cloned()
      .ok_or_else(|| {
        CoreError::NotFound(image_ref.to_string())
      })
  }

  async fn manifest_digest(
    &self,
    image_ref: &str,
    tag: &str,
    _architecture: &str,
  ) -> Result<String, CoreError> {
    Ok(format!("sha256:{image_ref}-{tag}"))
  }
}

pub struct TestHarness {
  pub state: Arc<AppState>,
  pub docker: Arc<FakeDocker>,
  pub registry: Arc<FakeRegistry>,
  pub dir: tempfile::TempDir,
}

impl TestHarness {
  pub async fn new() -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let db = DbClient::init(
      &dir.path().join("docksmith.db"),
      Duration::from_secs(3600),
    )
    .await
    .unwrap();
    let docker = Arc::new(FakeDocker::default());
    let registry = Arc::new(FakeRegistry::default());
    let state = Arc::new(AppState::new(
      Some(db),
      docker.clone(),
      registry.clone(),
      4,
      Settings {
        operation_timeout: Duration::from_secs(30),
        health_check_timeout: Duration::from_millis(500),
        health_poll_interval: Duration::from_millis(10),
        no_healthcheck_grace: Duration::from_millis(20),
        worker_idle: Duration::from_millis(200),
        ..Default::default()
      },
    ));
    TestHarness {
      state,
      docker,
      registry,
      dir,
    }
  }

  /// Write a single-service compose file and register its running
  /// container with the fake engine. Policy labels land both in
  /// the file and on the simulated container, like compose would.
  pub async fn add_service(
    &self,
    project: &str,
    service: &str,
    container_name: &str,
    image: &str,
    policy_labels: &[(&str, &str)],
  ) -> PathBuf {
    let path = self
      .dir
      .path()
      .join(format!("{project}-{service}-compose.yaml"));
    let mut raw = format!(
      "services:\n  {service}:\n    image: {image}\n    \
       container_name: {container_name}\n"
    );
    if !policy_labels.is_empty() {
      raw.push_str("    labels:\n");
      for (key, value) in policy_labels {
        raw.push_str(&format!("      - {key}={value}\n"));
      }
    }
    tokio::fs::write(&path, raw).await.unwrap();
    self.docker.add_compose_container(
      container_name,
      image,
      project,
      &path,
      service,
      policy_labels,
    );
    path
  }

  pub async fn compose_image(
    &self,
    path: &Path,
    service: &str,
  ) -> Option<String> {
    ComposeFile::load(path)
      .await
      .unwrap()
      .service_image(service)
      .unwrap()
  }
}
