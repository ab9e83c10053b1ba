use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use command::run_docksmith_command;
use docksmith_client::entities::update::Log;
use serde::Deserialize;

/// Compose metadata labels stamped by `docker compose`.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_CONFIG_FILES_LABEL: &str =
  "com.docker.compose.project.config_files";

/// A container as the engine reports it.
#[derive(Debug, Clone, Default)]
pub struct DockerContainer {
  pub id: String,
  pub name: String,
  /// The image reference the container was created from.
  pub image: String,
  /// The image id (sha256) actually running.
  pub image_id: String,
  pub labels: HashMap<String, String>,
  /// running / exited / paused / ...
  pub state: String,
  pub health: HealthState,
}

impl DockerContainer {
  pub fn compose_project(&self) -> Option<&str> {
    self
      .labels
      .get(COMPOSE_PROJECT_LABEL)
      .map(String::as_str)
      .filter(|p| !p.is_empty())
  }

  pub fn compose_service(&self) -> Option<&str> {
    self
      .labels
      .get(COMPOSE_SERVICE_LABEL)
      .map(String::as_str)
      .filter(|s| !s.is_empty())
  }

  pub fn compose_file(&self) -> Option<&str> {
    // Multiple config files come comma separated; the first is the
    // project's primary compose file.
    self
      .labels
      .get(COMPOSE_CONFIG_FILES_LABEL)
      .and_then(|files| files.split(',').next())
      .filter(|f| !f.is_empty())
  }

  pub fn is_running(&self) -> bool {
    self.state == "running"
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthState {
  /// Container declares no healthcheck.
  #[default]
  None,
  Starting,
  Healthy,
  Unhealthy,
}

/// The engine boundary the core drives. Production shells out to
/// the docker CLI; tests swap in an in-memory fake.
#[async_trait]
pub trait DockerAdapter: Send + Sync {
  async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<DockerContainer>>;

  async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<DockerContainer>>;

  async fn pull_image(&self, image: &str) -> Log;

  /// `docker compose up -d --force-recreate` for one service.
  async fn compose_up(
    &self,
    compose_file: &Path,
    project: &str,
    service: &str,
  ) -> Log;

  async fn restart_container(&self, name: &str) -> Log;

  async fn start_container(&self, name: &str) -> Log;

  async fn stop_container(
    &self,
    name: &str,
    timeout: Option<i64>,
  ) -> Log;

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
    volumes: bool,
  ) -> Log;

  /// Run a command inside the container (pre-update checks).
  async fn exec(&self, name: &str, command: &str) -> Log;

  async fn health(&self, name: &str) -> anyhow::Result<HealthState>;
}

/// CLI-backed adapter. One `docker inspect` gives name, image,
/// labels and health in a single parse.
#[derive(Default)]
pub struct CliDocker {}

#[async_trait]
impl DockerAdapter for CliDocker {
  async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<DockerContainer>> {
    let ids =
      run_docksmith_command("List Containers", "docker ps -aq")
        .await;
    if !ids.success {
      return Err(anyhow::anyhow!(
        "docker ps failed: {}",
        ids.stderr
      ));
    }
    let ids: Vec<&str> = ids
      .stdout
      .split_whitespace()
      .filter(|id| !id.is_empty())
      .collect();
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let inspect = run_docksmith_command(
      "Inspect Containers",
      format!("docker inspect {}", ids.join(" ")),
    )
    .await;
    if !inspect.success {
      return Err(anyhow::anyhow!(
        "docker inspect failed: {}",
        inspect.stderr
      ));
    }
    let raw: Vec<InspectedContainer> =
      serde_json::from_str(&inspect.stdout)
        .context("Failed to parse docker inspect output")?;
    Ok(raw.into_iter().map(Into::into).collect())
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<DockerContainer>> {
    let inspect = run_docksmith_command(
      "Inspect Container",
      format!("docker inspect {name}"),
    )
    .await;
    if !inspect.success {
      if inspect.stderr.contains("No such") {
        return Ok(None);
      }
      return Err(anyhow::anyhow!(
        "docker inspect {name} failed: {}",
        inspect.stderr
      ));
    }
    let mut raw: Vec<InspectedContainer> =
      serde_json::from_str(&inspect.stdout)
        .context("Failed to parse docker inspect output")?;
    Ok(raw.pop().map(Into::into))
  }

  async fn pull_image(&self, image: &str) -> Log {
    run_docksmith_command(
      "Docker Pull",
      format!("docker pull {image}"),
    )
    .await
  }

  async fn compose_up(
    &self,
    compose_file: &Path,
    project: &str,
    service: &str,
  ) -> Log {
    run_docksmith_command(
      "Compose Up",
      format!(
        "docker compose -f {} -p {project} up -d \
         --force-recreate {service}",
        compose_file.display()
      ),
    )
    .await
  }

  async fn restart_container(&self, name: &str) -> Log {
    run_docksmith_command(
      "Docker Restart",
      format!("docker restart {name}"),
    )
    .await
  }

  async fn start_container(&self, name: &str) -> Log {
    run_docksmith_command(
      "Docker Start",
      format!("docker start {name}"),
    )
    .await
  }

  async fn stop_container(
    &self,
    name: &str,
    timeout: Option<i64>,
  ) -> Log {
    let time = timeout
      .map(|time| format!(" --time {time}"))
      .unwrap_or_default();
    run_docksmith_command(
      "Docker Stop",
      format!("docker stop{time} {name}"),
    )
    .await
  }

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
    volumes: bool,
  ) -> Log {
    let force = if force { " -f" } else { "" };
    let volumes = if volumes { " -v" } else { "" };
    run_docksmith_command(
      "Docker Remove",
      format!("docker rm{force}{volumes} {name}"),
    )
    .await
  }

  async fn exec(&self, name: &str, command: &str) -> Log {
    let escaped = command.replace('\'', "'\\''");
    run_docksmith_command(
      "Container Exec",
      format!("docker exec {name} sh -c '{escaped}'"),
    )
    .await
  }

  async fn health(&self, name: &str) -> anyhow::Result<HealthState> {
    let container = self
      .inspect_container(name)
      .await?
      .with_context(|| format!("No container named {name}"))?;
    Ok(container.health)
  }
}

/// Subset of `docker inspect` output the core needs.
#[derive(Deserialize)]
struct InspectedContainer {
  #[serde(rename = "Id")]
  id: String,
  #[serde(rename = "Name")]
  name: String,
  #[serde(rename = "Image")]
  image_id: String,
  #[serde(rename = "Config")]
  config: InspectedConfig,
  #[serde(rename = "State")]
  state: InspectedState,
}

#[derive(Deserialize)]
struct InspectedConfig {
  #[serde(rename = "Image")]
  image: String,
  #[serde(rename = "Labels", default)]
  labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct InspectedState {
  #[serde(rename = "Status", default)]
  status: String,
  #[serde(rename = "Health")]
  health: Option<InspectedHealth>,
}

#[derive(Deserialize)]
struct InspectedHealth {
  #[serde(rename = "Status", default)]
  status: String,
}

impl From<InspectedContainer> for DockerContainer {
  fn from(raw: InspectedContainer) -> DockerContainer {
    let health = match raw.state.health.map(|h| h.status) {
      Some(status) if status == "healthy" => HealthState::Healthy,
      Some(status) if status == "unhealthy" => {
        HealthState::Unhealthy
      }
      Some(status) if status == "starting" => HealthState::Starting,
      _ => HealthState::None,
    };
    DockerContainer {
      id: raw.id,
      // Docker prefixes names with '/'.
      name: raw.name.trim_start_matches('/').to_string(),
      image: raw.config.image,
      image_id: raw.image_id,
      labels: raw.config.labels.unwrap_or_default(),
      state: raw.state.status,
      health,
    }
  }
}
