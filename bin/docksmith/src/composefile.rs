//! Compose file access for the orchestrator and checker.
//!
//! Reads go through a YAML parse; writes are line-level splices so
//! comments, ordering and quoting elsewhere in the file survive.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use anyhow::Context;
use docksmith_client::entities::split_image_ref;

#[derive(Debug, Clone)]
pub struct ComposeFile {
  path: PathBuf,
  raw: String,
}

impl ComposeFile {
  pub async fn load(
    path: impl Into<PathBuf>,
  ) -> anyhow::Result<ComposeFile> {
    let path = path.into();
    let raw =
      tokio::fs::read_to_string(&path).await.with_context(|| {
        format!("Failed to read compose file {path:?}")
      })?;
    Ok(ComposeFile { path, raw })
  }

  pub fn from_string(
    path: impl Into<PathBuf>,
    raw: impl Into<String>,
  ) -> ComposeFile {
    ComposeFile {
      path: path.into(),
      raw: raw.into(),
    }
  }

  pub fn contents(&self) -> &str {
    &self.raw
  }

  pub async fn save(&self) -> anyhow::Result<()> {
    tokio::fs::write(&self.path, &self.raw)
      .await
      .with_context(|| {
        format!("Failed to write compose file {:?}", self.path)
      })
  }

  /// Overwrite a compose file with snapshotted content (rollback).
  pub async fn restore(
    path: &Path,
    content: &str,
  ) -> anyhow::Result<()> {
    tokio::fs::write(path, content).await.with_context(|| {
      format!("Failed to restore compose file {path:?}")
    })
  }

  fn parsed(&self) -> anyhow::Result<serde_yaml_ng::Value> {
    serde_yaml_ng::from_str(&self.raw).with_context(|| {
      format!("Invalid YAML in compose file {:?}", self.path)
    })
  }

  fn service_value(
    &self,
    service: &str,
  ) -> anyhow::Result<Option<serde_yaml_ng::Value>> {
    let parsed = self.parsed()?;
    Ok(
      parsed
        .get("services")
        .and_then(|services| services.get(service))
        .cloned(),
    )
  }

  /// The `image:` reference a service declares.
  pub fn service_image(
    &self,
    service: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(
      self
        .service_value(service)?
        .and_then(|s| s.get("image").cloned())
        .and_then(|image| {
          image.as_str().map(str::to_string)
        }),
    )
  }

  /// Declared tag of a service, `latest` when the reference has
  /// none.
  pub fn service_tag(
    &self,
    service: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(self.service_image(service)?.map(|image| {
      split_image_ref(&image)
        .1
        .unwrap_or_else(|| String::from("latest"))
    }))
  }

  /// Find the service whose explicit `container_name:` matches, or
  /// whose default compose name (`<project>-<service>-1`) does.
  pub fn service_for_container(
    &self,
    container_name: &str,
    project: &str,
  ) -> anyhow::Result<Option<String>> {
    let parsed = self.parsed()?;
    let Some(services) =
      parsed.get("services").and_then(|s| s.as_mapping())
    else {
      return Ok(None);
    };
    for (name, body) in services {
      let Some(service) = name.as_str() else { continue };
      if let Some(explicit) =
        body.get("container_name").and_then(|v| v.as_str())
      {
        if explicit == container_name {
          return Ok(Some(service.to_string()));
        }
        continue;
      }
      let dashed = format!("{project}-{service}-1");
      let underscored = format!("{project}_{service}_1");
      if container_name == dashed || container_name == underscored {
        return Ok(Some(service.to_string()));
      }
    }
    Ok(None)
  }

  /// Service names this service depends on, list or map form.
  pub fn depends_on(
    &self,
    service: &str,
  ) -> anyhow::Result<Vec<String>> {
    let Some(value) = self.service_value(service)? else {
      return Ok(Vec::new());
    };
    let Some(depends) = value.get("depends_on") else {
      return Ok(Vec::new());
    };
    let mut names = Vec::new();
    if let Some(list) = depends.as_sequence() {
      for item in list {
        if let Some(name) = item.as_str() {
          names.push(name.to_string());
        }
      }
    } else if let Some(map) = depends.as_mapping() {
      for (name, _) in map {
        if let Some(name) = name.as_str() {
          names.push(name.to_string());
        }
      }
    }
    Ok(names)
  }

  /// Labels declared on a service, list (`- k=v`) or map form.
  pub fn service_labels(
    &self,
    service: &str,
  ) -> anyhow::Result<HashMap<String, String>> {
    let mut labels = HashMap::new();
    let Some(value) = self.service_value(service)? else {
      return Ok(labels);
    };
    let Some(declared) = value.get("labels") else {
      return Ok(labels);
    };
    if let Some(list) = declared.as_sequence() {
      for item in list {
        if let Some(entry) = item.as_str() {
          match entry.split_once('=') {
            Some((key, val)) => {
              labels.insert(key.to_string(), val.to_string());
            }
            None => {
              labels.insert(entry.to_string(), String::new());
            }
          }
        }
      }
    } else if let Some(map) = declared.as_mapping() {
      for (key, val) in map {
        let Some(key) = key.as_str() else { continue };
        let value = match val {
          serde_yaml_ng::Value::String(s) => s.clone(),
          serde_yaml_ng::Value::Bool(b) => b.to_string(),
          serde_yaml_ng::Value::Number(n) => n.to_string(),
          _ => String::new(),
        };
        labels.insert(key.to_string(), value);
      }
    }
    Ok(labels)
  }

  /// Replace the `image:` value of a service in place, preserving
  /// indentation, quoting style and any trailing comment.
  pub fn set_service_image(
    &mut self,
    service: &str,
    new_image: &str,
  ) -> anyhow::Result<()> {
    let (start, end) =
      self.service_block(service).with_context(|| {
        format!("No service {service} in {:?}", self.path)
      })?;
    let mut lines: Vec<String> =
      self.raw.lines().map(str::to_string).collect();
    for index in start..end.min(lines.len()) {
      let rebuilt = {
        let line = &lines[index];
        let trimmed = line.trim_start();
        if !trimmed.starts_with("image:") {
          continue;
        }
        let indent = line_indent(line);
        let value = trimmed["image:".len()..].trim_start();
        let (quote, comment) = split_value(value);
        format!("{indent}image: {quote}{new_image}{quote}{comment}")
      };
      lines[index] = rebuilt;
      self.raw = rejoin(lines, &self.raw);
      return Ok(());
    }
    anyhow::bail!(
      "Service {service} has no image field in {:?}",
      self.path
    )
  }

  /// Set a label on a service, editing the existing entry when
  /// present, appending to the labels block otherwise. A missing
  /// labels block is created at the end of the service.
  pub fn set_service_label(
    &mut self,
    service: &str,
    key: &str,
    value: &str,
  ) -> anyhow::Result<()> {
    let (start, end) =
      self.service_block(service).with_context(|| {
        format!("No service {service} in {:?}", self.path)
      })?;
    let mut lines: Vec<String> =
      self.raw.lines().map(str::to_string).collect();

    let Some(labels_at) = find_labels_line(&lines, start, end)
    else {
      // Create the block at the end of the service.
      let indent = child_indent(&lines, start);
      lines.insert(end, format!("{indent}labels:"));
      lines
        .insert(end + 1, format!("{indent}  - {key}={value}"));
      self.raw = rejoin(lines, &self.raw);
      return Ok(());
    };

    let entry_indent =
      format!("{}  ", line_indent(&lines[labels_at]));
    let block_end = labels_block_end(&lines, labels_at, end);
    let list_style = (labels_at + 1..block_end).any(|i| {
      lines[i].trim_start().starts_with('-')
    });

    let existing = (labels_at + 1..block_end).find(|&index| {
      let trimmed = lines[index].trim_start();
      if list_style {
        trimmed
          .strip_prefix('-')
          .map(|entry| entry.trim_start())
          .and_then(|entry| entry.strip_prefix(key))
          .map(|rest| {
            rest.starts_with('=')
              || rest.trim_start().starts_with('=')
              || rest.is_empty()
          })
          .unwrap_or(false)
      } else {
        trimmed
          .strip_prefix(key)
          .map(|rest| rest.trim_start().starts_with(':'))
          .unwrap_or(false)
      }
    });
    if let Some(index) = existing {
      let indent = line_indent(&lines[index]).to_string();
      lines[index] = if list_style {
        format!("{indent}- {key}={value}")
      } else {
        format!("{indent}{key}: {value}")
      };
      self.raw = rejoin(lines, &self.raw);
      return Ok(());
    }

    let inserted = if list_style || block_end == labels_at + 1 {
      format!("{entry_indent}- {key}={value}")
    } else {
      format!("{entry_indent}{key}: {value}")
    };
    lines.insert(block_end, inserted);
    self.raw = rejoin(lines, &self.raw);
    Ok(())
  }

  /// Remove a label from a service. Returns whether an entry was
  /// actually removed.
  pub fn remove_service_label(
    &mut self,
    service: &str,
    key: &str,
  ) -> anyhow::Result<bool> {
    let (start, end) =
      self.service_block(service).with_context(|| {
        format!("No service {service} in {:?}", self.path)
      })?;
    let mut lines: Vec<String> =
      self.raw.lines().map(str::to_string).collect();
    let Some(labels_at) = find_labels_line(&lines, start, end)
    else {
      return Ok(false);
    };
    let block_end = labels_block_end(&lines, labels_at, end);
    for index in labels_at + 1..block_end {
      let trimmed = lines[index].trim_start();
      let entry = trimmed
        .strip_prefix('-')
        .map(|entry| entry.trim_start())
        .unwrap_or(trimmed);
      let matches = entry
        .strip_prefix(key)
        .map(|rest| {
          rest.is_empty()
            || rest.starts_with('=')
            || rest.trim_start().starts_with(':')
            || rest.trim_start().starts_with('=')
        })
        .unwrap_or(false);
      if matches {
        lines.remove(index);
        // Drop an empty labels block entirely.
        if labels_block_end(&lines, labels_at, end - 1)
          == labels_at + 1
        {
          lines.remove(labels_at);
        }
        self.raw = rejoin(lines, &self.raw);
        return Ok(true);
      }
    }
    Ok(false)
  }

  /// Line span `[start, end)` of a service's body under
  /// `services:`, not counting the `  <service>:` line itself for
  /// `start` (it is `start - 1`).
  fn service_block(
    &self,
    service: &str,
  ) -> Option<(usize, usize)> {
    let lines: Vec<&str> = self.raw.lines().collect();
    let services_at = lines.iter().position(|line| {
      line.trim_end() == "services:"
    })?;
    let mut service_at = None;
    let mut service_indent = 0;
    for (offset, line) in
      lines.iter().enumerate().skip(services_at + 1)
    {
      let trimmed = line.trim_start();
      if trimmed.is_empty() || trimmed.starts_with('#') {
        continue;
      }
      let indent = line.len() - trimmed.len();
      if indent == 0 {
        // Left the services mapping.
        break;
      }
      if trimmed == format!("{service}:") {
        service_at = Some(offset);
        service_indent = indent;
        break;
      }
    }
    let service_at = service_at?;
    let mut end = lines.len();
    for (offset, line) in
      lines.iter().enumerate().skip(service_at + 1)
    {
      let trimmed = line.trim_start();
      if trimmed.is_empty() || trimmed.starts_with('#') {
        continue;
      }
      let indent = line.len() - trimmed.len();
      if indent <= service_indent {
        end = offset;
        break;
      }
    }
    Some((service_at + 1, end))
  }
}

fn line_indent(line: &str) -> &str {
  &line[..line.len() - line.trim_start().len()]
}

/// First-level child indent for a service body.
fn child_indent(lines: &[String], body_start: usize) -> String {
  lines
    .get(body_start)
    .map(|line| line_indent(line).to_string())
    .unwrap_or_else(|| String::from("    "))
}

fn find_labels_line(
  lines: &[String],
  start: usize,
  end: usize,
) -> Option<usize> {
  (start..end.min(lines.len()))
    .find(|&i| lines[i].trim() == "labels:")
}

fn labels_block_end(
  lines: &[String],
  labels_at: usize,
  service_end: usize,
) -> usize {
  let labels_indent = {
    let line = &lines[labels_at];
    line.len() - line.trim_start().len()
  };
  for index in labels_at + 1..service_end.min(lines.len()) {
    let line = &lines[index];
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
      continue;
    }
    let indent = line.len() - trimmed.len();
    if indent <= labels_indent {
      return index;
    }
  }
  service_end.min(lines.len())
}

/// Split an image value into its quote character (if any) and a
/// trailing comment (if any).
fn split_value(value: &str) -> (String, String) {
  let quote = match value.chars().next() {
    Some('"') => String::from("\""),
    Some('\'') => String::from("'"),
    _ => String::new(),
  };
  let comment = match value.find('#') {
    Some(hash) => {
      let head = value[..hash].trim_end().len();
      value[head..].to_string()
    }
    None => String::new(),
  };
  (quote, comment)
}

/// Reassemble lines, keeping the original trailing newline state.
fn rejoin(lines: Vec<String>, original: &str) -> String {
  let mut raw = lines.join("\n");
  if original.ends_with('\n') {
    raw.push('\n');
  }
  raw
}

#[cfg(test)]
mod tests {
  use super::*;

  const COMPOSE: &str = "\
# frontend stack
services:
  web:
    image: nginx:1.24.0  # pinned
    container_name: web
    labels:
      - docksmith.version-pin-minor=true
    depends_on:
      - cache
  cache:
    image: \"redis:7.2.3\"
    labels:
      docksmith.ignore: \"true\"

networks:
  default: {}
";

  fn compose() -> ComposeFile {
    ComposeFile::from_string("/tmp/compose.yaml", COMPOSE)
  }

  #[test]
  fn reads_images_and_tags() {
    let file = compose();
    assert_eq!(
      file.service_image("web").unwrap().as_deref(),
      Some("nginx:1.24.0")
    );
    assert_eq!(
      file.service_tag("web").unwrap().as_deref(),
      Some("1.24.0")
    );
    assert_eq!(
      file.service_image("cache").unwrap().as_deref(),
      Some("redis:7.2.3")
    );
    assert_eq!(file.service_image("missing").unwrap(), None);
  }

  #[test]
  fn reads_labels_in_both_styles() {
    let file = compose();
    let web = file.service_labels("web").unwrap();
    assert_eq!(
      web.get("docksmith.version-pin-minor").map(String::as_str),
      Some("true")
    );
    let cache = file.service_labels("cache").unwrap();
    assert_eq!(
      cache.get("docksmith.ignore").map(String::as_str),
      Some("true")
    );
  }

  #[test]
  fn reads_depends_on() {
    let file = compose();
    assert_eq!(file.depends_on("web").unwrap(), vec!["cache"]);
    assert!(file.depends_on("cache").unwrap().is_empty());
  }

  #[test]
  fn finds_service_by_container_name() {
    let file = compose();
    assert_eq!(
      file
        .service_for_container("web", "frontend")
        .unwrap()
        .as_deref(),
      Some("web")
    );
    // Default compose naming for services without container_name.
    assert_eq!(
      file
        .service_for_container("frontend-cache-1", "frontend")
        .unwrap()
        .as_deref(),
      Some("cache")
    );
    assert_eq!(
      file.service_for_container("other", "frontend").unwrap(),
      None
    );
  }

  #[test]
  fn image_edit_preserves_comments_and_quotes() {
    let mut file = compose();
    file.set_service_image("web", "nginx:1.25.3").unwrap();
    assert!(
      file
        .contents()
        .contains("    image: nginx:1.25.3  # pinned")
    );
    // The rest of the file is untouched.
    assert!(file.contents().starts_with("# frontend stack\n"));
    assert!(file.contents().contains("networks:"));

    file.set_service_image("cache", "redis:7.2.4").unwrap();
    assert!(
      file.contents().contains("    image: \"redis:7.2.4\"")
    );
    assert_eq!(
      file.service_tag("cache").unwrap().as_deref(),
      Some("7.2.4")
    );
  }

  #[test]
  fn label_set_updates_existing_list_entry() {
    let mut file = compose();
    file
      .set_service_label(
        "web",
        "docksmith.version-pin-minor",
        "false",
      )
      .unwrap();
    assert!(
      file
        .contents()
        .contains("      - docksmith.version-pin-minor=false")
    );
  }

  #[test]
  fn label_set_appends_new_entry() {
    let mut file = compose();
    file
      .set_service_label("web", "docksmith.allow-latest", "true")
      .unwrap();
    let labels = file.service_labels("web").unwrap();
    assert_eq!(
      labels.get("docksmith.allow-latest").map(String::as_str),
      Some("true")
    );
    // Still a valid service block.
    assert_eq!(file.depends_on("web").unwrap(), vec!["cache"]);
  }

  #[test]
  fn label_set_updates_map_entry() {
    let mut file = compose();
    file
      .set_service_label("cache", "docksmith.ignore", "false")
      .unwrap();
    assert!(
      file.contents().contains("      docksmith.ignore: false")
    );
  }

  #[test]
  fn label_set_creates_missing_block() {
    let raw = "\
services:
  app:
    image: app:1.0.0
";
    let mut file = ComposeFile::from_string("/tmp/c.yaml", raw);
    file
      .set_service_label("app", "docksmith.ignore", "true")
      .unwrap();
    let labels = file.service_labels("app").unwrap();
    assert_eq!(
      labels.get("docksmith.ignore").map(String::as_str),
      Some("true")
    );
  }

  #[test]
  fn label_remove() {
    let mut file = compose();
    assert!(
      file
        .remove_service_label("web", "docksmith.version-pin-minor")
        .unwrap()
    );
    assert!(
      !file
        .contents()
        .contains("docksmith.version-pin-minor")
    );
    assert!(
      !file
        .remove_service_label("web", "docksmith.version-pin-minor")
        .unwrap()
    );
  }
}
