use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use typeshare::typeshare;

use crate::{
  entities::{
    policy::ScriptAssignment,
    version::ChangeType,
  },
  error::CoreError,
};

/// Reserved label namespace carrying per-container update policy.
pub mod labels {
  pub const PREFIX: &str = "docksmith.";

  pub const IGNORE: &str = "docksmith.ignore";
  pub const ALLOW_LATEST: &str = "docksmith.allow-latest";
  pub const ALLOW_PRERELEASE: &str = "docksmith.allow-prerelease";
  pub const PRE_UPDATE_CHECK: &str = "docksmith.pre-update-check";
  pub const RESTART_AFTER: &str = "docksmith.restart-after";
  pub const VERSION_PIN_MAJOR: &str = "docksmith.version-pin-major";
  pub const VERSION_PIN_MINOR: &str = "docksmith.version-pin-minor";
  pub const VERSION_PIN_PATCH: &str = "docksmith.version-pin-patch";
  pub const TAG_REGEX: &str = "docksmith.tag-regex";
  pub const VERSION_MIN: &str = "docksmith.version-min";
  pub const VERSION_MAX: &str = "docksmith.version-max";

  pub const ALL: &[&str] = &[
    IGNORE,
    ALLOW_LATEST,
    ALLOW_PRERELEASE,
    PRE_UPDATE_CHECK,
    RESTART_AFTER,
    VERSION_PIN_MAJOR,
    VERSION_PIN_MINOR,
    VERSION_PIN_PATCH,
    TAG_REGEX,
    VERSION_MIN,
    VERSION_MAX,
  ];
}

pub const TAG_REGEX_MAX_LEN: usize = 500;

/// Booleans in labels accept `true | 1 | yes` (case-insensitive).
pub fn truthy(value: &str) -> bool {
  matches!(
    value.trim().to_lowercase().as_str(),
    "true" | "1" | "yes"
  )
}

/// Validate a `docksmith.*` label write. Unknown keys and bad
/// `tag-regex` values are rejected before they reach a compose file.
pub fn validate_label(
  key: &str,
  value: &str,
) -> Result<(), CoreError> {
  if !labels::ALL.contains(&key) {
    return Err(CoreError::Validation(format!(
      "Unknown label key: {key}"
    )));
  }
  if key == labels::TAG_REGEX {
    if value.len() > TAG_REGEX_MAX_LEN {
      return Err(CoreError::Validation(format!(
        "tag-regex exceeds {TAG_REGEX_MAX_LEN} characters"
      )));
    }
    regex::Regex::new(value).map_err(|e| {
      CoreError::Validation(format!("tag-regex does not compile: {e}"))
    })?;
  }
  Ok(())
}

/// A running container joined with its compose declaration,
/// rebuilt on every check cycle.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
  /// Container name, unique on the host.
  pub name: String,
  pub id: String,
  /// The image reference the container is running.
  pub image: String,
  /// Compose project name.
  pub stack: String,
  /// Path of the compose file declaring this container.
  pub compose_file: String,
  /// Service name within the compose file.
  pub service: String,
  /// Tag declared by the compose file `image:` field.
  pub declared_version: String,
  /// Tag embedded in the running image reference.
  /// Empty for bare digest references.
  pub running_version: String,
  #[serde(default)]
  pub labels: HashMap<String, String>,
  pub status: ContainerStatus,
  /// Highest acceptable tag, when one was resolved.
  pub latest_version: Option<String>,
  pub change_type: Option<ChangeType>,
  pub error: Option<String>,
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
  UpToDate,
  /// Up to date, and running a fully parseable version with no pin
  /// configured, so a tighter pin could be applied.
  UpToDatePinnable,
  UpdateAvailable,
  /// A newer tag exists but policy filters removed it.
  UpdateAvailableBlocked,
  /// No remote registry equivalent for the image.
  LocalImage,
  /// Running image disagrees with the compose file (tag drift or a
  /// bare digest reference).
  ComposeMismatch,
  Ignored,
  #[default]
  Error,
}

/// Effective update policy for one container: labels overlaid by the
/// database assignment when one exists.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePolicy {
  #[serde(default)]
  pub ignore: bool,
  #[serde(default)]
  pub allow_latest: bool,
  #[serde(default)]
  pub allow_prerelease: bool,
  #[serde(default)]
  pub pin_major: bool,
  #[serde(default)]
  pub pin_minor: bool,
  #[serde(default)]
  pub pin_patch: bool,
  pub version_min: Option<String>,
  pub version_max: Option<String>,
  pub tag_regex: Option<String>,
  /// Script executed inside the container before an update.
  pub pre_update_check: Option<String>,
  /// Containers to restart after this one recreates, in order.
  #[serde(default)]
  pub restart_after: Vec<String>,
}

impl UpdatePolicy {
  pub fn from_labels(labels: &HashMap<String, String>) -> UpdatePolicy {
    let flag = |key: &str| {
      labels.get(key).map(|v| truthy(v)).unwrap_or_default()
    };
    let string = |key: &str| {
      labels
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    };
    UpdatePolicy {
      ignore: flag(labels::IGNORE),
      allow_latest: flag(labels::ALLOW_LATEST),
      allow_prerelease: flag(labels::ALLOW_PRERELEASE),
      pin_major: flag(labels::VERSION_PIN_MAJOR),
      pin_minor: flag(labels::VERSION_PIN_MINOR),
      pin_patch: flag(labels::VERSION_PIN_PATCH),
      version_min: string(labels::VERSION_MIN),
      version_max: string(labels::VERSION_MAX),
      tag_regex: string(labels::TAG_REGEX),
      pre_update_check: string(labels::PRE_UPDATE_CHECK),
      restart_after: string(labels::RESTART_AFTER)
        .map(|csv| {
          csv
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
        })
        .unwrap_or_default(),
    }
  }

  /// Database assignments override labels.
  pub fn apply_assignment(&mut self, assignment: &ScriptAssignment) {
    if !assignment.enabled {
      return;
    }
    self.ignore = assignment.ignore;
    self.allow_latest = assignment.allow_latest;
    if let Some(path) = &assignment.script_path {
      self.pre_update_check = Some(path.clone());
    }
  }

  pub fn any_pin(&self) -> bool {
    self.pin_major || self.pin_minor || self.pin_patch
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn label_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn truthy_accepts_documented_values() {
    for value in ["true", "1", "yes", "TRUE", "Yes"] {
      assert!(truthy(value), "{value} should be truthy");
    }
    for value in ["false", "0", "no", "", "on"] {
      assert!(!truthy(value), "{value} should be falsy");
    }
  }

  #[test]
  fn policy_from_labels() {
    let labels = label_map(&[
      (labels::IGNORE, "no"),
      (labels::VERSION_PIN_MINOR, "true"),
      (labels::RESTART_AFTER, "proxy, worker ,"),
      (labels::TAG_REGEX, r"^\d+\.\d+\.\d+$"),
    ]);
    let policy = UpdatePolicy::from_labels(&labels);
    assert!(!policy.ignore);
    assert!(policy.pin_minor);
    assert!(!policy.pin_patch);
    assert_eq!(policy.restart_after, vec!["proxy", "worker"]);
    assert_eq!(policy.tag_regex.as_deref(), Some(r"^\d+\.\d+\.\d+$"));
  }

  #[test]
  fn assignment_overrides_labels() {
    let labels = label_map(&[(labels::IGNORE, "true")]);
    let mut policy = UpdatePolicy::from_labels(&labels);
    let assignment = ScriptAssignment {
      container_name: String::from("web"),
      script_path: Some(String::from("/scripts/check.sh")),
      enabled: true,
      ignore: false,
      allow_latest: true,
      ..Default::default()
    };
    policy.apply_assignment(&assignment);
    assert!(!policy.ignore);
    assert!(policy.allow_latest);
    assert_eq!(
      policy.pre_update_check.as_deref(),
      Some("/scripts/check.sh")
    );
  }

  #[test]
  fn label_validation() {
    assert!(validate_label(labels::IGNORE, "true").is_ok());
    assert!(validate_label("docksmith.unknown", "x").is_err());
    assert!(validate_label(labels::TAG_REGEX, "[").is_err());
    let long = "a".repeat(TAG_REGEX_MAX_LEN + 1);
    assert!(validate_label(labels::TAG_REGEX, &long).is_err());
  }
}
