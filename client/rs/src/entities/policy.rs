use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use typeshare::typeshare;

/// Database mirror of the `docksmith.*` policy labels, so policy can
/// be changed without editing compose files. Upserted by container
/// name; labels are migrated in on first sight.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptAssignment {
  pub container_name: String,
  /// Pre-update check script path, if one is assigned.
  pub script_path: Option<String>,
  /// Disabled assignments leave label policy untouched.
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub ignore: bool,
  #[serde(default)]
  pub allow_latest: bool,
  #[serde(default)]
  pub assigned_by: String,
  #[serde(default)]
  pub assigned_at: i64,
  #[serde(default)]
  pub updated_at: i64,
}

/// Rollback behavior, looked up most specific first:
/// container, then stack, then global.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackPolicy {
  pub entity_type: PolicyEntityType,
  /// None for the global policy.
  pub entity_id: Option<String>,
  #[serde(default)]
  pub auto_rollback_enabled: bool,
  #[serde(default)]
  pub health_check_required: bool,
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PolicyEntityType {
  #[default]
  Global,
  Stack,
  Container,
}

/// Full key/value map of mutable runtime config at a moment in time.
/// Appended on every config write; revert restores one atomically.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
  #[serde(default)]
  pub id: i64,
  pub config_data: HashMap<String, String>,
  #[serde(default)]
  pub changed_by: String,
  #[serde(default)]
  pub created_at: i64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_round_trips_awkward_values() {
    let mut data = HashMap::new();
    data.insert(
      String::from("motd"),
      String::from("héllo \"world\" \\ 🚀"),
    );
    data.insert(String::from("empty"), String::new());
    let snapshot = ConfigSnapshot {
      id: 7,
      config_data: data,
      changed_by: String::from("admin"),
      created_at: 1,
    };
    let json = serde_json::to_string(&snapshot).unwrap();
    let back: ConfigSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(snapshot, back);
  }

  #[test]
  fn entity_type_parses() {
    use std::str::FromStr;
    assert_eq!(
      PolicyEntityType::from_str("container").unwrap(),
      PolicyEntityType::Container
    );
    assert_eq!(PolicyEntityType::Stack.to_string(), "stack");
  }
}
