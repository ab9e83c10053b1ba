use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use typeshare::typeshare;

use crate::entities::{docksmith_timestamp, version::ChangeType};

/// A user-initiated, tracked mutation of container state.
///
/// Rows are append-only for audit purposes: terminal operations are
/// never deleted and never leave their terminal state.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateOperation {
  /// Database row id. 0 until first persisted.
  #[serde(default)]
  pub id: i64,
  /// Externally visible opaque id.
  pub operation_id: String,
  /// Groups sibling operations created from one user action.
  pub batch_group_id: Option<String>,
  pub container_id: String,
  pub container_name: String,
  pub stack_name: String,
  pub operation_type: OperationType,
  pub status: OperationStatus,
  #[serde(default)]
  pub old_version: String,
  #[serde(default)]
  pub new_version: String,
  pub error_message: Option<String>,
  /// Containers restarted because of `docksmith.restart-after`
  /// edges, in execution order.
  #[serde(default)]
  pub dependents_affected: Vec<String>,
  #[serde(default)]
  pub rollback_occurred: bool,
  /// Per-container rows for batch operations.
  #[serde(default)]
  pub batch_details: Vec<BatchDetail>,
  /// For rollback operations, the operation being rolled back.
  pub target_operation_id: Option<String>,
  /// Execution flags captured at request time.
  #[serde(default)]
  pub params: OperationParams,
  pub started_at: Option<i64>,
  pub completed_at: Option<i64>,
  #[serde(default)]
  pub created_at: i64,
  #[serde(default)]
  pub updated_at: i64,
}

impl UpdateOperation {
  pub fn new(
    operation_type: OperationType,
    container_name: impl Into<String>,
    stack_name: impl Into<String>,
  ) -> UpdateOperation {
    let now = docksmith_timestamp();
    UpdateOperation {
      operation_id: super::new_operation_id(),
      container_name: container_name.into(),
      stack_name: stack_name.into(),
      operation_type,
      status: OperationStatus::Queued,
      created_at: now,
      updated_at: now,
      ..Default::default()
    }
  }
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationType {
  #[default]
  Single,
  Batch,
  Stop,
  Remove,
  Restart,
  Rollback,
  FixMismatch,
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
  #[default]
  Queued,
  Validating,
  Backup,
  PullingImage,
  Recreating,
  HealthCheck,
  RollingBack,
  InProgress,
  Complete,
  Failed,
}

impl OperationStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, OperationStatus::Complete | OperationStatus::Failed)
  }
}

/// Flags captured from the request that executing workers honor.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationParams {
  /// Skip the pre-update check and policy gate.
  #[serde(default)]
  pub force: bool,
  /// `docker rm -v` for remove operations.
  #[serde(default)]
  pub remove_volumes: bool,
  /// Stop grace period override in seconds.
  pub stop_timeout: Option<i64>,
  /// Restart operations created from a start request only start
  /// stopped containers instead of bouncing running ones.
  #[serde(default)]
  pub start_only: bool,
}

/// One container inside a batch operation.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDetail {
  pub container_name: String,
  pub stack_name: String,
  pub old_declared_version: String,
  pub new_declared_version: String,
  pub old_resolved_version: String,
  pub new_resolved_version: String,
  /// None when the magnitude was never resolved. `Rebuild` (0) is a
  /// real value and round-trips distinct from None.
  pub change_type: Option<ChangeType>,
}

/// Coarse audit trail written while operations execute, independent
/// of the operation rows.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
  #[serde(default)]
  pub id: i64,
  pub container_name: String,
  pub operation: UpdateLogOperation,
  #[serde(default)]
  pub from_version: String,
  #[serde(default)]
  pub to_version: String,
  pub timestamp: i64,
  pub success: bool,
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UpdateLogOperation {
  #[default]
  Pull,
  Restart,
  Rollback,
}

/// A pending operation parked in the persistent queue.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuedUpdate {
  pub operation_id: String,
  pub stack_name: String,
  /// Ordered container list for the operation.
  #[serde(default)]
  pub containers: Vec<String>,
  /// Higher first among rows of equal age.
  #[serde(default)]
  pub priority: i64,
  pub queued_at: i64,
  pub estimated_start_time: Option<i64>,
}

/// One row of check history, written per container per cycle.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckHistoryEntry {
  #[serde(default)]
  pub id: i64,
  pub container_name: String,
  pub image: String,
  pub check_time: i64,
  #[serde(default)]
  pub current_version: String,
  pub latest_version: Option<String>,
  pub status: super::container::ContainerStatus,
  pub error: Option<String>,
}

/// The result of one full discovery cycle, published atomically.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusView {
  pub checked_at: i64,
  pub containers: Vec<super::container::Container>,
}

/// Output of a shell command stage, kept on operations for audit.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(stage: &str, msg: String) -> Log {
    let now = docksmith_timestamp();
    Log {
      stage: stage.to_string(),
      stdout: msg,
      success: true,
      start_ts: now,
      end_ts: now,
      ..Default::default()
    }
  }

  pub fn error(stage: &str, msg: String) -> Log {
    let now = docksmith_timestamp();
    Log {
      stage: stage.to_string(),
      stderr: msg,
      success: false,
      start_ts: now,
      end_ts: now,
      ..Default::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn operation_serde_round_trip() {
    let mut op = UpdateOperation::new(
      OperationType::Batch,
      "web",
      "frontend",
    );
    op.batch_details = vec![BatchDetail {
      container_name: String::from("web"),
      stack_name: String::from("frontend"),
      old_declared_version: String::from("1.24.0"),
      new_declared_version: String::from("1.25.3"),
      old_resolved_version: String::from("1.24.0"),
      new_resolved_version: String::from("1.25.3"),
      change_type: Some(ChangeType::Rebuild),
    }];
    let json = serde_json::to_string(&op).unwrap();
    let back: UpdateOperation = serde_json::from_str(&json).unwrap();
    assert_eq!(op, back);
    assert_eq!(
      back.batch_details[0].change_type,
      Some(ChangeType::Rebuild)
    );
  }

  #[test]
  fn absent_change_type_stays_absent() {
    let detail = BatchDetail::default();
    let json = serde_json::to_string(&detail).unwrap();
    let back: BatchDetail = serde_json::from_str(&json).unwrap();
    assert_eq!(back.change_type, None);
  }

  #[test]
  fn status_serializes_snake_case() {
    assert_eq!(
      serde_json::to_string(&OperationStatus::PullingImage).unwrap(),
      "\"pulling_image\""
    );
    assert_eq!(OperationStatus::PullingImage.to_string(), "pulling_image");
    assert!(OperationStatus::Complete.is_terminal());
    assert!(OperationStatus::Failed.is_terminal());
    assert!(!OperationStatus::RollingBack.is_terminal());
  }

  #[test]
  fn log_operation_parses() {
    use std::str::FromStr;
    assert_eq!(
      UpdateLogOperation::from_str("rollback").unwrap(),
      UpdateLogOperation::Rollback
    );
    assert!(UpdateLogOperation::from_str("recreate").is_err());
  }
}
