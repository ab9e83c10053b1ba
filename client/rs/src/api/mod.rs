use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::entities::version::ChangeType;

/// Envelope shared by every `/api` response.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl<T> ApiResponse<T> {
  pub fn ok(data: T) -> ApiResponse<T> {
    ApiResponse {
      success: true,
      data: Some(data),
      error: None,
    }
  }

  pub fn err(error: impl Into<String>) -> ApiResponse<T> {
    ApiResponse {
      success: false,
      data: None,
      error: Some(error.into()),
    }
  }
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
  pub container_name: String,
  pub target_version: String,
  #[serde(default)]
  pub force: bool,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpdateRequest {
  pub containers: Vec<BatchUpdateItem>,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpdateItem {
  pub name: String,
  pub target_version: String,
  pub stack: String,
  #[serde(default)]
  pub force: bool,
  pub change_type: Option<ChangeType>,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
  pub operation_id: String,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackContainersRequest {
  pub operation_id: String,
  pub container_names: Vec<String>,
  #[serde(default)]
  pub force: bool,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLabelRequest {
  pub container_name: String,
  pub label: String,
  pub value: String,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveLabelRequest {
  pub container_name: String,
  pub label: String,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLabelRequest {
  pub updates: Vec<SetLabelRequest>,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignScriptRequest {
  pub container_name: String,
  pub script_path: Option<String>,
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub ignore: bool,
  #[serde(default)]
  pub allow_latest: bool,
  #[serde(default)]
  pub assigned_by: String,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRollbackPolicyRequest {
  pub entity_type: crate::entities::policy::PolicyEntityType,
  pub entity_id: Option<String>,
  pub auto_rollback_enabled: bool,
  pub health_check_required: bool,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigRequest {
  pub config: std::collections::HashMap<String, String>,
  #[serde(default)]
  pub changed_by: String,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationsQuery {
  pub limit: Option<i64>,
  pub status: Option<String>,
  pub container: Option<String>,
}

/// Response to operation-creating endpoints.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationCreated {
  pub operation_id: String,
  pub batch_group_id: Option<String>,
}
