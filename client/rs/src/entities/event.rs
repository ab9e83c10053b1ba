use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use crate::entities::docksmith_timestamp;

/// Progress event for one operation, delivered over SSE.
/// Totally ordered per operation by `sequence`; never persisted.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
  pub operation_id: String,
  pub sequence: u64,
  pub kind: EventKind,
  pub payload: serde_json::Value,
  pub timestamp: i64,
}

impl OperationEvent {
  pub fn new(
    operation_id: impl Into<String>,
    sequence: u64,
    kind: EventKind,
    payload: serde_json::Value,
  ) -> OperationEvent {
    OperationEvent {
      operation_id: operation_id.into(),
      sequence,
      kind,
      payload,
      timestamp: docksmith_timestamp(),
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.kind.is_terminal()
  }
}

#[typeshare]
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
  Status,
  Progress,
  Log,
  Complete,
  Fail,
}

impl EventKind {
  pub fn is_terminal(&self) -> bool {
    matches!(self, EventKind::Complete | EventKind::Fail)
  }
}
