use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Error kinds crossing the core boundary. Adapters map transport
/// details into one of these before returning; the orchestrator
/// records the terminal kind on the operation and the audit log.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
  /// Bad request shape, bad label value, unknown operation type.
  /// Never retried.
  #[error("{0}")]
  Validation(String),

  /// Update forbidden by pin / regex / min / max policy.
  #[error("Blocked by policy: {0}")]
  PolicyBlock(String),

  #[error("{0} not found")]
  NotFound(String),

  /// Docker, registry, or compose file I/O failure, after the
  /// adapter's own retries.
  #[error("{0}")]
  External(String),

  /// The configured pre-update check script exited non-zero.
  #[error("Pre-update check failed: {0}")]
  PreUpdateCheck(String),

  /// Persistence unavailable or busy beyond retry budget.
  #[error("{0}")]
  Persistence(String),

  #[error("cancelled")]
  Cancelled,

  #[error("deadline exceeded")]
  DeadlineExceeded,
}

impl CoreError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      CoreError::Validation(_) => ErrorKind::Validation,
      CoreError::PolicyBlock(_) => ErrorKind::PolicyBlock,
      CoreError::NotFound(_) => ErrorKind::NotFound,
      CoreError::External(_) => ErrorKind::External,
      CoreError::PreUpdateCheck(_) => ErrorKind::PreUpdateCheck,
      CoreError::Persistence(_) => ErrorKind::Persistence,
      CoreError::Cancelled => ErrorKind::Cancelled,
      CoreError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
    }
  }

  pub fn external(e: impl std::fmt::Display) -> CoreError {
    CoreError::External(e.to_string())
  }
}

#[typeshare]
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Validation,
  PolicyBlock,
  NotFound,
  External,
  PreUpdateCheck,
  Persistence,
  Cancelled,
  DeadlineExceeded,
}
