use async_timing_util::unix_timestamp_ms;
use typeshare::typeshare;

/// [Container][container::Container] and its classification.
pub mod container;
/// [OperationEvent][event::OperationEvent] progress events.
pub mod event;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// Policy records: [ScriptAssignment][policy::ScriptAssignment],
/// [RollbackPolicy][policy::RollbackPolicy], config snapshots.
pub mod policy;
/// [UpdateOperation][update::UpdateOperation] and the audit trail.
pub mod update;
/// Tag parsing / ordering: [Version][version::Version].
pub mod version;

#[typeshare(serialized_as = "number")]
pub type I64 = i64;
#[typeshare(serialized_as = "number")]
pub type U64 = u64;
#[typeshare(serialized_as = "any")]
pub type JsonValue = serde_json::Value;

/// Unix timestamp in milliseconds as i64
pub fn docksmith_timestamp() -> i64 {
  unix_timestamp_ms() as i64
}

/// A fresh externally visible operation id.
pub fn new_operation_id() -> String {
  uuid::Uuid::new_v4().simple().to_string()
}

pub fn optional_string(string: impl Into<String>) -> Option<String> {
  let string = string.into();
  if string.is_empty() { None } else { Some(string) }
}

/// Split an image reference into `(repository, tag)`.
/// `nginx:1.25.3` -> `("nginx", Some("1.25.3"))`.
/// Digest references (`nginx@sha256:..`) have no tag.
/// Port-carrying registries (`host:5000/app`) are handled.
pub fn split_image_ref(image: &str) -> (String, Option<String>) {
  if let Some((repo, _digest)) = image.split_once('@') {
    return (repo.to_string(), None);
  }
  match image.rsplit_once(':') {
    // A ':' inside the last path segment is a tag. Otherwise it
    // belongs to a registry port (`host:5000/app`).
    Some((repo, tag)) if !tag.contains('/') => {
      (repo.to_string(), Some(tag.to_string()))
    }
    _ => (image.to_string(), None),
  }
}

/// Tag of an image reference, defaulting to `latest` like docker does.
pub fn image_tag(image: &str) -> Option<String> {
  let (_, tag) = split_image_ref(image);
  if image.contains('@') { None } else { tag.or_else(|| Some(String::from("latest"))) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_plain_reference() {
    assert_eq!(
      split_image_ref("nginx:1.25.3"),
      (String::from("nginx"), Some(String::from("1.25.3")))
    );
  }

  #[test]
  fn splits_registry_with_port() {
    assert_eq!(
      split_image_ref("registry.local:5000/team/app"),
      (String::from("registry.local:5000/team/app"), None)
    );
    assert_eq!(
      split_image_ref("registry.local:5000/team/app:2.1"),
      (
        String::from("registry.local:5000/team/app"),
        Some(String::from("2.1"))
      )
    );
  }

  #[test]
  fn digest_reference_has_no_tag() {
    let (repo, tag) = split_image_ref(
      "nginx@sha256:aaaabbbbccccddddeeeeffff0000111122223333444455556666777788889999",
    );
    assert_eq!(repo, "nginx");
    assert_eq!(tag, None);
    assert_eq!(
      image_tag("nginx@sha256:aaaabbbbccccddddeeeeffff0000111122223333444455556666777788889999"),
      None
    );
  }

  #[test]
  fn untagged_reference_defaults_to_latest() {
    assert_eq!(image_tag("nginx"), Some(String::from("latest")));
  }
}
