//! Version resolution: given a running tag and a policy, pick the
//! highest acceptable tag the registry offers.

use docksmith_client::{
  entities::{
    container::UpdatePolicy,
    version::{ChangeType, Version},
  },
  error::CoreError,
};
use regex::Regex;
use store::DbClient;

use crate::registry::RegistryAdapter;

/// Outcome of resolving one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
  /// Highest acceptable tag. Equal to the current tag when there
  /// is nothing to update to.
  pub latest: String,
  /// A newer tag that exists but was excluded by policy, reported
  /// only when nothing acceptable is newer.
  pub blocked: Option<String>,
  /// Magnitude of the jump to `latest`, None when up to date.
  pub change_type: Option<ChangeType>,
  /// Up to date with a parseable version and no pin configured.
  pub pinnable: bool,
}

/// Resolve the highest acceptable tag for `current_tag`.
///
/// The cache is keyed by the running image digest; a warm entry
/// skips the registry entirely. On a fresh resolution that selects
/// a new tag, the selected tag's digest is cached for next time.
/// Errors pass through unchanged and never populate the cache.
pub async fn resolve(
  registry: &dyn RegistryAdapter,
  db: Option<&DbClient>,
  image_ref: &str,
  image_sha: &str,
  architecture: &str,
  current_tag: &str,
  policy: &UpdatePolicy,
) -> Result<Resolution, CoreError> {
  let current = Version::parse(current_tag);
  let pinnable = current.is_some() && !policy.any_pin();

  if let Some(db) = db
    && !image_sha.is_empty()
  {
    match db
      .get_version_cache(image_sha, image_ref, architecture)
      .await
    {
      Ok(Some(cached)) => {
        return Ok(resolution_from(
          current_tag,
          current.as_ref(),
          &cached,
          None,
          pinnable,
        ));
      }
      Ok(None) => {}
      Err(e) => {
        warn!("version cache lookup failed | {e:#}");
      }
    }
  }

  let tags = registry.list_tags(image_ref).await?;

  // Unparseable tags round-trip (the current tag is always a
  // candidate) but can never be "higher".
  let candidates: Vec<(String, Option<Version>)> = tags
    .into_iter()
    .filter_map(|tag| match Version::parse(&tag) {
      Some(version) => Some((tag, Some(version))),
      None if tag == current_tag => Some((tag, None)),
      None => None,
    })
    .collect();

  let filter = PolicyFilter::new(policy, current.as_ref())?;

  let mut selected: Option<(&str, &Version)> = None;
  let mut newest_any: Option<(&str, &Version)> = None;
  for (tag, version) in &candidates {
    let Some(version) = version else { continue };
    if newest_any
      .map(|(_, newest)| version > newest)
      .unwrap_or(true)
    {
      newest_any = Some((tag, version));
    }
    if !filter.admits(tag, version) {
      continue;
    }
    if let Some(current) = &current
      && version < current
    {
      continue;
    }
    if selected
      .map(|(_, best)| version > best)
      .unwrap_or(true)
    {
      selected = Some((tag, version));
    }
  }

  let updated = match (&current, selected) {
    (Some(current), Some((tag, version))) if version > current => {
      Some((tag.to_string(), current.change_type(version)))
    }
    _ => None,
  };

  let resolution = match updated {
    Some((latest, change_type)) => Resolution {
      latest,
      blocked: None,
      change_type: Some(change_type),
      pinnable: false,
    },
    None => {
      // Nothing acceptable is newer. Is something unacceptable?
      let blocked = match (&current, newest_any) {
        (Some(current), Some((tag, newest)))
          if newest > current =>
        {
          Some(tag.to_string())
        }
        _ => None,
      };
      Resolution {
        latest: current_tag.to_string(),
        blocked,
        change_type: None,
        pinnable,
      }
    }
  };

  if resolution.latest != current_tag {
    cache_selected(
      registry,
      db,
      image_ref,
      architecture,
      &resolution.latest,
    )
    .await;
  }

  Ok(resolution)
}

/// Validate that a user-requested target version is admitted by
/// policy. Called before an operation is created.
pub fn policy_admits(
  policy: &UpdatePolicy,
  current_tag: &str,
  target_tag: &str,
) -> Result<(), CoreError> {
  if target_tag == current_tag {
    return Ok(());
  }
  let current = Version::parse(current_tag);
  let filter = PolicyFilter::new(policy, current.as_ref())?;
  let target = Version::parse(target_tag);
  let admitted = match &target {
    Some(version) => filter.admits(target_tag, version),
    // An unparseable target is only ever acceptable as `latest`.
    None => target_tag == "latest" && policy.allow_latest,
  };
  if admitted {
    Ok(())
  } else {
    Err(CoreError::PolicyBlock(format!(
      "Target version {target_tag} is not allowed by the \
       container's update policy"
    )))
  }
}

struct PolicyFilter<'a> {
  policy: &'a UpdatePolicy,
  current: Option<&'a Version>,
  current_prerelease: bool,
  tag_regex: Option<Regex>,
  min: Option<Version>,
  max: Option<Version>,
}

impl<'a> PolicyFilter<'a> {
  fn new(
    policy: &'a UpdatePolicy,
    current: Option<&'a Version>,
  ) -> Result<PolicyFilter<'a>, CoreError> {
    let tag_regex = policy
      .tag_regex
      .as_deref()
      .map(Regex::new)
      .transpose()
      .map_err(|e| {
        CoreError::Validation(format!(
          "tag-regex does not compile: {e}"
        ))
      })?;
    Ok(PolicyFilter {
      policy,
      current,
      current_prerelease: current
        .map(|v| v.prerelease)
        .unwrap_or_default(),
      tag_regex,
      min: policy
        .version_min
        .as_deref()
        .and_then(Version::parse),
      max: policy
        .version_max
        .as_deref()
        .and_then(Version::parse),
    })
  }

  /// Filter order: tag_regex, prerelease, latest, pin, min/max.
  fn admits(&self, tag: &str, version: &Version) -> bool {
    if let Some(regex) = &self.tag_regex
      && !regex.is_match(tag)
    {
      return false;
    }
    if version.prerelease
      && !self.policy.allow_prerelease
      && !self.current_prerelease
    {
      return false;
    }
    if tag == "latest" && !self.policy.allow_latest {
      return false;
    }
    if self.policy.any_pin() {
      // Pins are mutually inclusive; strictest wins.
      let Some(current) = self.current else {
        return false;
      };
      if version.major != current.major {
        return false;
      }
      if (self.policy.pin_minor || self.policy.pin_patch)
        && version.minor != current.minor
      {
        return false;
      }
      if self.policy.pin_patch && version.patch != current.patch {
        return false;
      }
    }
    if let Some(min) = &self.min
      && version < min
    {
      return false;
    }
    if let Some(max) = &self.max
      && version > max
    {
      return false;
    }
    true
  }
}

fn resolution_from(
  current_tag: &str,
  current: Option<&Version>,
  latest: &str,
  blocked: Option<String>,
  pinnable: bool,
) -> Resolution {
  let change_type = match (current, Version::parse(latest)) {
    (Some(current), Some(resolved))
      if latest != current_tag =>
    {
      Some(current.change_type(&resolved))
    }
    _ => None,
  };
  let up_to_date = latest == current_tag;
  Resolution {
    latest: latest.to_string(),
    blocked,
    change_type,
    pinnable: pinnable && up_to_date,
  }
}

async fn cache_selected(
  registry: &dyn RegistryAdapter,
  db: Option<&DbClient>,
  image_ref: &str,
  architecture: &str,
  selected: &str,
) {
  let Some(db) = db else { return };
  match registry
    .manifest_digest(image_ref, selected, architecture)
    .await
  {
    Ok(digest) => {
      if let Err(e) = db
        .save_version_cache(
          &digest,
          image_ref,
          architecture,
          selected,
        )
        .await
      {
        warn!("failed to write version cache | {e:#}");
      }
    }
    Err(e) => {
      warn!(
        "failed to resolve digest for {image_ref}:{selected} | {e:#}"
      );
    }
  }
}
