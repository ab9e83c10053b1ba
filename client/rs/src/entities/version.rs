use std::{cmp::Ordering, fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// A container image tag parsed into a comparable form.
///
/// Tags do not have to be full semver. `1.24` and `v2` parse, and a
/// trailing build suffix (`1.25.3-alpine3.18`) is carried separately
/// so two builds of the same base version stay distinguishable.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Version {
  pub major: u64,
  pub minor: u64,
  pub patch: u64,
  /// Everything after the numeric components, separator stripped.
  #[serde(default)]
  pub suffix: String,
  /// Whether the suffix marks a pre-release (alpha / beta / rc / ...).
  #[serde(default)]
  pub prerelease: bool,
}

fn version_regex() -> &'static Regex {
  static VERSION_REGEX: OnceLock<Regex> = OnceLock::new();
  VERSION_REGEX.get_or_init(|| {
    Regex::new(r"^[vV]?(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:[-._](.+))?$")
      .unwrap()
  })
}

fn prerelease_regex() -> &'static Regex {
  static PRERELEASE_REGEX: OnceLock<Regex> = OnceLock::new();
  PRERELEASE_REGEX.get_or_init(|| {
    Regex::new(
      r"(?i)^(alpha|beta|rc|pre|preview|dev|snapshot|nightly)",
    )
    .unwrap()
  })
}

impl Version {
  /// Parse a tag. Returns None for tags with no leading numeric
  /// component (`latest`, `stable`, `bookworm`).
  pub fn parse(tag: &str) -> Option<Version> {
    let captures = version_regex().captures(tag.trim())?;
    let component = |i: usize| {
      captures
        .get(i)
        .map(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(Some(0))
    };
    let suffix = captures
      .get(4)
      .map(|m| m.as_str().to_string())
      .unwrap_or_default();
    let prerelease = prerelease_regex().is_match(&suffix);
    Some(Version {
      major: component(1)?,
      minor: component(2)?,
      patch: component(3)?,
      suffix,
      prerelease,
    })
  }

  pub fn base(&self) -> (u64, u64, u64) {
    (self.major, self.minor, self.patch)
  }

  /// Classify the jump from `self` to `to`.
  /// Same base but different build -> Rebuild.
  pub fn change_type(&self, to: &Version) -> ChangeType {
    if self.major != to.major {
      ChangeType::Major
    } else if self.minor != to.minor {
      ChangeType::Minor
    } else if self.patch != to.patch {
      ChangeType::Patch
    } else {
      ChangeType::Rebuild
    }
  }
}

impl Ord for Version {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .base()
      .cmp(&other.base())
      // releases sort above prereleases at the same base
      .then_with(|| other.prerelease.cmp(&self.prerelease))
      .then_with(|| self.suffix.cmp(&other.suffix))
  }
}

impl PartialOrd for Version {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
    if !self.suffix.is_empty() {
      write!(f, "-{}", self.suffix)?;
    }
    Ok(())
  }
}

impl FromStr for Version {
  type Err = anyhow::Error;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Version::parse(s)
      .ok_or_else(|| anyhow::anyhow!("Unparseable version tag: {s}"))
  }
}

/// The magnitude of an update, ordered weakest to strongest.
/// Serialized as its integer code so `Rebuild` (0) survives
/// transport distinct from "no change type".
#[typeshare(serialized_as = "number")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeType {
  Rebuild = 0,
  Patch = 1,
  Minor = 2,
  Major = 3,
}

impl ChangeType {
  pub fn as_u8(self) -> u8 {
    self as u8
  }

  pub fn from_u8(value: u8) -> Option<ChangeType> {
    match value {
      0 => Some(ChangeType::Rebuild),
      1 => Some(ChangeType::Patch),
      2 => Some(ChangeType::Minor),
      3 => Some(ChangeType::Major),
      _ => None,
    }
  }
}

impl Serialize for ChangeType {
  fn serialize<S: serde::Serializer>(
    &self,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(self.as_u8())
  }
}

impl<'de> Deserialize<'de> for ChangeType {
  fn deserialize<D: serde::Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    let value = u8::deserialize(deserializer)?;
    ChangeType::from_u8(value).ok_or_else(|| {
      serde::de::Error::custom(format!(
        "invalid change type code: {value}"
      ))
    })
  }
}

impl fmt::Display for ChangeType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      ChangeType::Rebuild => "rebuild",
      ChangeType::Patch => "patch",
      ChangeType::Minor => "minor",
      ChangeType::Major => "major",
    };
    write!(f, "{label}")
  }
}
