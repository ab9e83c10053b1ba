use std::{path::PathBuf, sync::OnceLock, time::Duration};

use docksmith_client::entities::logger::{
  LogConfig, LogLevel, StdioLogMode,
};
use serde::Deserialize;

/// Environment-driven configuration, parsed once at startup.
/// Docksmith is env-only: there is no config file layer.
pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: Env = match envy::from_env() {
      Ok(env) => env,
      Err(e) => {
        panic!("Failed to parse Docksmith environment: {e:?}");
      }
    };
    CoreConfig {
      db_path: env
        .db_path
        .unwrap_or_else(|| PathBuf::from("/data/docksmith.db")),
      cache_ttl: parse_duration(env.cache_ttl.as_deref(), 3600),
      static_dir: env
        .static_dir
        .unwrap_or_else(|| PathBuf::from("/app/static")),
      scripts_dir: env
        .scripts_dir
        .unwrap_or_else(|| PathBuf::from("/app/scripts")),
      github_token: env.github_token,
      port: env.port.unwrap_or(3000),
      bind_ip: env
        .bind_ip
        .unwrap_or_else(|| String::from("0.0.0.0")),
      check_interval: Duration::from_secs(
        env.check_interval_secs.unwrap_or(300).max(5),
      ),
      check_concurrency: env.check_concurrency.unwrap_or(8).max(1),
      max_concurrent_stacks: env
        .max_concurrent_stacks
        .unwrap_or(4)
        .max(1),
      operation_timeout: Duration::from_secs(
        env.operation_timeout_secs.unwrap_or(1800).max(1),
      ),
      health_check_timeout: Duration::from_secs(
        env.health_check_timeout_secs.unwrap_or(120).max(1),
      ),
      stop_timeout: env.stop_timeout_secs.unwrap_or(10),
      worker_idle: Duration::from_secs(
        env.worker_idle_secs.unwrap_or(60).max(1),
      ),
      registry_concurrency: env
        .registry_concurrency
        .unwrap_or(4)
        .max(1),
      architecture: env
        .architecture
        .unwrap_or_else(|| String::from("amd64")),
      logging: LogConfig {
        level: env.log_level.unwrap_or(LogLevel::Info),
        stdio: env.log_stdio.unwrap_or(StdioLogMode::Standard),
        pretty: env.log_pretty.unwrap_or_default(),
      },
    }
  })
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
  pub db_path: PathBuf,
  /// Version cache TTL. Clamped positive by the store.
  pub cache_ttl: Duration,
  /// Directory the React SPA is served from.
  pub static_dir: PathBuf,
  /// Directory scanned for pre-update check scripts.
  pub scripts_dir: PathBuf,
  /// Registry auth for ghcr.io.
  pub github_token: Option<String>,
  pub port: u16,
  pub bind_ip: String,
  pub check_interval: Duration,
  pub check_concurrency: usize,
  pub max_concurrent_stacks: usize,
  pub operation_timeout: Duration,
  pub health_check_timeout: Duration,
  /// Default `docker stop` grace period in seconds.
  pub stop_timeout: i64,
  pub worker_idle: Duration,
  pub registry_concurrency: usize,
  pub architecture: String,
  pub logging: LogConfig,
}

impl CoreConfig {
  /// Loggable form: secrets masked.
  pub fn sanitized(&self) -> CoreConfig {
    let mut config = self.clone();
    if config.github_token.is_some() {
      config.github_token = Some(String::from("***"));
    }
    config
  }
}

#[derive(Deserialize)]
struct Env {
  db_path: Option<PathBuf>,
  /// Seconds, or a duration string like `1h` / `30m` / `90s`.
  cache_ttl: Option<String>,
  static_dir: Option<PathBuf>,
  scripts_dir: Option<PathBuf>,
  github_token: Option<String>,
  port: Option<u16>,
  bind_ip: Option<String>,
  check_interval_secs: Option<u64>,
  check_concurrency: Option<usize>,
  max_concurrent_stacks: Option<usize>,
  operation_timeout_secs: Option<u64>,
  health_check_timeout_secs: Option<u64>,
  stop_timeout_secs: Option<i64>,
  worker_idle_secs: Option<u64>,
  registry_concurrency: Option<usize>,
  architecture: Option<String>,
  log_level: Option<LogLevel>,
  log_stdio: Option<StdioLogMode>,
  log_pretty: Option<bool>,
}

fn parse_duration(value: Option<&str>, default_secs: u64) -> Duration {
  let Some(value) = value else {
    return Duration::from_secs(default_secs);
  };
  let value = value.trim();
  let (digits, unit) = match value
    .find(|c: char| !c.is_ascii_digit())
  {
    Some(split) => value.split_at(split),
    None => (value, "s"),
  };
  let Ok(amount) = digits.parse::<u64>() else {
    warn!("Unparseable CACHE_TTL {value:?}, using default");
    return Duration::from_secs(default_secs);
  };
  let seconds = match unit.trim() {
    "s" | "" => amount,
    "m" => amount * 60,
    "h" => amount * 3600,
    "d" => amount * 86400,
    _ => {
      warn!("Unknown duration unit in {value:?}, using default");
      default_secs
    }
  };
  Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn duration_parsing() {
    assert_eq!(
      parse_duration(Some("3600"), 1),
      Duration::from_secs(3600)
    );
    assert_eq!(parse_duration(Some("1h"), 1), Duration::from_secs(3600));
    assert_eq!(parse_duration(Some("30m"), 1), Duration::from_secs(1800));
    assert_eq!(parse_duration(Some("90s"), 1), Duration::from_secs(90));
    assert_eq!(parse_duration(None, 7), Duration::from_secs(7));
    assert_eq!(parse_duration(Some("bogus"), 7), Duration::from_secs(7));
  }
}
