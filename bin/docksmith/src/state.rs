use std::{
  sync::{Arc, OnceLock},
  time::Duration,
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use docksmith_client::{
  entities::update::StatusView, error::CoreError,
};
use store::DbClient;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
  config::core_config,
  docker::{CliDocker, DockerAdapter},
  events::EventHub,
  registry::{HttpRegistry, RegistryAdapter},
};

/// Everything with process lifetime. Production builds exactly one
/// (behind [app_state]); tests build their own with fake adapters
/// and scratch databases.
pub struct AppState {
  /// None when persistence init failed (degraded mode).
  pub db: Option<DbClient>,
  pub docker: Arc<dyn DockerAdapter>,
  pub registry: Arc<dyn RegistryAdapter>,
  pub events: EventHub,
  /// Last published discovery result; swapped atomically per cycle.
  pub status: ArcSwap<StatusView>,
  /// Live per-stack worker nudge channels.
  pub workers: DashMap<String, tokio::sync::mpsc::Sender<()>>,
  /// Global admission for concurrently executing stack workers.
  pub admission: Arc<Semaphore>,
  /// Cancel tokens for live operations.
  pub cancels: DashMap<String, CancellationToken>,
  /// On-demand check trigger; trigger while running coalesces.
  pub check_notify: Notify,
  /// Serializes discovery cycles so they never overlap.
  pub check_lock: tokio::sync::Mutex<()>,
  pub settings: Settings,
}

/// The runtime knobs the core consults while executing. Split from
/// the env config so tests can shrink timeouts.
#[derive(Debug, Clone)]
pub struct Settings {
  pub architecture: String,
  pub check_concurrency: usize,
  pub operation_timeout: Duration,
  pub health_check_timeout: Duration,
  pub health_poll_interval: Duration,
  pub stop_timeout: i64,
  pub worker_idle: Duration,
  /// Wait applied when a container declares no healthcheck and
  /// policy does not require one.
  pub no_healthcheck_grace: Duration,
}

impl Default for Settings {
  fn default() -> Settings {
    Settings {
      architecture: String::from("amd64"),
      check_concurrency: 8,
      operation_timeout: Duration::from_secs(1800),
      health_check_timeout: Duration::from_secs(120),
      health_poll_interval: Duration::from_secs(2),
      stop_timeout: 10,
      worker_idle: Duration::from_secs(60),
      no_healthcheck_grace: NO_HEALTHCHECK_GRACE,
    }
  }
}

/// Documented fixed grace period for containers without a declared
/// healthcheck.
pub const NO_HEALTHCHECK_GRACE: Duration = Duration::from_secs(10);

impl AppState {
  pub fn new(
    db: Option<DbClient>,
    docker: Arc<dyn DockerAdapter>,
    registry: Arc<dyn RegistryAdapter>,
    max_concurrent_stacks: usize,
    settings: Settings,
  ) -> AppState {
    AppState {
      db,
      docker,
      registry,
      events: EventHub::default(),
      status: ArcSwap::from_pointee(StatusView::default()),
      workers: DashMap::new(),
      admission: Arc::new(Semaphore::new(max_concurrent_stacks)),
      cancels: DashMap::new(),
      check_notify: Notify::new(),
      check_lock: tokio::sync::Mutex::new(()),
      settings,
    }
  }

  /// The store, or an explicit error in degraded mode.
  pub fn db(&self) -> Result<&DbClient, CoreError> {
    self.db.as_ref().ok_or_else(|| {
      CoreError::Persistence(String::from(
        "Persistence is unavailable (database failed to \
         initialize); this action requires state",
      ))
    })
  }
}

static APP_STATE: OnceLock<Arc<AppState>> = OnceLock::new();

/// Initialize the process-wide state. Database failure leaves the
/// process serving in degraded mode rather than crashing.
pub async fn init_app_state() -> Arc<AppState> {
  let config = core_config();
  let db =
    match DbClient::init(&config.db_path, config.cache_ttl).await {
      Ok(db) => Some(db),
      Err(e) => {
        error!(
          "Database init failed, continuing without \
           persistence | {e:#}"
        );
        None
      }
    };
  let state = Arc::new(AppState::new(
    db,
    Arc::new(CliDocker::default()),
    Arc::new(HttpRegistry::new(
      config.registry_concurrency,
      config.github_token.clone(),
    )),
    config.max_concurrent_stacks,
    Settings {
      architecture: config.architecture.clone(),
      check_concurrency: config.check_concurrency,
      operation_timeout: config.operation_timeout,
      health_check_timeout: config.health_check_timeout,
      stop_timeout: config.stop_timeout,
      worker_idle: config.worker_idle,
      ..Default::default()
    },
  ));
  APP_STATE
    .set(state.clone())
    .unwrap_or_else(|_| panic!("app state initialized twice"));
  state
}

pub fn app_state() -> &'static Arc<AppState> {
  APP_STATE.get().expect("app state not initialized")
}
