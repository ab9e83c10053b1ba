//! End-to-end scenarios: the real checker, queue workers and
//! orchestrator over fake adapters and temp compose files.

use std::time::Duration;

use docksmith_client::{
  entities::{
    container::ContainerStatus,
    policy::{PolicyEntityType, RollbackPolicy},
    update::{OperationStatus, UpdateLogOperation},
    version::ChangeType,
  },
  error::CoreError,
};

use crate::{
  checker, orchestrator,
  docker::HealthState,
  testutil::TestHarness,
};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn happy_update_syncs_compose_and_container() {
  let harness = TestHarness::new().await;
  let compose = harness
    .add_service("frontend", "web", "web", "nginx:1.24.0", &[])
    .await;
  harness
    .registry
    .set_tags("nginx", &["1.24.0", "1.25.3", "latest"]);

  let op = orchestrator::create_single_update(
    &harness.state,
    "web",
    "1.25.3",
    false,
  )
  .await
  .unwrap();

  let done = orchestrator::wait_terminal(
    &harness.state,
    &op.operation_id,
    WAIT,
  )
  .await
  .unwrap();

  assert_eq!(done.status, OperationStatus::Complete);
  assert!(!done.rollback_occurred);
  assert_eq!(done.old_version, "1.24.0");
  assert_eq!(done.new_version, "1.25.3");
  assert!(done.completed_at.is_some());

  // Compose file, running container and the recorded versions all
  // agree.
  assert_eq!(
    harness.compose_image(&compose, "web").await.as_deref(),
    Some("nginx:1.25.3")
  );
  assert_eq!(
    harness.docker.running_image("web").as_deref(),
    Some("nginx:1.25.3")
  );

  // Audit trail: pull then restart, both successful.
  let db = harness.state.db().unwrap();
  let log = db.list_update_log(Some("web"), 10).await.unwrap();
  assert_eq!(log.len(), 2);
  assert_eq!(log[1].operation, UpdateLogOperation::Pull);
  assert_eq!(log[0].operation, UpdateLogOperation::Restart);
  assert!(log.iter().all(|entry| entry.success));
}

#[tokio::test]
async fn health_failure_rolls_back_when_policy_enables() {
  let harness = TestHarness::new().await;
  let compose = harness
    .add_service("frontend", "web", "web", "nginx:1.24.0", &[])
    .await;
  harness.registry.set_tags("nginx", &["1.24.0", "1.25.3"]);
  harness.docker.health_by_image.lock().unwrap().insert(
    String::from("nginx:1.25.3"),
    HealthState::Unhealthy,
  );
  let db = harness.state.db().unwrap();
  db.set_rollback_policy(&RollbackPolicy {
    entity_type: PolicyEntityType::Container,
    entity_id: Some(String::from("web")),
    auto_rollback_enabled: true,
    health_check_required: false,
  })
  .await
  .unwrap();

  let op = orchestrator::create_single_update(
    &harness.state,
    "web",
    "1.25.3",
    false,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &op.operation_id,
    WAIT,
  )
  .await
  .unwrap();

  assert_eq!(done.status, OperationStatus::Complete);
  assert!(done.rollback_occurred);

  // Everything is back at the old version.
  assert_eq!(
    harness.compose_image(&compose, "web").await.as_deref(),
    Some("nginx:1.24.0")
  );
  assert_eq!(
    harness.docker.running_image("web").as_deref(),
    Some("nginx:1.24.0")
  );

  let log = db.list_update_log(Some("web"), 10).await.unwrap();
  let rollback = log
    .iter()
    .find(|entry| entry.operation == UpdateLogOperation::Rollback)
    .expect("rollback audit row");
  assert!(rollback.success);
}

#[tokio::test]
async fn health_failure_without_policy_fails_operation() {
  let harness = TestHarness::new().await;
  let compose = harness
    .add_service("frontend", "web", "web", "nginx:1.24.0", &[])
    .await;
  harness.registry.set_tags("nginx", &["1.24.0", "1.25.3"]);
  harness.docker.health_by_image.lock().unwrap().insert(
    String::from("nginx:1.25.3"),
    HealthState::Unhealthy,
  );

  let op = orchestrator::create_single_update(
    &harness.state,
    "web",
    "1.25.3",
    false,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &op.operation_id,
    WAIT,
  )
  .await
  .unwrap();

  assert_eq!(done.status, OperationStatus::Failed);
  assert!(!done.rollback_occurred);
  // No rollback: the compose file keeps the new tag, which the
  // next check reports as a mismatch.
  assert_eq!(
    harness.compose_image(&compose, "web").await.as_deref(),
    Some("nginx:1.25.3")
  );
}

#[tokio::test]
async fn same_stack_operations_are_serialized() {
  let harness = TestHarness::new().await;
  harness
    .add_service("shop", "web", "shop-web", "nginx:1.24.0", &[])
    .await;
  harness
    .add_service("shop", "api", "shop-api", "httpd:2.4.57", &[])
    .await;
  harness.registry.set_tags("nginx", &["1.24.0", "1.25.3"]);
  harness.registry.set_tags("httpd", &["2.4.57", "2.4.58"]);
  harness
    .docker
    .set_recreate_delay(Duration::from_millis(200));

  let first = orchestrator::create_single_update(
    &harness.state,
    "shop-web",
    "1.25.3",
    false,
  )
  .await
  .unwrap();
  tokio::time::sleep(Duration::from_millis(10)).await;
  let second = orchestrator::create_single_update(
    &harness.state,
    "shop-api",
    "2.4.58",
    false,
  )
  .await
  .unwrap();

  // While the first executes, exactly one row stays queued.
  tokio::time::sleep(Duration::from_millis(80)).await;
  let db = harness.state.db().unwrap();
  let queued = db.get_queued_updates().await.unwrap();
  assert_eq!(queued.len(), 1);
  assert_eq!(queued[0].operation_id, second.operation_id);

  let first_done = orchestrator::wait_terminal(
    &harness.state,
    &first.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  let second_done = orchestrator::wait_terminal(
    &harness.state,
    &second.operation_id,
    WAIT,
  )
  .await
  .unwrap();

  assert_eq!(first_done.status, OperationStatus::Complete);
  assert_eq!(second_done.status, OperationStatus::Complete);
  // The later operation only started after the earlier one
  // reached a terminal state.
  assert!(
    second_done.started_at.unwrap()
      >= first_done.completed_at.unwrap()
  );
}

#[tokio::test]
async fn pinned_container_rejects_blocked_target() {
  let harness = TestHarness::new().await;
  harness
    .add_service(
      "infra",
      "engine",
      "engine",
      "docker:20.10.0",
      &[("docksmith.version-pin-minor", "true")],
    )
    .await;
  harness
    .registry
    .set_tags("docker", &["20.10.0", "20.10.5", "20.11.0", "21.0.0"]);

  // The check classifies within the pin.
  let view = checker::run_cycle(&harness.state).await.unwrap();
  let engine = view
    .containers
    .iter()
    .find(|container| container.name == "engine")
    .unwrap();
  assert_eq!(engine.status, ContainerStatus::UpdateAvailable);
  assert_eq!(engine.latest_version.as_deref(), Some("20.10.5"));
  assert_eq!(engine.change_type, Some(ChangeType::Patch));

  // A target outside the pin is refused outright.
  let err = orchestrator::create_single_update(
    &harness.state,
    "engine",
    "20.11.0",
    false,
  )
  .await
  .unwrap_err();
  assert!(matches!(err, CoreError::PolicyBlock(_)));

  // And no operation was created for it.
  let db = harness.state.db().unwrap();
  let ops = db
    .list_update_operations(&Default::default())
    .await
    .unwrap();
  assert!(ops.is_empty());
}

#[tokio::test]
async fn fix_mismatch_realigns_to_compose() {
  let harness = TestHarness::new().await;
  let compose = harness
    .add_service("frontend", "web", "web", "nginx:1.24.0", &[])
    .await;
  harness.registry.set_tags("nginx", &["1.24.0"]);

  // Recreated out-of-band to a bare digest.
  {
    let mut containers =
      harness.docker.containers.lock().unwrap();
    let web = containers.get_mut("web").unwrap();
    web.image = String::from(
      "nginx@sha256:0000111122223333444455556666777788889999\
       aaaabbbbccccddddeeeeffff00001111",
    );
  }

  let view = checker::run_cycle(&harness.state).await.unwrap();
  let web = view
    .containers
    .iter()
    .find(|container| container.name == "web")
    .unwrap();
  assert_eq!(web.status, ContainerStatus::ComposeMismatch);

  let op = orchestrator::create_fix_mismatch(
    &harness.state,
    "web",
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &op.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(done.status, OperationStatus::Complete);

  assert_eq!(
    harness.docker.running_image("web").as_deref(),
    Some("nginx:1.24.0")
  );
  assert_eq!(
    harness.compose_image(&compose, "web").await.as_deref(),
    Some("nginx:1.24.0")
  );

  let view = checker::run_cycle(&harness.state).await.unwrap();
  let web = view
    .containers
    .iter()
    .find(|container| container.name == "web")
    .unwrap();
  assert!(matches!(
    web.status,
    ContainerStatus::UpToDate | ContainerStatus::UpToDatePinnable
  ));
}

#[tokio::test]
async fn batch_partial_failure_stays_per_stack() {
  let harness = TestHarness::new().await;
  let compose_a = harness
    .add_service("stack-a", "app", "app-a", "appa:1.0.0", &[])
    .await;
  let compose_b = harness
    .add_service("stack-b", "app", "app-b", "appb:1.0.0", &[])
    .await;
  harness.registry.set_tags("appa", &["1.0.0", "2.0.0"]);
  harness.registry.set_tags("appb", &["1.0.0", "2.0.0"]);
  harness
    .docker
    .pull_failures
    .lock()
    .unwrap()
    .insert(String::from("appa:2.0.0"));

  checker::run_cycle(&harness.state).await.unwrap();

  let items = vec![
    orchestrator::BatchItem {
      container: orchestrator::lookup_container(
        &harness.state,
        "app-a",
      )
      .await
      .unwrap(),
      target_version: String::from("2.0.0"),
      force: false,
      change_type: Some(ChangeType::Major),
    },
    orchestrator::BatchItem {
      container: orchestrator::lookup_container(
        &harness.state,
        "app-b",
      )
      .await
      .unwrap(),
      target_version: String::from("2.0.0"),
      force: false,
      change_type: Some(ChangeType::Major),
    },
  ];
  let (batch_group_id, ops) =
    orchestrator::create_batch_update(&harness.state, items)
      .await
      .unwrap();
  assert_eq!(ops.len(), 2);

  for op in &ops {
    let _ = orchestrator::wait_terminal(
      &harness.state,
      &op.operation_id,
      WAIT,
    )
    .await
    .unwrap();
  }

  let db = harness.state.db().unwrap();
  let siblings = db
    .get_update_operations_by_batch_group(&batch_group_id)
    .await
    .unwrap();
  assert_eq!(siblings.len(), 2);

  let failed = siblings
    .iter()
    .find(|op| op.stack_name == "stack-a")
    .unwrap();
  let complete = siblings
    .iter()
    .find(|op| op.stack_name == "stack-b")
    .unwrap();
  assert_eq!(failed.status, OperationStatus::Failed);
  assert_eq!(complete.status, OperationStatus::Complete);

  // Stack A failed in pulling_image: its compose is untouched.
  assert_eq!(
    harness.compose_image(&compose_a, "app").await.as_deref(),
    Some("appa:1.0.0")
  );
  // Stack B went through independently.
  assert_eq!(
    harness.compose_image(&compose_b, "app").await.as_deref(),
    Some("appb:2.0.0")
  );
  assert_eq!(
    harness.docker.running_image("app-b").as_deref(),
    Some("appb:2.0.0")
  );
}

#[tokio::test]
async fn pre_update_check_gate() {
  let harness = TestHarness::new().await;
  harness
    .add_service(
      "frontend",
      "web",
      "web",
      "nginx:1.24.0",
      &[("docksmith.pre-update-check", "/scripts/check.sh")],
    )
    .await;
  harness.registry.set_tags("nginx", &["1.24.0", "1.25.3"]);
  harness
    .docker
    .exec_failures
    .lock()
    .unwrap()
    .insert(String::from("/scripts/check.sh"));

  let op = orchestrator::create_single_update(
    &harness.state,
    "web",
    "1.25.3",
    false,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &op.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(done.status, OperationStatus::Failed);
  assert!(
    done
      .error_message
      .as_deref()
      .unwrap()
      .contains("Pre-update check failed")
  );
  // Nothing moved.
  assert_eq!(
    harness.docker.running_image("web").as_deref(),
    Some("nginx:1.24.0")
  );

  // force bypasses the gate.
  let op = orchestrator::create_single_update(
    &harness.state,
    "web",
    "1.25.3",
    true,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &op.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(done.status, OperationStatus::Complete);
}

#[tokio::test]
async fn restart_after_dependents_run_in_order() {
  let harness = TestHarness::new().await;
  harness
    .add_service(
      "frontend",
      "web",
      "web",
      "nginx:1.24.0",
      &[("docksmith.restart-after", "proxy,worker")],
    )
    .await;
  harness
    .add_service(
      "frontend",
      "proxy",
      "proxy",
      "caddy:2.7.0",
      &[],
    )
    .await;
  harness
    .add_service(
      "frontend",
      "worker",
      "worker",
      "workerd:1.0.0",
      &[],
    )
    .await;
  harness.registry.set_tags("nginx", &["1.24.0", "1.25.3"]);
  harness.registry.set_tags("caddy", &["2.7.0"]);
  harness.registry.set_tags("workerd", &["1.0.0"]);

  checker::run_cycle(&harness.state).await.unwrap();

  let op = orchestrator::create_single_update(
    &harness.state,
    "web",
    "1.25.3",
    false,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &op.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(done.status, OperationStatus::Complete);
  assert_eq!(done.dependents_affected, vec!["proxy", "worker"]);
}

#[tokio::test]
async fn dependency_cycle_fails_validation() {
  let harness = TestHarness::new().await;
  harness
    .add_service(
      "frontend",
      "a",
      "a",
      "appa:1.0.0",
      &[("docksmith.restart-after", "b")],
    )
    .await;
  harness
    .add_service(
      "frontend",
      "b",
      "b",
      "appb:1.0.0",
      &[("docksmith.restart-after", "a")],
    )
    .await;
  harness.registry.set_tags("appa", &["1.0.0", "2.0.0"]);
  harness.registry.set_tags("appb", &["1.0.0"]);

  checker::run_cycle(&harness.state).await.unwrap();

  let op = orchestrator::create_single_update(
    &harness.state,
    "a",
    "2.0.0",
    false,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &op.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(done.status, OperationStatus::Failed);
  assert_eq!(
    done.error_message.as_deref(),
    Some("dependency cycle")
  );
  // Failed in validation: nothing changed.
  assert_eq!(
    harness.docker.running_image("a").as_deref(),
    Some("appa:1.0.0")
  );
}

#[tokio::test]
async fn rollback_operation_restores_previous_version() {
  let harness = TestHarness::new().await;
  let compose = harness
    .add_service("frontend", "web", "web", "nginx:1.24.0", &[])
    .await;
  harness.registry.set_tags("nginx", &["1.24.0", "1.25.3"]);

  let update = orchestrator::create_single_update(
    &harness.state,
    "web",
    "1.25.3",
    false,
  )
  .await
  .unwrap();
  orchestrator::wait_terminal(
    &harness.state,
    &update.operation_id,
    WAIT,
  )
  .await
  .unwrap();

  let rollback = orchestrator::create_rollback(
    &harness.state,
    &update.operation_id,
    None,
    false,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &rollback.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(done.status, OperationStatus::Complete);

  assert_eq!(
    harness.compose_image(&compose, "web").await.as_deref(),
    Some("nginx:1.24.0")
  );
  assert_eq!(
    harness.docker.running_image("web").as_deref(),
    Some("nginx:1.24.0")
  );

  // The original operation is flagged.
  let db = harness.state.db().unwrap();
  let original = db
    .get_update_operation(&update.operation_id)
    .await
    .unwrap()
    .unwrap();
  assert!(original.rollback_occurred);
}

#[tokio::test]
async fn stop_and_remove_operations() {
  let harness = TestHarness::new().await;
  harness
    .add_service("frontend", "web", "web", "nginx:1.24.0", &[])
    .await;

  let stop = orchestrator::create_stop(
    &harness.state,
    "web",
    Some(5),
    None,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &stop.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(done.status, OperationStatus::Complete);
  assert_eq!(
    harness
      .docker
      .containers
      .lock()
      .unwrap()
      .get("web")
      .unwrap()
      .state,
    "exited"
  );

  let remove = orchestrator::create_remove(
    &harness.state,
    "web",
    false,
    false,
    None,
  )
  .await
  .unwrap();
  let done = orchestrator::wait_terminal(
    &harness.state,
    &remove.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(done.status, OperationStatus::Complete);
  assert!(
    harness
      .docker
      .containers
      .lock()
      .unwrap()
      .get("web")
      .is_none()
  );
}

#[tokio::test]
async fn cancel_queued_operation() {
  let harness = TestHarness::new().await;
  harness
    .add_service("shop", "web", "shop-web", "nginx:1.24.0", &[])
    .await;
  harness
    .add_service("shop", "api", "shop-api", "httpd:2.4.57", &[])
    .await;
  harness.registry.set_tags("nginx", &["1.24.0", "1.25.3"]);
  harness.registry.set_tags("httpd", &["2.4.57", "2.4.58"]);
  harness
    .docker
    .set_recreate_delay(Duration::from_millis(300));

  let first = orchestrator::create_single_update(
    &harness.state,
    "shop-web",
    "1.25.3",
    false,
  )
  .await
  .unwrap();
  let second = orchestrator::create_single_update(
    &harness.state,
    "shop-api",
    "2.4.58",
    false,
  )
  .await
  .unwrap();

  // Cancel the queued one before its worker picks it up.
  tokio::time::sleep(Duration::from_millis(50)).await;
  let cancelled = orchestrator::cancel_operation(
    &harness.state,
    &second.operation_id,
  )
  .await
  .unwrap();
  assert!(cancelled);

  let second_final = orchestrator::wait_terminal(
    &harness.state,
    &second.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(second_final.status, OperationStatus::Failed);
  assert_eq!(
    second_final.error_message.as_deref(),
    Some("cancelled")
  );

  let first_final = orchestrator::wait_terminal(
    &harness.state,
    &first.operation_id,
    WAIT,
  )
  .await
  .unwrap();
  assert_eq!(first_final.status, OperationStatus::Complete);
}

#[tokio::test]
async fn checker_classifies_local_and_ignored() {
  let harness = TestHarness::new().await;
  harness
    .add_service(
      "tools",
      "built",
      "built",
      "homebuilt:1.0.0",
      &[],
    )
    .await;
  harness
    .add_service(
      "tools",
      "skipped",
      "skipped",
      "nginx:1.24.0",
      &[("docksmith.ignore", "true")],
    )
    .await;
  // No tags registered for homebuilt -> registry NotFound.
  harness.registry.set_tags("nginx", &["1.24.0"]);

  let view = checker::run_cycle(&harness.state).await.unwrap();
  let by_name = |name: &str| {
    view
      .containers
      .iter()
      .find(|container| container.name == name)
      .unwrap()
      .clone()
  };
  assert_eq!(
    by_name("built").status,
    ContainerStatus::LocalImage
  );
  assert_eq!(
    by_name("skipped").status,
    ContainerStatus::Ignored
  );
}
