//! End-to-end scenarios for the Berth engine against the simulated runtime.
//!
//! Each test parses a document, drives the engine, and checks both the
//! operation result and what the runtime observed through its journal.
//! Time is paused so backoff and probe intervals run instantly.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use berth_common::config::OrchestratorConfig;
use berth_common::error::{BerthError, ServiceError};
use berth_common::types::ServiceState;
use berth_compose::model::Deployment;
use berth_compose::parser;
use berth_runtime::backend::memory::MemoryRuntime;
use berth_runtime::backend::{ContainerRuntime, ContainerStatus};
use berth_runtime::engine::{DownOptions, Engine, UpOptions};
use berth_runtime::report::{Outcome, ResourceAction, ResourceKind};
use tokio_util::sync::CancellationToken;

const STACK: &str = r"
services:
  frontend:
    image: shop/frontend:1
    ports: ['8080:80']
    depends_on: [backend]
  backend:
    image: shop/backend:1
    depends_on: [db]
    restart: on-failure
  db:
    image: postgres:16
    volumes:
      - data:/var/lib/postgresql/data
      - /scratch
volumes:
  data:
";

const DETACHED: UpOptions = UpOptions {
    detached: true,
    fail_fast: false,
};

fn deployment(document: &str) -> Deployment {
    parser::parse(document, "app").expect("document should parse")
}

fn engine() -> (Arc<MemoryRuntime>, Engine) {
    let rt = Arc::new(MemoryRuntime::new());
    let engine = Engine::new(
        Arc::clone(&rt) as Arc<dyn ContainerRuntime>,
        OrchestratorConfig::default(),
    );
    (rt, engine)
}

fn creates(rt: &MemoryRuntime) -> Vec<String> {
    rt.journal()
        .into_iter()
        .filter(|c| c.operation == "create_container")
        .map(|c| c.target)
        .collect()
}

fn state_of(result: &berth_runtime::report::OperationResult, service: &str) -> ServiceState {
    result.service(service).expect("service in report").state
}

// ── Ordering ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn up_creates_services_in_dependency_order() {
    let (rt, engine) = engine();
    let d = deployment(STACK);

    let result = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    assert_eq!(result.outcome(), Outcome::Success);
    assert_eq!(
        creates(&rt),
        vec!["app-db-1", "app-backend-1", "app-frontend-1"]
    );
    let names: Vec<&str> = result.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["db", "backend", "frontend"]);
    assert!(result.services.iter().all(|s| s.state == ServiceState::Healthy));

    let created: Vec<(ResourceKind, &str)> = result
        .resources
        .iter()
        .filter(|r| r.action == ResourceAction::Created)
        .map(|r| (r.kind, r.name.as_str()))
        .collect();
    assert_eq!(
        created,
        vec![
            (ResourceKind::Network, "app_default"),
            (ResourceKind::Volume, "app_data"),
        ]
    );
    assert!(rt.volume_names().contains(&"app-db-1-anon-0".to_string()));
}

#[tokio::test(start_paused = true)]
async fn cyclic_deployment_fails_before_any_runtime_call() {
    let (rt, engine) = engine();
    let mut d = deployment(STACK);
    let db = d
        .services
        .iter_mut()
        .find(|s| s.name == "db")
        .expect("db");
    let _ = db.depends_on.insert("frontend".into());

    let err = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect_err("cycle");
    match err {
        BerthError::CyclicDependency { cycle } => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"db".to_string()));
        }
        other => panic!("expected cycle, got {other}"),
    }
    assert!(rt.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ps_during_up_shows_dependents_waiting() {
    let (rt, engine) = engine();
    rt.delay_start("db", Duration::from_secs(10));
    let engine = Arc::new(engine);
    let d = Arc::new(deployment(STACK));

    let up = tokio::spawn({
        let engine = Arc::clone(&engine);
        let d = Arc::clone(&d);
        async move { engine.up(&d, DETACHED, &CancellationToken::new()).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let ps = engine.ps(&d).await.expect("ps");
    let states: Vec<(&str, ServiceState)> =
        ps.iter().map(|r| (r.name.as_str(), r.state)).collect();
    assert_eq!(
        states,
        vec![
            ("db", ServiceState::Starting),
            ("backend", ServiceState::Planned),
            ("frontend", ServiceState::Planned),
        ]
    );
    assert_eq!(creates(&rt), vec!["app-db-1"]);

    let result = up.await.expect("join").expect("up");
    assert_eq!(result.outcome(), Outcome::Success);
}

#[tokio::test(start_paused = true)]
async fn ps_without_engine_state_reads_the_runtime() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    let fresh = Engine::new(
        Arc::clone(&rt) as Arc<dyn ContainerRuntime>,
        OrchestratorConfig::default(),
    );
    let ps = fresh.ps(&d).await.expect("ps");
    assert!(ps.iter().all(|r| r.state == ServiceState::Running));
    assert!(ps.iter().all(|r| r.handle.is_some()));
}

// ── Restart policy and health ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn on_failure_create_exhausts_five_attempts() {
    let (rt, engine) = engine();
    rt.fail_create("backend");
    let d = deployment(STACK);

    let result = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    let backend_creates = creates(&rt)
        .into_iter()
        .filter(|c| c == "app-backend-1")
        .count();
    assert_eq!(backend_creates, 5);

    let backend = result.service("backend").expect("backend");
    assert_eq!(backend.state, ServiceState::Failed);
    assert_eq!(backend.attempts, 5);
    assert!(matches!(backend.error, Some(ServiceError::Create { .. })));

    let frontend = result.service("frontend").expect("frontend");
    assert_eq!(frontend.state, ServiceState::Failed);
    assert_eq!(
        frontend.error,
        Some(ServiceError::DependencyFailed {
            dependency: "backend".into()
        })
    );
    assert!(!creates(&rt).contains(&"app-frontend-1".to_string()));
    assert_eq!(state_of(&result, "db"), ServiceState::Healthy);
    assert_eq!(result.outcome(), Outcome::PartialFailure);
}

#[tokio::test(start_paused = true)]
async fn transient_start_failure_recovers() {
    let (rt, engine) = engine();
    rt.fail_start_times("backend", 2);
    let d = deployment(STACK);

    let result = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    assert_eq!(result.outcome(), Outcome::Success);
    assert_eq!(result.service("backend").expect("backend").attempts, 3);
}

const PROBED: &str = r"
services:
  api:
    image: api:1
    depends_on: [db]
  db:
    image: postgres:16
    healthcheck:
      log: ready to accept connections
      interval: 1s
      timeout: 5s
";

#[tokio::test(start_paused = true)]
async fn health_probe_gates_dependents() {
    let (rt, engine) = engine();
    rt.boot_logs("db", &["database system is ready to accept connections"]);
    let d = deployment(PROBED);

    let result = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    assert_eq!(result.outcome(), Outcome::Success);
    assert_eq!(creates(&rt), vec!["app-db-1", "app-api-1"]);
}

#[tokio::test(start_paused = true)]
async fn health_timeout_holds_dependents_back() {
    let (rt, engine) = engine();
    let d = deployment(PROBED);

    let result = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    assert_eq!(
        result.service("db").expect("db").error,
        Some(ServiceError::HealthTimeout {
            timeout: Duration::from_secs(5)
        })
    );
    assert_eq!(state_of(&result, "api"), ServiceState::Failed);
    assert_eq!(creates(&rt), vec!["app-db-1"]);
    assert_eq!(rt.calls("start"), 1);
}

// ── Volumes and teardown ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn named_volume_survives_down_and_is_reused() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    let down = engine
        .down(&d, DownOptions::default(), &CancellationToken::new())
        .await
        .expect("down");
    assert_eq!(down.outcome(), Outcome::Success);
    assert!(rt.container_names().is_empty());
    assert!(rt.network_names().is_empty());
    assert_eq!(rt.volume_names(), vec!["app_data"]);
    assert!(down.services.iter().all(|s| s.state == ServiceState::Removed));
    assert!(
        down.resources
            .iter()
            .any(|r| r.name == "app_data" && r.action == ResourceAction::Preserved)
    );

    let again = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("second up");
    assert!(
        again
            .resources
            .iter()
            .any(|r| r.name == "app_data" && r.action == ResourceAction::Reused)
    );
    assert_eq!(again.outcome(), Outcome::Success);
}

#[tokio::test(start_paused = true)]
async fn purge_removes_named_volumes() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    let down = engine
        .down(
            &d,
            DownOptions {
                purge_volumes: true,
            },
            &CancellationToken::new(),
        )
        .await
        .expect("down");
    assert_eq!(down.outcome(), Outcome::Success);
    assert!(rt.volume_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn volume_purged_by_another_engine_is_recreated() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");
    let _ = engine
        .down(&d, DownOptions::default(), &CancellationToken::new())
        .await
        .expect("down");
    assert_eq!(rt.volume_names(), vec!["app_data"]);

    let other = Engine::new(
        Arc::clone(&rt) as Arc<dyn ContainerRuntime>,
        OrchestratorConfig::default(),
    );
    let purged = other
        .down(
            &d,
            DownOptions {
                purge_volumes: true,
            },
            &CancellationToken::new(),
        )
        .await
        .expect("purge");
    assert_eq!(purged.outcome(), Outcome::Success);
    assert!(rt.volume_names().is_empty());

    let again = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("second up");
    assert_eq!(again.outcome(), Outcome::Success);
    assert!(
        again
            .resources
            .iter()
            .any(|r| r.name == "app_data" && r.action == ResourceAction::Created)
    );
    assert!(rt.volume_names().contains(&"app_data".to_string()));
    assert_eq!(state_of(&again, "db"), ServiceState::Healthy);
}

#[tokio::test(start_paused = true)]
async fn down_by_a_fresh_engine_uses_the_runtime_snapshot() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    let fresh = Engine::new(
        Arc::clone(&rt) as Arc<dyn ContainerRuntime>,
        OrchestratorConfig::default(),
    );
    let down = fresh
        .down(&d, DownOptions::default(), &CancellationToken::new())
        .await
        .expect("down");
    assert_eq!(down.outcome(), Outcome::Success);
    assert!(rt.container_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_containers_and_up_restarts_them() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    let stopped = engine
        .stop(&d, &CancellationToken::new())
        .await
        .expect("stop");
    assert!(stopped.services.iter().all(|s| s.state == ServiceState::Stopped));
    assert_eq!(
        rt.container_status("app-db-1"),
        Some(ContainerStatus::Exited { code: Some(0) })
    );

    let again = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("second up");
    assert_eq!(again.outcome(), Outcome::Success);
    assert_eq!(creates(&rt).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn dead_container_is_replaced_by_the_next_up() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");
    rt.mark_dead("backend");

    let again = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("second up");

    assert_eq!(again.outcome(), Outcome::Success);
    assert_eq!(state_of(&again, "backend"), ServiceState::Healthy);
    assert_eq!(state_of(&again, "frontend"), ServiceState::Healthy);
    assert_eq!(again.service("backend").expect("backend").attempts, 2);
    assert_eq!(rt.calls("remove"), 1);
    assert_eq!(
        creates(&rt),
        vec!["app-db-1", "app-backend-1", "app-frontend-1", "app-backend-1"]
    );
    assert_eq!(
        rt.container_status("app-backend-1"),
        Some(ContainerStatus::Running)
    );
}

// ── Fail-fast, cancellation, fatal errors ────────────────────────────

#[tokio::test(start_paused = true)]
async fn fail_fast_rolls_back_what_it_created() {
    let (rt, engine) = engine();
    rt.fail_create("backend");
    let d = deployment(STACK);

    let result = engine
        .up(
            &d,
            UpOptions {
                detached: true,
                fail_fast: true,
            },
            &CancellationToken::new(),
        )
        .await
        .expect("up");

    assert_eq!(result.outcome(), Outcome::PartialFailure);
    assert_eq!(state_of(&result, "backend"), ServiceState::Failed);
    assert_eq!(state_of(&result, "db"), ServiceState::Removed);
    assert!(rt.container_names().is_empty());
    assert!(rt.network_names().is_empty());
    assert!(rt.volume_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fail_fast_leaves_preexisting_containers_alone() {
    let (rt, engine) = engine();
    let first = deployment("services:\n  a:\n    image: a:1\n");
    let _ = engine
        .up(&first, DETACHED, &CancellationToken::new())
        .await
        .expect("first up");

    rt.fail_create("b");
    let second = deployment("services:\n  a:\n    image: a:1\n  b:\n    image: b:1\n");
    let result = engine
        .up(
            &second,
            UpOptions {
                detached: true,
                fail_fast: true,
            },
            &CancellationToken::new(),
        )
        .await
        .expect("second up");

    assert_eq!(state_of(&result, "b"), ServiceState::Failed);
    assert_eq!(
        rt.container_status("app-a-1"),
        Some(ContainerStatus::Running)
    );
    assert_eq!(rt.network_names(), vec!["app_default"]);
    assert_eq!(creates(&rt), vec!["app-a-1", "app-b-1"]);
}

#[tokio::test(start_paused = true)]
async fn foreground_up_stops_services_on_cancel() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    drop(tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    }));

    let result = engine
        .up(&d, UpOptions::default(), &cancel)
        .await
        .expect("up");

    assert!(result.services.iter().all(|s| s.state == ServiceState::Stopped));
    assert_eq!(rt.container_names().len(), 3);
    assert_eq!(rt.calls("remove"), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_down_finishes_the_current_stop_and_goes_no_further() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");
    rt.delay_stop("frontend", Duration::from_secs(4));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    drop(tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    }));

    let result = engine
        .down(&d, DownOptions::default(), &cancel)
        .await
        .expect("down");

    assert!(result.cancelled);
    assert_eq!(result.outcome(), Outcome::PartialFailure);
    assert_eq!(state_of(&result, "frontend"), ServiceState::Stopped);
    assert_eq!(
        rt.container_status("app-frontend-1"),
        Some(ContainerStatus::Exited { code: Some(0) })
    );
    assert_eq!(
        rt.container_status("app-backend-1"),
        Some(ContainerStatus::Running)
    );
    assert_eq!(rt.container_names().len(), 3);
    assert_eq!(rt.calls("stop"), 1);
    assert_eq!(rt.calls("kill"), 0);
    assert_eq!(rt.calls("remove"), 0);
    assert_eq!(rt.network_names(), vec!["app_default"]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_stop_leaves_later_services_running() {
    let (rt, engine) = engine();
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = engine.stop(&d, &cancel).await.expect("stop");

    assert!(result.cancelled);
    assert_eq!(rt.calls("stop"), 0);
    assert_eq!(
        rt.container_status("app-db-1"),
        Some(ContainerStatus::Running)
    );
}

#[tokio::test(start_paused = true)]
async fn unavailable_runtime_is_fatal() {
    let (rt, engine) = engine();
    rt.set_unavailable(true);
    let d = deployment(STACK);

    let err = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect_err("fatal");
    assert!(matches!(err, BerthError::RuntimeUnavailable { .. }));
    assert_eq!(rt.calls("create_container"), 0);
}

// ── Logs ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn logs_replay_a_service_backlog() {
    let (rt, engine) = engine();
    rt.boot_logs("db", &["initializing", "ready"]);
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    let lines: Vec<String> = engine
        .logs(&d, "db", false)
        .await
        .expect("logs")
        .collect()
        .await
        .into_iter()
        .map(|l| l.text)
        .collect();
    assert_eq!(lines, vec!["initializing", "ready"]);

    let again = engine
        .logs(&d, "db", false)
        .await
        .expect("logs again")
        .collect()
        .await;
    assert_eq!(again.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn logs_for_unknown_service_or_missing_container() {
    let (_rt, engine) = engine();
    let d = deployment(STACK);

    let unknown = engine.logs(&d, "cache", false).await.expect_err("unknown");
    assert!(matches!(unknown, BerthError::NotFound { kind: "service", .. }));

    let missing = engine.logs(&d, "db", false).await.expect_err("missing");
    assert!(matches!(missing, BerthError::NotFound { kind: "container", .. }));
}

#[tokio::test(start_paused = true)]
async fn attach_multiplexes_followed_output() {
    let (rt, engine) = engine();
    rt.boot_logs("db", &["ready"]);
    let d = deployment(STACK);
    let _ = engine
        .up(&d, DETACHED, &CancellationToken::new())
        .await
        .expect("up");

    let mut stream = engine.attach(&d).await.expect("attach");
    let first = stream.next().await.expect("backlog line");
    assert_eq!(first.to_string(), "db | ready");

    rt.write_log("backend", "listening on :8000");
    let second = stream.next().await.expect("live line");
    assert_eq!(second.to_string(), "backend | listening on :8000");
}
