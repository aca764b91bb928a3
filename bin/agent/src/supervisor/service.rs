use std::{
  collections::HashMap,
  sync::Arc,
  time::Duration,
};

use armada_client::entities::{
  Service, ServiceState, ServiceStateKind,
};
use tokio::{
  sync::watch,
  task::JoinHandle,
  time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::{
  engine::{
    APPLICATION_LABEL, ContainerEngine, MANAGED_LABEL,
    RELEASE_LABEL, SERVICE_LABEL, SPEC_HASH_LABEL,
    service_label_filters,
  },
  reporter::Reporter,
  validators::Validator,
};

const RECONCILE_TICK: Duration = Duration::from_secs(1);

/// What one service supervisor is converging toward.
/// Equivalence was already decided by the application supervisor, so
/// a new target on the same supervisor only ever changes the release.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
  pub release: String,
  pub service: Service,
  pub spec_hash: String,
}

/// Handle owned by the application supervisor.
pub struct ServiceHandle {
  target: watch::Sender<ServiceTarget>,
  spec_hash: String,
  cancel: CancellationToken,
  worker: JoinHandle<()>,
}

impl ServiceHandle {
  pub fn spec_hash(&self) -> &str {
    &self.spec_hash
  }

  /// Retarget to a new release of an equivalent spec.
  /// Also wakes the worker for an immediate reconcile pass.
  pub fn set(
    &mut self,
    release: &str,
    service: &Service,
    spec_hash: String,
  ) {
    self.spec_hash = spec_hash.clone();
    self.target.send_replace(ServiceTarget {
      release: release.to_string(),
      service: service.clone(),
      spec_hash,
    });
  }

  /// Cancel the worker and await its teardown.
  pub async fn stop(self) {
    self.cancel.cancel();
    self.worker.await.ok();
  }
}

pub fn spawn_service_supervisor(
  supervisor: ServiceSupervisor,
  release: &str,
  service: &Service,
  spec_hash: String,
) -> ServiceHandle {
  let (target_tx, target_rx) = watch::channel(ServiceTarget {
    release: release.to_string(),
    service: service.clone(),
    spec_hash: spec_hash.clone(),
  });
  let cancel = CancellationToken::new();
  let worker =
    tokio::spawn(supervisor.run(target_rx, cancel.clone()));
  ServiceHandle {
    target: target_tx,
    spec_hash,
    cancel,
    worker,
  }
}

/// One worker per (application, service). Reconciles one container
/// toward one release on a short tick, with edge wake ups when the
/// target changes. Engine errors are retried on the next tick,
/// validator failures are sticky until the spec changes, and
/// cancellation tears the managed container down.
pub struct ServiceSupervisor {
  application: String,
  name: String,
  engine: Arc<dyn ContainerEngine>,
  reporter: Arc<Reporter>,
  validators: Arc<Vec<Box<dyn Validator>>>,
  stop_grace: Duration,
}

impl ServiceSupervisor {
  pub fn new(
    application: impl Into<String>,
    name: impl Into<String>,
    engine: Arc<dyn ContainerEngine>,
    reporter: Arc<Reporter>,
    validators: Arc<Vec<Box<dyn Validator>>>,
    stop_grace: Duration,
  ) -> ServiceSupervisor {
    ServiceSupervisor {
      application: application.into(),
      name: name.into(),
      engine,
      reporter,
      validators,
      stop_grace,
    }
  }

  async fn run(
    self,
    mut target: watch::Receiver<ServiceTarget>,
    cancel: CancellationToken,
  ) {
    let mut ticker = interval(RECONCILE_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          self.teardown().await;
          return;
        }
        _ = ticker.tick() => {}
        changed = target.changed() => {
          if changed.is_err() {
            // Sender dropped, the supervisor is orphaned.
            self.teardown().await;
            return;
          }
        }
      }
      let current = target.borrow_and_update().clone();
      tokio::select! {
        _ = cancel.cancelled() => {
          self.teardown().await;
          return;
        }
        res = self.reconcile(&current) => {
          if let Err(e) = res {
            warn!(
              "reconcile failed for {}/{} | {e:#}",
              self.application, self.name
            );
          }
        }
      }
    }
  }

  /// One reconcile pass toward the target.
  pub(crate) async fn reconcile(
    &self,
    target: &ServiceTarget,
  ) -> anyhow::Result<()> {
    // Validators veto before any engine work. The failure is sticky
    // until the spec changes, and the reporter dedups repeats.
    for validator in self.validators.iter() {
      if let Err(message) = validator.validate(&target.service) {
        debug!(
          "validator {} rejected {}/{}: {message}",
          validator.name(),
          self.application,
          self.name
        );
        self.reporter.set_service_state(
          &self.name,
          ServiceState::errored(ServiceStateKind::Exited, message),
        );
        return Ok(());
      }
    }

    let containers = self
      .engine
      .list_containers(&service_label_filters(
        &self.application,
        &self.name,
      ))
      .await?;

    // Spec equivalence wins over release identity: a container with
    // the current spec hash is kept, everything else is stopped and
    // removed before the new cycle starts.
    let mut matching = None;
    let mut stale = Vec::new();
    for container in containers {
      if matching.is_none()
        && container.label(SPEC_HASH_LABEL) == target.spec_hash
      {
        matching = Some(container);
      } else {
        stale.push(container);
      }
    }
    for container in stale {
      info!(
        "replacing container {} of {}/{}",
        container.name, self.application, self.name
      );
      self
        .engine
        .stop_container(&container.id, self.stop_grace)
        .await?;
      self.engine.remove_container(&container.id).await?;
      self.reporter.set_service_state(
        &self.name,
        ServiceState::new(ServiceStateKind::Stopped),
      );
    }

    let Some(existing) = matching else {
      self.reporter.set_service_state(
        &self.name,
        ServiceState::new(ServiceStateKind::Pulling),
      );
      self.engine.pull_image(&target.service.image).await?;
      let id = self
        .engine
        .create_container(
          &self.container_name(),
          &target.service,
          self.container_labels(target),
        )
        .await?;
      self.reporter.set_service_state(
        &self.name,
        ServiceState::new(ServiceStateKind::Created),
      );
      self.engine.start_container(&id).await?;
      // Running is reported once observed on a following tick.
      return Ok(());
    };

    match existing.state {
      ServiceStateKind::Running => {
        self.reporter.set_service_state(
          &self.name,
          ServiceState::new(ServiceStateKind::Running),
        );
        self
          .reporter
          .set_service_status(&self.name, &target.release);
      }
      ServiceStateKind::Exited => {
        self.reporter.set_service_state(
          &self.name,
          ServiceState::new(ServiceStateKind::Exited),
        );
        self.engine.start_container(&existing.id).await?;
      }
      _ => {
        self.engine.start_container(&existing.id).await?;
      }
    }
    Ok(())
  }

  /// Stop and remove every container belonging to this
  /// (application, service). Runs on cancellation, so failures can
  /// only be logged.
  async fn teardown(&self) {
    let containers = match self
      .engine
      .list_containers(&service_label_filters(
        &self.application,
        &self.name,
      ))
      .await
    {
      Ok(containers) => containers,
      Err(e) => {
        warn!(
          "failed to list containers tearing down {}/{} | {e:#}",
          self.application, self.name
        );
        return;
      }
    };
    for container in containers {
      let stopped = self
        .engine
        .stop_container(&container.id, self.stop_grace)
        .await;
      if let Err(e) = stopped {
        warn!(
          "failed to stop {} tearing down {}/{} | {e:#}",
          container.name, self.application, self.name
        );
      }
      let removed =
        self.engine.remove_container(&container.id).await;
      if let Err(e) = removed {
        warn!(
          "failed to remove {} tearing down {}/{} | {e:#}",
          container.name, self.application, self.name
        );
      }
    }
  }

  fn container_name(&self) -> String {
    let nonce: u32 = rand::random();
    sanitize_name(&format!(
      "armada-{}-{}-{nonce:08x}",
      self.application, self.name
    ))
  }

  fn container_labels(
    &self,
    target: &ServiceTarget,
  ) -> HashMap<String, String> {
    HashMap::from([
      (MANAGED_LABEL.to_string(), String::from("true")),
      (APPLICATION_LABEL.to_string(), self.application.clone()),
      (SERVICE_LABEL.to_string(), self.name.clone()),
      (RELEASE_LABEL.to_string(), target.release.clone()),
      (SPEC_HASH_LABEL.to_string(), target.spec_hash.clone()),
    ])
  }
}

/// Docker container names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
fn sanitize_name(name: &str) -> String {
  name
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
        c
      } else {
        '-'
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;
  use crate::{
    testing::{EngineEvent, FakeControlPlane, FakeEngine},
    validators::default_validators,
    variables::Variables,
  };

  fn supervisor(
    engine: Arc<FakeEngine>,
    validators: Arc<Vec<Box<dyn Validator>>>,
  ) -> (ServiceSupervisor, Arc<Reporter>, Arc<FakeControlPlane>) {
    let api = Arc::new(FakeControlPlane::default());
    let reporter = Reporter::new("app_1", api.clone());
    let supervisor = ServiceSupervisor::new(
      "app_1",
      "web",
      engine,
      reporter.clone(),
      validators,
      Duration::from_secs(30),
    );
    (supervisor, reporter, api)
  }

  fn no_validators() -> Arc<Vec<Box<dyn Validator>>> {
    default_validators(
      Variables::init(PathBuf::from("/does/not/exist")).unwrap(),
    )
  }

  fn target(release: &str, service: &Service) -> ServiceTarget {
    ServiceTarget {
      release: release.to_string(),
      service: service.clone(),
      spec_hash: service.spec_hash(),
    }
  }

  fn nginx() -> Service {
    Service {
      image: String::from("nginx:1.27"),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn fresh_service_pulls_creates_starts() {
    let engine = Arc::new(FakeEngine::default());
    let (supervisor, reporter, api) =
      supervisor(engine.clone(), no_validators());
    let service = nginx();

    supervisor.reconcile(&target("rel_1", &service)).await.unwrap();
    let events = engine.events();
    assert!(
      matches!(&events[0], EngineEvent::Pull(image) if image == "nginx:1.27")
    );
    assert!(matches!(&events[1], EngineEvent::Create(_)));
    assert!(matches!(&events[2], EngineEvent::Start(_)));

    // Next pass observes it running and reports the release.
    supervisor.reconcile(&target("rel_1", &service)).await.unwrap();
    reporter.service_status_sweep().await;
    assert_eq!(api.service_status_calls().len(), 1);
    reporter.stop().await;
  }

  #[tokio::test]
  async fn validator_veto_never_reaches_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("disable-custom-commands"), "")
      .unwrap();
    let validators = default_validators(
      Variables::init(dir.path().to_path_buf()).unwrap(),
    );
    let engine = Arc::new(FakeEngine::default());
    let (supervisor, reporter, api) =
      supervisor(engine.clone(), validators);

    let mut service = nginx();
    service.command = vec![String::from("nginx-debug")];
    supervisor.reconcile(&target("rel_1", &service)).await.unwrap();

    assert!(engine.events().is_empty());
    reporter.service_state_sweep().await;
    let calls = api.service_state_calls();
    assert_eq!(calls.len(), 1);
    let crate::testing::ApiCall::ServiceState { state, .. } =
      &calls[0]
    else {
      panic!("expected service state call");
    };
    assert_eq!(state.state, ServiceStateKind::Exited);
    assert_eq!(
      state.error_message,
      "custom commands are disabled on this device"
    );
    reporter.stop().await;
  }

  #[tokio::test]
  async fn spec_change_stops_old_before_starting_new() {
    let engine = Arc::new(FakeEngine::default());
    let (supervisor, reporter, _api) =
      supervisor(engine.clone(), no_validators());
    let service = nginx();
    supervisor.reconcile(&target("rel_1", &service)).await.unwrap();
    supervisor.reconcile(&target("rel_1", &service)).await.unwrap();
    let old_id = engine.running()[0].id.clone();
    engine.clear_events();

    let mut changed = nginx();
    changed.env.insert(String::from("A"), String::from("1"));
    supervisor.reconcile(&target("rel_2", &changed)).await.unwrap();

    let events = engine.events();
    assert_eq!(events[0], EngineEvent::Stop(old_id.clone()));
    assert_eq!(events[1], EngineEvent::Remove(old_id));
    assert!(
      matches!(&events[2], EngineEvent::Pull(image) if image == "nginx:1.27")
    );
    assert!(matches!(&events[3], EngineEvent::Create(_)));
    assert!(matches!(&events[4], EngineEvent::Start(_)));
    reporter.stop().await;
  }

  #[tokio::test]
  async fn release_change_with_equivalent_spec_keeps_container() {
    let engine = Arc::new(FakeEngine::default());
    let (supervisor, reporter, api) =
      supervisor(engine.clone(), no_validators());
    let service = nginx();
    supervisor.reconcile(&target("rel_1", &service)).await.unwrap();
    engine.clear_events();

    // Same spec, new release: no engine writes, status carries the
    // new release.
    supervisor.reconcile(&target("rel_2", &service)).await.unwrap();
    assert!(engine.events().is_empty());
    reporter.service_status_sweep().await;
    assert_eq!(
      api.service_status_calls().last().unwrap(),
      &crate::testing::ApiCall::ServiceStatus {
        application: String::from("app_1"),
        service: String::from("web"),
        release: String::from("rel_2"),
      }
    );
    reporter.stop().await;
  }

  #[tokio::test]
  async fn engine_errors_are_returned_for_retry() {
    let engine = Arc::new(FakeEngine::default());
    let (supervisor, reporter, _api) =
      supervisor(engine.clone(), no_validators());
    engine.fail_next_calls(1);
    let service = nginx();
    assert!(
      supervisor.reconcile(&target("rel_1", &service)).await.is_err()
    );
    // The pull failed before any container was created.
    assert!(engine.containers.lock().unwrap().is_empty());

    // Next pass succeeds.
    supervisor.reconcile(&target("rel_1", &service)).await.unwrap();
    assert!(!engine.containers.lock().unwrap().is_empty());
    reporter.stop().await;
  }

  #[tokio::test]
  async fn teardown_removes_managed_containers() {
    let engine = Arc::new(FakeEngine::default());
    let (supervisor, reporter, _api) =
      supervisor(engine.clone(), no_validators());
    let service = nginx();
    supervisor.reconcile(&target("rel_1", &service)).await.unwrap();
    assert!(!engine.containers.lock().unwrap().is_empty());

    supervisor.teardown().await;
    assert!(engine.containers.lock().unwrap().is_empty());
    reporter.stop().await;
  }

  #[test]
  fn container_names_are_docker_safe() {
    assert_eq!(
      sanitize_name("armada-app 1/web-00ff00ff"),
      "armada-app-1-web-00ff00ff"
    );
  }
}
