use std::{
  collections::HashMap,
  sync::{Arc, Mutex, RwLock},
  time::Duration,
};

use armada_client::{
  ControlPlane,
  entities::{ApplicationStatus, ServiceState, ServiceStatus},
};
use tokio::{
  task::JoinHandle,
  time::{MissedTickBehavior, interval, timeout},
};
use tokio_util::sync::CancellationToken;

const REPORT_TIMEOUT: Duration = Duration::from_secs(60);
const REPORTER_TICK: Duration = Duration::from_secs(1);

#[derive(Default)]
struct ReporterState {
  desired_release: String,
  /// Names of the services in the desired release, in bundle order.
  desired_services: Vec<String>,
  service_statuses: HashMap<String, ServiceStatus>,
  reported_service_statuses: HashMap<String, ServiceStatus>,
  service_states: HashMap<String, ServiceState>,
  reported_service_states: HashMap<String, ServiceState>,
  reported_release: Option<String>,
}

/// Publishes application release, service status, and service state
/// facts upstream for one application by diffing desired against
/// reported state. The application release only advances once every
/// service in the desired set has reported that release.
///
/// Three independent tick loops do the publishing. They start lazily
/// on the first [Reporter::set_desired_application] and run until
/// [Reporter::stop].
pub struct Reporter {
  application: String,
  api: Arc<dyn ControlPlane>,
  state: RwLock<ReporterState>,
  cancel: CancellationToken,
  loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Reporter {
  pub fn new(
    application: impl Into<String>,
    api: Arc<dyn ControlPlane>,
  ) -> Arc<Reporter> {
    Arc::new(Reporter {
      application: application.into(),
      api,
      state: Default::default(),
      cancel: CancellationToken::new(),
      loops: Default::default(),
    })
  }

  /// Must be called only after the service supervisors have been
  /// retargeted, so the quorum set matches what is actually running.
  pub fn set_desired_application(
    self: &Arc<Self>,
    release: &str,
    services: Vec<String>,
  ) {
    {
      let mut state = self.state.write().unwrap();
      state.desired_release = release.to_string();
      state.desired_services = services;
    }
    self.ensure_loops_started();
  }

  pub fn set_service_status(&self, service: &str, release: &str) {
    let mut state = self.state.write().unwrap();
    state.service_statuses.insert(
      service.to_string(),
      ServiceStatus {
        current_release_id: release.to_string(),
      },
    );
  }

  pub fn set_service_state(
    &self,
    service: &str,
    service_state: ServiceState,
  ) {
    let mut state = self.state.write().unwrap();
    state
      .service_states
      .insert(service.to_string(), service_state);
  }

  fn ensure_loops_started(self: &Arc<Self>) {
    let mut loops = self.loops.lock().unwrap();
    if !loops.is_empty() || self.cancel.is_cancelled() {
      return;
    }
    debug!("starting reporter loops for {}", self.application);
    let reporter = self.clone();
    loops.push(tokio::spawn(async move {
      let mut ticker = interval(REPORTER_TICK);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = reporter.cancel.cancelled() => return,
          _ = ticker.tick() => {}
        }
        reporter.application_status_sweep().await;
      }
    }));
    let reporter = self.clone();
    loops.push(tokio::spawn(async move {
      let mut ticker = interval(REPORTER_TICK);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = reporter.cancel.cancelled() => return,
          _ = ticker.tick() => {}
        }
        reporter.service_status_sweep().await;
      }
    }));
    let reporter = self.clone();
    loops.push(tokio::spawn(async move {
      let mut ticker = interval(REPORTER_TICK);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = reporter.cancel.cancelled() => return,
          _ = ticker.tick() => {}
        }
        reporter.service_state_sweep().await;
      }
    }));
  }

  /// Publishes the application release once the quorum gate passes:
  /// every desired service has reported the desired release.
  pub(crate) async fn application_status_sweep(&self) {
    let desired = {
      let state = self.state.read().unwrap();
      if state.desired_release.is_empty() {
        return;
      }
      if state.reported_release.as_deref()
        == Some(state.desired_release.as_str())
      {
        return;
      }
      // The gate requires the desired release to be both observed
      // and already published for every desired service, so the
      // application status can never overtake a service status.
      let all_reached =
        state.desired_services.iter().all(|name| {
          let observed =
            state.service_statuses.get(name).is_some_and(|status| {
              status.current_release_id == state.desired_release
            });
          let published = state
            .reported_service_statuses
            .get(name)
            .is_some_and(|status| {
              status.current_release_id == state.desired_release
            });
          observed && published
        });
      if !all_reached {
        return;
      }
      state.desired_release.clone()
    };
    let status = ApplicationStatus {
      current_release_id: desired.clone(),
    };
    let publish = self
      .api
      .set_device_application_status(&self.application, &status);
    match timeout(REPORT_TIMEOUT, publish).await {
      Ok(Ok(())) => {
        self.state.write().unwrap().reported_release = Some(desired);
      }
      Ok(Err(e)) => warn!(
        "failed to report application status for {} | {e:#}",
        self.application
      ),
      Err(_) => warn!(
        "timed out reporting application status for {}",
        self.application
      ),
    }
  }

  /// Publishes every service status which differs from the committed
  /// snapshot. A failed publish ends the sweep, and only the entries
  /// actually published are committed, so the rest stay dirty for the
  /// next tick.
  pub(crate) async fn service_status_sweep(&self) {
    let diff = {
      let state = self.state.read().unwrap();
      state
        .service_statuses
        .iter()
        .filter(|(name, status)| {
          state.reported_service_statuses.get(*name) != Some(*status)
        })
        .map(|(name, status)| (name.clone(), status.clone()))
        .collect::<Vec<_>>()
    };
    let mut published = Vec::new();
    for (name, status) in diff {
      let publish = self.api.set_device_service_status(
        &self.application,
        &name,
        &status,
      );
      match timeout(REPORT_TIMEOUT, publish).await {
        Ok(Ok(())) => published.push((name, status)),
        Ok(Err(e)) => {
          warn!(
            "failed to report service status for {}/{name} | {e:#}",
            self.application
          );
          break;
        }
        Err(_) => {
          warn!(
            "timed out reporting service status for {}/{name}",
            self.application
          );
          break;
        }
      }
    }
    if published.is_empty() {
      return;
    }
    let mut state = self.state.write().unwrap();
    for (name, status) in published {
      state.reported_service_statuses.insert(name, status);
    }
  }

  /// Same shape as the status sweep, keyed on
  /// (state, error message) inequality.
  pub(crate) async fn service_state_sweep(&self) {
    let diff = {
      let state = self.state.read().unwrap();
      state
        .service_states
        .iter()
        .filter(|(name, service_state)| {
          state.reported_service_states.get(*name)
            != Some(*service_state)
        })
        .map(|(name, service_state)| {
          (name.clone(), service_state.clone())
        })
        .collect::<Vec<_>>()
    };
    let mut published = Vec::new();
    for (name, service_state) in diff {
      let publish = self.api.set_device_service_state(
        &self.application,
        &name,
        &service_state,
      );
      match timeout(REPORT_TIMEOUT, publish).await {
        Ok(Ok(())) => published.push((name, service_state)),
        Ok(Err(e)) => {
          warn!(
            "failed to report service state for {}/{name} | {e:#}",
            self.application
          );
          break;
        }
        Err(_) => {
          warn!(
            "timed out reporting service state for {}/{name}",
            self.application
          );
          break;
        }
      }
    }
    if published.is_empty() {
      return;
    }
    let mut state = self.state.write().unwrap();
    for (name, service_state) in published {
      state.reported_service_states.insert(name, service_state);
    }
  }

  pub async fn stop(&self) {
    self.cancel.cancel();
    let handles = {
      let mut loops = self.loops.lock().unwrap();
      loops.drain(..).collect::<Vec<_>>()
    };
    for handle in handles {
      handle.await.ok();
    }
  }
}

#[cfg(test)]
mod tests {
  use armada_client::entities::ServiceStateKind;

  use super::*;
  use crate::testing::{ApiCall, FakeControlPlane};

  fn reporter_with_fake() -> (Arc<Reporter>, Arc<FakeControlPlane>)
  {
    let api = Arc::new(FakeControlPlane::default());
    let reporter = Reporter::new("app_1", api.clone());
    (reporter, api)
  }

  fn app_status_calls(api: &FakeControlPlane) -> Vec<ApiCall> {
    api
      .calls()
      .into_iter()
      .filter(|call| {
        matches!(call, ApiCall::ApplicationStatus { .. })
      })
      .collect()
  }

  #[tokio::test]
  async fn application_status_waits_for_quorum() {
    let (reporter, api) = reporter_with_fake();
    reporter.set_desired_application(
      "rel_1",
      vec![String::from("s1"), String::from("s2")],
    );

    reporter.application_status_sweep().await;
    assert!(app_status_calls(&api).is_empty());

    reporter.set_service_status("s1", "rel_1");
    reporter.service_status_sweep().await;
    reporter.application_status_sweep().await;
    assert!(app_status_calls(&api).is_empty());

    reporter.set_service_status("s2", "rel_1");
    // Observed but not yet published still holds the gate.
    reporter.application_status_sweep().await;
    assert!(app_status_calls(&api).is_empty());

    reporter.service_status_sweep().await;
    reporter.application_status_sweep().await;
    assert_eq!(app_status_calls(&api), vec![
      ApiCall::ApplicationStatus {
        application: String::from("app_1"),
        release: String::from("rel_1"),
      }
    ]);
    reporter.stop().await;
  }

  #[tokio::test]
  async fn application_status_not_republished_until_desired_changes()
  {
    let (reporter, api) = reporter_with_fake();
    reporter
      .set_desired_application("rel_1", vec![String::from("s1")]);
    reporter.set_service_status("s1", "rel_1");
    reporter.service_status_sweep().await;
    reporter.application_status_sweep().await;
    reporter.application_status_sweep().await;
    assert_eq!(app_status_calls(&api).len(), 1);

    // New release opens the gate again once the service reaches it.
    reporter
      .set_desired_application("rel_2", vec![String::from("s1")]);
    reporter.application_status_sweep().await;
    assert_eq!(app_status_calls(&api).len(), 1);
    reporter.set_service_status("s1", "rel_2");
    reporter.service_status_sweep().await;
    reporter.application_status_sweep().await;
    assert_eq!(app_status_calls(&api).len(), 2);
    reporter.stop().await;
  }

  #[tokio::test]
  async fn stale_service_blocks_new_release_quorum() {
    let (reporter, api) = reporter_with_fake();
    reporter.set_desired_application(
      "rel_2",
      vec![String::from("s1"), String::from("s2")],
    );
    reporter.set_service_status("s1", "rel_2");
    // s2 still reports the old release.
    reporter.set_service_status("s2", "rel_1");
    reporter.service_status_sweep().await;
    reporter.application_status_sweep().await;
    assert!(app_status_calls(&api).is_empty());
    reporter.stop().await;
  }

  #[tokio::test]
  async fn service_status_sweep_publishes_only_the_diff() {
    let (reporter, api) = reporter_with_fake();
    reporter.set_desired_application(
      "rel_1",
      vec![String::from("s1"), String::from("s2")],
    );
    reporter.set_service_status("s1", "rel_1");
    reporter.set_service_status("s2", "rel_1");
    reporter.service_status_sweep().await;
    assert_eq!(api.service_status_calls().len(), 2);

    // Nothing changed, nothing published.
    reporter.service_status_sweep().await;
    assert_eq!(api.service_status_calls().len(), 2);

    // Only the changed service goes out.
    reporter.set_service_status("s1", "rel_2");
    reporter.service_status_sweep().await;
    let calls = api.service_status_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(
      calls.last().unwrap(),
      &ApiCall::ServiceStatus {
        application: String::from("app_1"),
        service: String::from("s1"),
        release: String::from("rel_2"),
      }
    );
    reporter.stop().await;
  }

  #[tokio::test]
  async fn failed_publish_is_retried_on_the_next_sweep() {
    let (reporter, api) = reporter_with_fake();
    reporter
      .set_desired_application("rel_1", vec![String::from("s1")]);
    reporter.set_service_status("s1", "rel_1");

    api.fail_next_calls(1);
    reporter.service_status_sweep().await;
    // The failed publish is not committed.
    reporter.service_status_sweep().await;
    assert_eq!(api.service_status_calls().len(), 2);

    // Committed now, no further publishes.
    reporter.service_status_sweep().await;
    assert_eq!(api.service_status_calls().len(), 2);
    reporter.stop().await;
  }

  #[tokio::test]
  async fn service_state_reported_on_transition_only() {
    let (reporter, api) = reporter_with_fake();
    reporter
      .set_desired_application("rel_1", vec![String::from("s1")]);
    reporter.set_service_state(
      "s1",
      ServiceState::new(ServiceStateKind::Pulling),
    );
    reporter.service_state_sweep().await;
    reporter.set_service_state(
      "s1",
      ServiceState::new(ServiceStateKind::Pulling),
    );
    reporter.service_state_sweep().await;
    assert_eq!(api.service_state_calls().len(), 1);

    reporter.set_service_state(
      "s1",
      ServiceState::errored(ServiceStateKind::Exited, "boom"),
    );
    reporter.service_state_sweep().await;
    assert_eq!(api.service_state_calls().len(), 2);
    reporter.stop().await;
  }
}
