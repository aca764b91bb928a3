use std::{
  collections::BTreeSet,
  path::PathBuf,
  sync::{Arc, Mutex},
  time::Duration,
};

use armada_client::{ControlPlane, entities::Bundle};
use async_timing_util::{Timelength, wait_until_timelength};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::helpers;

const DELETE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upstream records still awaiting deletion. Persisted so deletes
/// survive agent restarts.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
struct GcLedger {
  #[serde(default)]
  applications: BTreeSet<String>,
  #[serde(default)]
  services: BTreeSet<(String, String)>,
}

impl GcLedger {
  fn is_empty(&self) -> bool {
    self.applications.is_empty() && self.services.is_empty()
  }
}

#[derive(Default)]
struct GcState {
  /// (application, service) pairs in the current bundle.
  known_services: BTreeSet<(String, String)>,
  known_applications: BTreeSet<String>,
  pending: GcLedger,
}

/// Deletes upstream status / state records for applications and
/// services which are no longer in the bundle. Deletes are best
/// effort and retried on a 1s tick; a failed delete never blocks the
/// others.
pub struct StatusGarbageCollector {
  api: Arc<dyn ControlPlane>,
  ledger_path: PathBuf,
  state: Mutex<GcState>,
}

impl StatusGarbageCollector {
  pub fn new(
    api: Arc<dyn ControlPlane>,
    ledger_path: PathBuf,
  ) -> Arc<StatusGarbageCollector> {
    let pending = match helpers::read_optional_file(&ledger_path) {
      Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
        Ok(ledger) => ledger,
        Err(e) => {
          warn!("discarding corrupt gc ledger | {e:#}");
          GcLedger::default()
        }
      },
      Ok(None) => GcLedger::default(),
      Err(e) => {
        warn!("failed to read gc ledger | {e:#}");
        GcLedger::default()
      }
    };
    Arc::new(StatusGarbageCollector {
      api,
      ledger_path,
      state: Mutex::new(GcState {
        pending,
        ..Default::default()
      }),
    })
  }

  /// Learn the new pair set. Pairs which fell out of the bundle are
  /// queued for deletion; pairs which came back are unqueued.
  pub fn set_bundle(&self, bundle: &Bundle) {
    let mut next_services = BTreeSet::new();
    let mut next_applications = BTreeSet::new();
    for (id, application) in &bundle.applications {
      next_applications.insert(id.clone());
      let Some(release) = application.latest_release() else {
        continue;
      };
      for service in release.services.keys() {
        next_services.insert((id.clone(), service.clone()));
      }
    }

    let mut state = self.state.lock().unwrap();
    let dropped_services = state
      .known_services
      .difference(&next_services)
      .cloned()
      .collect::<Vec<_>>();
    state.pending.services.extend(dropped_services);
    let dropped_applications = state
      .known_applications
      .difference(&next_applications)
      .cloned()
      .collect::<Vec<_>>();
    state.pending.applications.extend(dropped_applications);

    // The control plane republished something queued for deletion.
    state
      .pending
      .services
      .retain(|pair| !next_services.contains(pair));
    state
      .pending
      .applications
      .retain(|id| !next_applications.contains(id));

    state.known_services = next_services;
    state.known_applications = next_applications;
    self.persist(&state.pending);
  }

  pub fn spawn(self: Arc<Self>) {
    tokio::spawn(async move {
      loop {
        wait_until_timelength(Timelength::OneSecond, 300).await;
        self.sweep().await;
      }
    });
  }

  /// One best effort pass over the pending deletes.
  pub(crate) async fn sweep(&self) {
    let pending = { self.state.lock().unwrap().pending.clone() };
    if pending.is_empty() {
      return;
    }
    for (application, service) in &pending.services {
      let status = timeout(
        DELETE_TIMEOUT,
        self
          .api
          .delete_device_service_status(application, service),
      )
      .await;
      let state = timeout(
        DELETE_TIMEOUT,
        self.api.delete_device_service_state(application, service),
      )
      .await;
      match (status, state) {
        (Ok(Ok(())), Ok(Ok(()))) => {
          let mut gc = self.state.lock().unwrap();
          gc.pending
            .services
            .remove(&(application.clone(), service.clone()));
          self.persist(&gc.pending);
        }
        _ => warn!(
          "failed to delete records of {application}/{service}, will retry"
        ),
      }
    }
    for application in &pending.applications {
      let deleted = timeout(
        DELETE_TIMEOUT,
        self.api.delete_device_application_status(application),
      )
      .await;
      match deleted {
        Ok(Ok(())) => {
          let mut gc = self.state.lock().unwrap();
          gc.pending.applications.remove(application);
          self.persist(&gc.pending);
        }
        _ => warn!(
          "failed to delete application status of {application}, will retry"
        ),
      }
    }
  }

  fn persist(&self, pending: &GcLedger) {
    let json = match serde_json::to_vec(pending) {
      Ok(json) => json,
      Err(e) => {
        warn!("failed to serialize gc ledger | {e:#}");
        return;
      }
    };
    if let Err(e) =
      helpers::atomic_write(&self.ledger_path, &json, 0o644)
    {
      warn!("failed to persist gc ledger | {e:#}");
    }
  }
}
