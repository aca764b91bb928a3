use std::{collections::HashMap, sync::Arc, time::Duration};

use armada_client::{ControlPlane, entities::Bundle};
use tokio::sync::Mutex;

use crate::{engine::ContainerEngine, validators::Validator};

mod application;
mod service;

pub use application::ApplicationSupervisor;

/// Top level of the reconciliation hierarchy: owns one
/// [ApplicationSupervisor] per application in the bundle.
pub struct Supervisor {
  engine: Arc<dyn ContainerEngine>,
  api: Arc<dyn ControlPlane>,
  validators: Arc<Vec<Box<dyn Validator>>>,
  stop_grace: Duration,
  applications: Mutex<HashMap<String, ApplicationSupervisor>>,
}

impl Supervisor {
  pub fn new(
    engine: Arc<dyn ContainerEngine>,
    api: Arc<dyn ControlPlane>,
    validators: Arc<Vec<Box<dyn Validator>>>,
    stop_grace: Duration,
  ) -> Arc<Supervisor> {
    Arc::new(Supervisor {
      engine,
      api,
      validators,
      stop_grace,
      applications: Default::default(),
    })
  }

  /// Idempotent reconcile toward the bundle's application set.
  /// Errors surface through service state reports, never here.
  pub async fn set(&self, bundle: &Bundle) {
    let mut applications = self.applications.lock().await;

    let removed = applications
      .keys()
      .filter(|id| !bundle.applications.contains_key(*id))
      .cloned()
      .collect::<Vec<_>>();
    for id in removed {
      info!("stopping removed application {id}");
      if let Some(supervisor) = applications.remove(&id) {
        supervisor.stop().await;
      }
    }

    for (id, application) in &bundle.applications {
      let Some(release) = application.latest_release() else {
        // Nothing is desired for an application with no releases.
        continue;
      };
      let supervisor =
        applications.entry(id.clone()).or_insert_with(|| {
          info!("starting application {id}");
          ApplicationSupervisor::new(
            id.clone(),
            self.engine.clone(),
            self.api.clone(),
            self.validators.clone(),
            self.stop_grace,
          )
        });
      supervisor
        .set_desired_application(&release.id, &release.services)
        .await;
    }
  }
}
