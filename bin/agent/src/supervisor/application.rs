use std::{collections::HashMap, sync::Arc, time::Duration};

use armada_client::{ControlPlane, entities::Service};
use futures::future::join_all;
use indexmap::IndexMap;

use crate::{
  engine::ContainerEngine,
  reporter::Reporter,
  supervisor::service::{
    ServiceHandle, ServiceSupervisor, spawn_service_supervisor,
  },
  validators::Validator,
};

/// Owns the service supervisors for one application, plus its
/// reporter. Updates are processed serially by the caller.
pub struct ApplicationSupervisor {
  application: String,
  engine: Arc<dyn ContainerEngine>,
  validators: Arc<Vec<Box<dyn Validator>>>,
  stop_grace: Duration,
  reporter: Arc<Reporter>,
  services: HashMap<String, ServiceHandle>,
}

impl ApplicationSupervisor {
  pub fn new(
    application: impl Into<String>,
    engine: Arc<dyn ContainerEngine>,
    api: Arc<dyn ControlPlane>,
    validators: Arc<Vec<Box<dyn Validator>>>,
    stop_grace: Duration,
  ) -> ApplicationSupervisor {
    let application = application.into();
    ApplicationSupervisor {
      reporter: Reporter::new(application.clone(), api),
      application,
      engine,
      validators,
      stop_grace,
      services: HashMap::new(),
    }
  }

  /// Retarget the application to one release. Removed services are
  /// stopped and awaited first, changed services are replaced (stop
  /// old, then start new), and the reporter is updated last so its
  /// quorum set always matches the supervisors' target.
  pub async fn set_desired_application(
    &mut self,
    release: &str,
    services: &IndexMap<String, Service>,
  ) {
    let removed = self
      .services
      .keys()
      .filter(|name| !services.contains_key(*name))
      .cloned()
      .collect::<Vec<_>>();
    for name in removed {
      info!("stopping removed service {}/{name}", self.application);
      if let Some(handle) = self.services.remove(&name) {
        handle.stop().await;
      }
    }

    for (name, service) in services {
      let spec_hash = service.spec_hash();
      let equivalent = self
        .services
        .get(name)
        .is_some_and(|handle| handle.spec_hash() == spec_hash);
      if equivalent {
        if let Some(handle) = self.services.get_mut(name) {
          handle.set(release, service, spec_hash);
        }
        continue;
      }
      if let Some(handle) = self.services.remove(name) {
        info!(
          "replacing service {}/{name} for release {release}",
          self.application
        );
        handle.stop().await;
      }
      let supervisor = ServiceSupervisor::new(
        self.application.clone(),
        name.clone(),
        self.engine.clone(),
        self.reporter.clone(),
        self.validators.clone(),
        self.stop_grace,
      );
      let handle = spawn_service_supervisor(
        supervisor, release, service, spec_hash,
      );
      self.services.insert(name.clone(), handle);
    }

    self.reporter.set_desired_application(
      release,
      services.keys().cloned().collect(),
    );
  }

  /// Cancel all service supervisors concurrently, await them all,
  /// then stop the reporter.
  pub async fn stop(self) {
    join_all(
      self
        .services
        .into_values()
        .map(|handle| handle.stop()),
    )
    .await;
    self.reporter.stop().await;
  }
}
