//! In memory fakes for the control plane and container engine,
//! shared across the agent's unit tests.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use anyhow::anyhow;
use armada_client::{
  BoxedTunnel, ControlPlane,
  entities::{
    ApplicationStatus, DeviceInfo, RegisterDeviceResponse, Service,
    ServiceMetrics, ServiceState, ServiceStateKind, ServiceStatus,
  },
};
use async_trait::async_trait;
use bytes::Bytes;

use crate::engine::{
  ContainerEngine, ContainerStats, ContainerSummary,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
  Register,
  ApplicationStatus {
    application: String,
    release: String,
  },
  ServiceStatus {
    application: String,
    service: String,
    release: String,
  },
  ServiceState {
    application: String,
    service: String,
    state: ServiceState,
  },
  DeleteApplicationStatus {
    application: String,
  },
  DeleteServiceStatus {
    application: String,
    service: String,
  },
  DeleteServiceState {
    application: String,
    service: String,
  },
  DeviceInfo,
  Metrics {
    samples: Vec<ServiceMetrics>,
  },
}

#[derive(Default)]
pub struct FakeControlPlane {
  calls: Mutex<Vec<ApiCall>>,
  fail_next: Mutex<u32>,
  bundle_bytes: Mutex<Option<Bytes>>,
  pub access_key: Mutex<Option<String>>,
  pub device_id: Mutex<Option<String>>,
}

impl FakeControlPlane {
  pub fn calls(&self) -> Vec<ApiCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn service_status_calls(&self) -> Vec<ApiCall> {
    self
      .calls()
      .into_iter()
      .filter(|call| matches!(call, ApiCall::ServiceStatus { .. }))
      .collect()
  }

  pub fn service_state_calls(&self) -> Vec<ApiCall> {
    self
      .calls()
      .into_iter()
      .filter(|call| matches!(call, ApiCall::ServiceState { .. }))
      .collect()
  }

  /// The next `count` recording calls return an error.
  pub fn fail_next_calls(&self, count: u32) {
    *self.fail_next.lock().unwrap() = count;
  }

  pub fn set_bundle_bytes(&self, bytes: impl Into<Bytes>) {
    *self.bundle_bytes.lock().unwrap() = Some(bytes.into());
  }

  fn record(&self, call: ApiCall) -> anyhow::Result<()> {
    let mut fail_next = self.fail_next.lock().unwrap();
    if *fail_next > 0 {
      *fail_next -= 1;
      return Err(anyhow!("injected failure"));
    }
    self.calls.lock().unwrap().push(call);
    Ok(())
  }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
  async fn register_device(
    &self,
    _registration_token: &str,
  ) -> anyhow::Result<RegisterDeviceResponse> {
    self.record(ApiCall::Register)?;
    Ok(RegisterDeviceResponse {
      device_id: String::from("d1"),
      access_key: String::from("k1"),
    })
  }

  async fn get_bundle_bytes(&self) -> anyhow::Result<Bytes> {
    self
      .bundle_bytes
      .lock()
      .unwrap()
      .clone()
      .ok_or_else(|| anyhow!("no bundle bytes set"))
  }

  async fn set_device_application_status(
    &self,
    application: &str,
    status: &ApplicationStatus,
  ) -> anyhow::Result<()> {
    self.record(ApiCall::ApplicationStatus {
      application: application.to_string(),
      release: status.current_release_id.clone(),
    })
  }

  async fn set_device_service_status(
    &self,
    application: &str,
    service: &str,
    status: &ServiceStatus,
  ) -> anyhow::Result<()> {
    self.record(ApiCall::ServiceStatus {
      application: application.to_string(),
      service: service.to_string(),
      release: status.current_release_id.clone(),
    })
  }

  async fn set_device_service_state(
    &self,
    application: &str,
    service: &str,
    state: &ServiceState,
  ) -> anyhow::Result<()> {
    self.record(ApiCall::ServiceState {
      application: application.to_string(),
      service: service.to_string(),
      state: state.clone(),
    })
  }

  async fn delete_device_application_status(
    &self,
    application: &str,
  ) -> anyhow::Result<()> {
    self.record(ApiCall::DeleteApplicationStatus {
      application: application.to_string(),
    })
  }

  async fn delete_device_service_status(
    &self,
    application: &str,
    service: &str,
  ) -> anyhow::Result<()> {
    self.record(ApiCall::DeleteServiceStatus {
      application: application.to_string(),
      service: service.to_string(),
    })
  }

  async fn delete_device_service_state(
    &self,
    application: &str,
    service: &str,
  ) -> anyhow::Result<()> {
    self.record(ApiCall::DeleteServiceState {
      application: application.to_string(),
      service: service.to_string(),
    })
  }

  async fn set_device_info(
    &self,
    _info: &DeviceInfo,
  ) -> anyhow::Result<()> {
    self.record(ApiCall::DeviceInfo)
  }

  async fn push_service_metrics(
    &self,
    metrics: &[ServiceMetrics],
  ) -> anyhow::Result<()> {
    self.record(ApiCall::Metrics {
      samples: metrics.to_vec(),
    })
  }

  async fn open_tunnel(&self) -> anyhow::Result<BoxedTunnel> {
    Err(anyhow!("no tunnels in tests"))
  }

  fn set_access_key(&self, access_key: String) {
    *self.access_key.lock().unwrap() = Some(access_key);
  }

  fn set_device_id(&self, device_id: String) {
    *self.device_id.lock().unwrap() = Some(device_id);
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
  Pull(String),
  Create(String),
  Start(String),
  Stop(String),
  Remove(String),
}

#[derive(Default)]
pub struct FakeEngine {
  pub containers: Mutex<Vec<ContainerSummary>>,
  events: Mutex<Vec<EngineEvent>>,
  fail_next: Mutex<u32>,
  next_id: Mutex<u64>,
  pub stats: Mutex<ContainerStats>,
}

impl FakeEngine {
  pub fn events(&self) -> Vec<EngineEvent> {
    self.events.lock().unwrap().clone()
  }

  pub fn clear_events(&self) {
    self.events.lock().unwrap().clear();
  }

  pub fn fail_next_calls(&self, count: u32) {
    *self.fail_next.lock().unwrap() = count;
  }

  pub fn running(&self) -> Vec<ContainerSummary> {
    self
      .containers
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.state == ServiceStateKind::Running)
      .cloned()
      .collect()
  }

  fn record(&self, event: EngineEvent) -> anyhow::Result<()> {
    let mut fail_next = self.fail_next.lock().unwrap();
    if *fail_next > 0 {
      *fail_next -= 1;
      return Err(anyhow!("injected engine failure"));
    }
    self.events.lock().unwrap().push(event);
    Ok(())
  }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
  async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
    self.record(EngineEvent::Pull(image.to_string()))
  }

  async fn create_container(
    &self,
    name: &str,
    service: &Service,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<String> {
    self.record(EngineEvent::Create(name.to_string()))?;
    let id = {
      let mut next_id = self.next_id.lock().unwrap();
      *next_id += 1;
      format!("ctr_{next_id}")
    };
    self.containers.lock().unwrap().push(ContainerSummary {
      id: id.clone(),
      name: name.to_string(),
      state: ServiceStateKind::Created,
      image: Some(service.image.clone()),
      labels,
    });
    Ok(id)
  }

  async fn start_container(&self, id: &str) -> anyhow::Result<()> {
    self.record(EngineEvent::Start(id.to_string()))?;
    let mut containers = self.containers.lock().unwrap();
    if let Some(container) =
      containers.iter_mut().find(|c| c.id == id)
    {
      container.state = ServiceStateKind::Running;
    }
    Ok(())
  }

  async fn stop_container(
    &self,
    id: &str,
    _grace: Duration,
  ) -> anyhow::Result<()> {
    self.record(EngineEvent::Stop(id.to_string()))?;
    let mut containers = self.containers.lock().unwrap();
    if let Some(container) =
      containers.iter_mut().find(|c| c.id == id)
    {
      container.state = ServiceStateKind::Stopped;
    }
    Ok(())
  }

  async fn remove_container(&self, id: &str) -> anyhow::Result<()> {
    self.record(EngineEvent::Remove(id.to_string()))?;
    self.containers.lock().unwrap().retain(|c| c.id != id);
    Ok(())
  }

  async fn list_containers(
    &self,
    label_filters: &[(String, String)],
  ) -> anyhow::Result<Vec<ContainerSummary>> {
    let containers = self.containers.lock().unwrap();
    Ok(
      containers
        .iter()
        .filter(|container| {
          label_filters.iter().all(|(key, value)| {
            container.labels.get(key) == Some(value)
          })
        })
        .cloned()
        .collect(),
    )
  }

  async fn container_logs(
    &self,
    name: &str,
    tail: u64,
  ) -> anyhow::Result<String> {
    Ok(format!("logs of {name} (tail {tail})"))
  }

  async fn container_stats(
    &self,
    _id: &str,
  ) -> anyhow::Result<ContainerStats> {
    Ok(*self.stats.lock().unwrap())
  }
}

/// Polls the condition every 10ms until it holds or the timeout
/// elapses. Keeps supervisor tests robust without big sleeps.
pub async fn wait_for(
  what: &str,
  mut condition: impl FnMut() -> bool,
) {
  let deadline =
    tokio::time::Instant::now() + Duration::from_secs(5);
  while !condition() {
    if tokio::time::Instant::now() > deadline {
      panic!("timed out waiting for {what}");
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}
