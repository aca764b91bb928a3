use std::{collections::HashMap, time::Duration};

use armada_client::entities::{Service, ServiceStateKind};
use async_trait::async_trait;

/// Labels stamped on every container this agent manages.
/// Together they carry the container's identity:
/// (application, service, release, spec hash).
pub const MANAGED_LABEL: &str = "dev.armada.managed";
pub const APPLICATION_LABEL: &str = "dev.armada.application";
pub const SERVICE_LABEL: &str = "dev.armada.service";
pub const RELEASE_LABEL: &str = "dev.armada.release";
pub const SPEC_HASH_LABEL: &str = "dev.armada.spec-hash";

pub fn service_label_filters(
  application: &str,
  service: &str,
) -> Vec<(String, String)> {
  vec![
    (MANAGED_LABEL.to_string(), String::from("true")),
    (APPLICATION_LABEL.to_string(), application.to_string()),
    (SERVICE_LABEL.to_string(), service.to_string()),
  ]
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSummary {
  pub id: String,
  pub name: String,
  pub state: ServiceStateKind,
  pub image: Option<String>,
  pub labels: HashMap<String, String>,
}

impl ContainerSummary {
  pub fn label(&self, key: &str) -> &str {
    self.labels.get(key).map(String::as_str).unwrap_or_default()
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
  pub cpu_percent: f64,
  pub memory_usage_bytes: u64,
  pub memory_limit_bytes: u64,
  pub network_rx_bytes: u64,
  pub network_tx_bytes: u64,
}

/// Abstract container lifecycle consumed by the supervisors, the
/// metrics pusher, and the local api. The docker implementation lives
/// in [crate::docker]; tests run against an in-memory fake.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
  /// Pull to idempotent completion. Safe to retry.
  async fn pull_image(&self, image: &str) -> anyhow::Result<()>;

  async fn create_container(
    &self,
    name: &str,
    service: &Service,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<String>;

  async fn start_container(&self, id: &str) -> anyhow::Result<()>;

  /// Not-found counts as success.
  async fn stop_container(
    &self,
    id: &str,
    grace: Duration,
  ) -> anyhow::Result<()>;

  /// Not-found counts as success.
  async fn remove_container(&self, id: &str) -> anyhow::Result<()>;

  /// Filter by `key=value` label pairs.
  /// Includes containers which are not running.
  async fn list_containers(
    &self,
    label_filters: &[(String, String)],
  ) -> anyhow::Result<Vec<ContainerSummary>>;

  async fn container_logs(
    &self,
    name: &str,
    tail: u64,
  ) -> anyhow::Result<String>;

  async fn container_stats(
    &self,
    id: &str,
  ) -> anyhow::Result<ContainerStats>;
}
