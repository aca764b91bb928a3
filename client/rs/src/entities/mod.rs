use std::str::FromStr;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

/// [AgentConfig][config::AgentConfig] and its env / cli overlays.
pub mod config;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;

pub type JsonValue = serde_json::Value;

/// The declarative desired state for a whole device,
/// issued by the control plane and persisted on disk as the
/// last-known-good bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
  /// Applications deployed to this device, keyed by application id.
  /// Order is control plane defined.
  #[serde(default)]
  pub applications: IndexMap<String, Application>,
  /// The agent version this device should be running.
  #[serde(default)]
  pub desired_agent_version: String,
  /// Opaque control plane policy, forwarded to the status garbage
  /// collector and metrics pusher without interpretation.
  #[serde(default)]
  pub settings: JsonValue,
}

/// The projection of [Bundle] which must stay parseable across
/// control plane schema drift. If a payload fails to parse as a full
/// [Bundle] but parses as this, only `desired_agent_version` is taken
/// and the rest of the previous bundle is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalBundle {
  pub desired_agent_version: String,
}

/// A named collection of services deployed together.
/// Only the latest release is material to the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
  /// Ordered release history, newest last.
  #[serde(default)]
  pub releases: Vec<Release>,
}

impl Application {
  pub fn latest_release(&self) -> Option<&Release> {
    self.releases.last()
  }
}

/// An immutable snapshot of an application's service specs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
  pub id: String,
  /// Service name -> container spec.
  #[serde(default)]
  pub services: IndexMap<String, Service>,
}

/// A declarative container spec within a release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
  pub image: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub entrypoint: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub command: Vec<String>,
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub env: IndexMap<String, String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub mounts: Vec<Mount>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub ports: Vec<PortMapping>,
  #[serde(default)]
  pub restart_policy: RestartPolicy,
  /// Fractional CPUs, eg `1.5`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cpu_limit: Option<f64>,
  /// Bytes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub memory_limit: Option<i64>,
  #[serde(default)]
  pub privileged: bool,
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub labels: IndexMap<String, String>,
}

impl Service {
  /// Canonical digest of the spec. Two services are equivalent iff
  /// their hashes match, and equivalence is the sole input to the
  /// "does this container need to be replaced?" decision.
  pub fn spec_hash(&self) -> String {
    // Round tripping through Value sorts object keys, so key order
    // in the incoming json cannot change the digest.
    let canonical = serde_json::to_value(self)
      .and_then(|value| serde_json::to_vec(&value))
      .expect("service spec serialization cannot fail");
    hex::encode(Sha256::digest(&canonical))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
  pub source: String,
  pub target: String,
  #[serde(default)]
  pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
  pub host_port: u16,
  pub container_port: u16,
  #[serde(default)]
  pub protocol: PortProtocol,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortProtocol {
  #[default]
  Tcp,
  Udp,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartPolicy {
  No,
  #[default]
  Always,
  UnlessStopped,
  OnFailure,
}

/// Reported when a service has been observed running the container
/// produced from `current_release_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
  pub current_release_id: String,
}

/// Reported only once every service in the desired set has reached
/// [ServiceStatus] for `current_release_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
  pub current_release_id: String,
}

/// Observed lifecycle state of a service's container,
/// reported on transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
  #[serde(default)]
  pub state: ServiceStateKind,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub error_message: String,
}

impl ServiceState {
  pub fn new(state: ServiceStateKind) -> ServiceState {
    ServiceState {
      state,
      error_message: String::new(),
    }
  }

  pub fn errored(
    state: ServiceStateKind,
    error_message: impl Into<String>,
  ) -> ServiceState {
    ServiceState {
      state,
      error_message: error_message.into(),
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceStateKind {
  Pulling,
  Created,
  Running,
  Exited,
  Stopped,
  #[default]
  Unknown,
}

/// Host facts pushed upstream by the info reporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
  pub agent_version: String,
  #[serde(default)]
  pub hostname: String,
  #[serde(default)]
  pub os_name: String,
  #[serde(default)]
  pub os_version: String,
  #[serde(default)]
  pub kernel_version: String,
  #[serde(default)]
  pub cpu_count: u32,
  #[serde(default)]
  pub total_memory_bytes: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ip_address: Option<String>,
}

/// One sample of container metrics for a (application, service) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
  pub application: String,
  pub service: String,
  /// Metric name -> value, already filtered by the device's
  /// metric allow list.
  #[serde(default)]
  pub metrics: IndexMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
  pub registration_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceResponse {
  pub device_id: String,
  pub access_key: String,
}

/// An agent managed container as seen through the local control API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerListItem {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub name: String,
  #[serde(default)]
  pub application: String,
  #[serde(default)]
  pub service: String,
  #[serde(default)]
  pub release: String,
  #[serde(default)]
  pub state: ServiceStateKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Timelength {
  /// `1-sec`
  #[serde(rename = "1-sec")]
  #[strum(serialize = "1-sec")]
  OneSecond,
  /// `5-sec`
  #[serde(rename = "5-sec")]
  #[strum(serialize = "5-sec")]
  FiveSeconds,
  /// `15-sec`
  #[serde(rename = "15-sec")]
  #[strum(serialize = "15-sec")]
  FifteenSeconds,
  /// `30-sec`
  #[serde(rename = "30-sec")]
  #[strum(serialize = "30-sec")]
  ThirtySeconds,
  #[default]
  /// `1-min`
  #[serde(rename = "1-min")]
  #[strum(serialize = "1-min")]
  OneMinute,
  /// `5-min`
  #[serde(rename = "5-min")]
  #[strum(serialize = "5-min")]
  FiveMinutes,
  /// `15-min`
  #[serde(rename = "15-min")]
  #[strum(serialize = "15-min")]
  FifteenMinutes,
  /// `1-hr`
  #[serde(rename = "1-hr")]
  #[strum(serialize = "1-hr")]
  OneHour,
}

impl TryInto<async_timing_util::Timelength> for Timelength {
  type Error = anyhow::Error;
  fn try_into(
    self,
  ) -> Result<async_timing_util::Timelength, Self::Error> {
    async_timing_util::Timelength::from_str(&self.to_string())
      .context("failed to parse timelength?")
  }
}
