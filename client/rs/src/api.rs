//! Typed requests for the localhost control API served by the agent.
//! The on-host CLI posts these as json to `127.0.0.1:<server_port>`.

use resolver_api::Resolve;
use serde::{Deserialize, Serialize};

use crate::entities::{Bundle, ContainerListItem};

/// Check the agent is alive.
#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(GetHealthResponse)]
#[error(serror::Error)]
pub struct GetHealth {}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetHealthResponse {}

//

#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(GetVersionResponse)]
#[error(serror::Error)]
pub struct GetVersion {}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetVersionResponse {
  pub version: String,
}

//

/// Get the last accepted bundle, if the device has one.
#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(GetBundleResponse)]
#[error(serror::Error)]
pub struct GetBundle {}

pub type GetBundleResponse = Option<Bundle>;

//

/// List the containers managed by this agent.
#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(ListContainersResponse)]
#[error(serror::Error)]
pub struct ListContainers {}

pub type ListContainersResponse = Vec<ContainerListItem>;

//

/// Tail the log of one managed container.
#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(GetContainerLogResponse)]
#[error(serror::Error)]
pub struct GetContainerLog {
  /// The container name.
  pub container: String,
  /// Number of trailing lines to return. Default: 100.
  #[serde(default = "default_log_tail")]
  pub tail: u64,
}

fn default_log_tail() -> u64 {
  100
}

pub type GetContainerLogResponse = String;
