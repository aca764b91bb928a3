use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use super::{Timelength, logger::{LogConfig, LogLevel, StdioLogMode}};

/// Full configuration for the on-device agent.
/// Loaded from config files, then layered under env and cli overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
  /// The project this device belongs to. Required.
  #[serde(default)]
  pub project_id: String,

  /// One time registration token, used when the device has no
  /// persisted access key yet.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub registration_token: String,

  /// Address of the control plane.
  /// Default: `https://api.armada.dev`.
  #[serde(default = "default_controller_address")]
  pub controller_address: String,

  /// Port for the localhost control API. Default: 4444.
  #[serde(default = "default_server_port")]
  pub server_port: u16,

  /// Directory holding the per-project agent state
  /// (access key, device id, last known good bundle).
  /// Default: `/var/lib/armada`.
  #[serde(default = "default_state_directory")]
  pub state_directory: PathBuf,

  /// Directory watched for device policy variables.
  /// Default: `/etc/armada/variables`.
  #[serde(default = "default_variables_directory")]
  pub variables_directory: PathBuf,

  /// Endpoint remote SSH tunnels are proxied to.
  /// Default: `127.0.0.1:22`.
  #[serde(default = "default_ssh_endpoint")]
  pub ssh_endpoint: String,

  /// Seconds a replaced container is given to stop
  /// before it is removed. Default: 30.
  #[serde(default = "default_container_stop_grace")]
  pub container_stop_grace: u64,

  /// Interval on which service metrics are pushed upstream.
  /// Default: `1-min`.
  #[serde(default)]
  pub metrics_polling_rate: Timelength,

  /// Command run to self update the agent. Any `{version}`
  /// occurrence is replaced with the desired version.
  /// Self update is disabled when empty.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub update_command: String,

  /// Logging configuration
  #[serde(default)]
  pub logging: LogConfig,

  /// Pretty print the startup config log line.
  #[serde(default)]
  pub pretty_startup_config: bool,
}

fn default_controller_address() -> String {
  String::from("https://api.armada.dev")
}

fn default_server_port() -> u16 {
  4444
}

fn default_state_directory() -> PathBuf {
  PathBuf::from("/var/lib/armada")
}

fn default_variables_directory() -> PathBuf {
  PathBuf::from("/etc/armada/variables")
}

fn default_ssh_endpoint() -> String {
  String::from("127.0.0.1:22")
}

fn default_container_stop_grace() -> u64 {
  30
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      project_id: Default::default(),
      registration_token: Default::default(),
      controller_address: default_controller_address(),
      server_port: default_server_port(),
      state_directory: default_state_directory(),
      variables_directory: default_variables_directory(),
      ssh_endpoint: default_ssh_endpoint(),
      container_stop_grace: default_container_stop_grace(),
      metrics_polling_rate: Default::default(),
      update_command: Default::default(),
      logging: Default::default(),
      pretty_startup_config: Default::default(),
    }
  }
}

impl AgentConfig {
  pub fn sanitized(&self) -> AgentConfig {
    AgentConfig {
      registration_token: empty_or_redacted(
        &self.registration_token,
      ),
      ..self.clone()
    }
  }
}

pub fn empty_or_redacted(src: &str) -> String {
  if src.is_empty() {
    String::new()
  } else {
    String::from("##############")
  }
}

/// Environment overrides for [AgentConfig], parsed with `envy`.
#[derive(Debug, Clone, Deserialize)]
pub struct Env {
  /// Paths to config files / directories.
  #[serde(default)]
  pub armada_config_paths: Vec<PathBuf>,

  pub armada_project_id: Option<String>,
  pub armada_registration_token: Option<String>,
  pub armada_controller_address: Option<String>,
  pub armada_server_port: Option<u16>,
  pub armada_state_directory: Option<PathBuf>,
  pub armada_variables_directory: Option<PathBuf>,
  pub armada_ssh_endpoint: Option<String>,
  pub armada_container_stop_grace: Option<u64>,
  pub armada_metrics_polling_rate: Option<Timelength>,
  pub armada_update_command: Option<String>,

  pub armada_logging_level: Option<LogLevel>,
  pub armada_logging_stdio: Option<StdioLogMode>,
  pub armada_logging_pretty: Option<bool>,
  pub armada_logging_otlp_endpoint: Option<String>,
  pub armada_logging_opentelemetry_service_name: Option<String>,

  pub armada_pretty_startup_config: Option<bool>,
}

/// Command line arguments for the agent binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "armada-agent", version)]
pub struct CliArgs {
  /// Paths to config files / directories.
  /// Overrides `ARMADA_CONFIG_PATHS`.
  #[arg(long)]
  pub config_path: Option<Vec<PathBuf>>,

  /// Override the log level.
  /// One of `trace`, `debug`, `info`, `warn`, `error`.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,

  /// Override the project id.
  #[arg(long)]
  pub project_id: Option<String>,

  /// Override the registration token.
  #[arg(long)]
  pub registration_token: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_fill_missing_fields() {
    let config: AgentConfig = toml::from_str(
      r#"
        project_id = "prj_1"
        registration_token = "tkn_1"
      "#,
    )
    .unwrap();
    assert_eq!(config.project_id, "prj_1");
    assert_eq!(config.server_port, 4444);
    assert_eq!(
      config.state_directory,
      PathBuf::from("/var/lib/armada")
    );
    assert_eq!(config.metrics_polling_rate, Timelength::OneMinute);
  }

  #[test]
  fn sanitized_redacts_registration_token() {
    let config = AgentConfig {
      registration_token: String::from("tkn_secret"),
      ..Default::default()
    };
    let sanitized = config.sanitized();
    assert!(!sanitized
      .registration_token
      .contains("secret"));
    assert!(!sanitized.registration_token.is_empty());
  }
}
