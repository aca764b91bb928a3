use std::{path::PathBuf, sync::OnceLock};

use armada_client::entities::{
  config::{AgentConfig, CliArgs, Env},
  logger::{LogConfig, LogLevel},
};
use clap::Parser;
use colored::Colorize;
use config::ConfigLoader;

pub fn agent_config() -> &'static AgentConfig {
  static AGENT_CONFIG: OnceLock<AgentConfig> = OnceLock::new();
  AGENT_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse agent environment");
    let args = CliArgs::parse();
    let config_paths =
      args.config_path.unwrap_or(env.armada_config_paths);

    let config = if config_paths.is_empty() {
      println!(
        "{}: No config paths found, using default config",
        "INFO".green(),
      );
      AgentConfig::default()
    } else {
      (ConfigLoader {
        paths: &config_paths
          .iter()
          .map(PathBuf::as_path)
          .collect::<Vec<_>>(),
        merge_nested: true,
        extend_array: true,
      })
      .load()
      .expect("failed at parsing config from paths")
    };

    AgentConfig {
      project_id: args
        .project_id
        .or(env.armada_project_id)
        .unwrap_or(config.project_id),
      registration_token: args
        .registration_token
        .or(env.armada_registration_token)
        .unwrap_or(config.registration_token),
      controller_address: env
        .armada_controller_address
        .unwrap_or(config.controller_address),
      server_port: env
        .armada_server_port
        .unwrap_or(config.server_port),
      state_directory: env
        .armada_state_directory
        .unwrap_or(config.state_directory),
      variables_directory: env
        .armada_variables_directory
        .unwrap_or(config.variables_directory),
      ssh_endpoint: env
        .armada_ssh_endpoint
        .unwrap_or(config.ssh_endpoint),
      container_stop_grace: env
        .armada_container_stop_grace
        .unwrap_or(config.container_stop_grace),
      metrics_polling_rate: env
        .armada_metrics_polling_rate
        .unwrap_or(config.metrics_polling_rate),
      update_command: env
        .armada_update_command
        .unwrap_or(config.update_command),
      logging: LogConfig {
        level: args
          .log_level
          .map(LogLevel::from)
          .or(env.armada_logging_level)
          .unwrap_or(config.logging.level),
        stdio: env
          .armada_logging_stdio
          .unwrap_or(config.logging.stdio),
        pretty: env
          .armada_logging_pretty
          .unwrap_or(config.logging.pretty),
        otlp_endpoint: env
          .armada_logging_otlp_endpoint
          .unwrap_or(config.logging.otlp_endpoint),
        opentelemetry_service_name: env
          .armada_logging_opentelemetry_service_name
          .unwrap_or(config.logging.opentelemetry_service_name),
      },
      pretty_startup_config: env
        .armada_pretty_startup_config
        .unwrap_or(config.pretty_startup_config),
    }
  })
}
