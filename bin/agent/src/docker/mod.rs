use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use armada_client::entities::{Service, ServiceStateKind};
use async_trait::async_trait;
use bollard::{
  Docker,
  query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    ListContainersOptions, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StatsOptionsBuilder,
    StopContainerOptionsBuilder,
  },
};
use futures::StreamExt;

use crate::engine::{
  ContainerEngine, ContainerStats, ContainerSummary,
};

pub struct DockerEngine {
  docker: Docker,
}

impl Default for DockerEngine {
  fn default() -> DockerEngine {
    DockerEngine {
      docker: Docker::connect_with_defaults()
        .expect("failed to connect to docker daemon"),
    }
  }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
  #[instrument(level = "debug", skip(self))]
  async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
    let options =
      CreateImageOptionsBuilder::new().from_image(image).build();
    let mut progress =
      self.docker.create_image(options.into(), None, None);
    while let Some(info) = progress.next().await {
      info.with_context(|| format!("failed to pull {image}"))?;
    }
    Ok(())
  }

  #[instrument(level = "debug", skip(self, service, labels))]
  async fn create_container(
    &self,
    name: &str,
    service: &Service,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<String> {
    let options =
      CreateContainerOptionsBuilder::new().name(name).build();
    let body = container_create_body(service, labels);
    let res = self
      .docker
      .create_container(options.into(), body)
      .await
      .with_context(|| {
        format!("failed to create container {name}")
      })?;
    Ok(res.id)
  }

  #[instrument(level = "debug", skip(self))]
  async fn start_container(&self, id: &str) -> anyhow::Result<()> {
    self
      .docker
      .start_container(
        id,
        None::<bollard::query_parameters::StartContainerOptions>,
      )
      .await
      .or_else(ignore_not_modified)
      .with_context(|| format!("failed to start container {id}"))
  }

  #[instrument(level = "debug", skip(self))]
  async fn stop_container(
    &self,
    id: &str,
    grace: Duration,
  ) -> anyhow::Result<()> {
    let options = StopContainerOptionsBuilder::new()
      .t(grace.as_secs() as i32)
      .build();
    self
      .docker
      .stop_container(id, options.into())
      .await
      .or_else(ignore_not_found)
      .or_else(ignore_not_modified)
      .with_context(|| format!("failed to stop container {id}"))
  }

  #[instrument(level = "debug", skip(self))]
  async fn remove_container(&self, id: &str) -> anyhow::Result<()> {
    let options =
      RemoveContainerOptionsBuilder::new().force(true).build();
    self
      .docker
      .remove_container(id, options.into())
      .await
      .or_else(ignore_not_found)
      .with_context(|| format!("failed to remove container {id}"))
  }

  async fn list_containers(
    &self,
    label_filters: &[(String, String)],
  ) -> anyhow::Result<Vec<ContainerSummary>> {
    let labels = label_filters
      .iter()
      .map(|(key, value)| format!("{key}={value}"))
      .collect::<Vec<_>>();
    let filters =
      HashMap::from([(String::from("label"), labels)]);
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        filters: Some(filters),
        ..Default::default()
      }))
      .await
      .context("failed to list containers")?;
    let containers = containers
      .into_iter()
      .flat_map(|container| {
        let name = container
          .names
          .context("no names on container")?
          .pop()
          .context("no names on container (empty vec)")?
          .replace('/', "");
        anyhow::Ok(ContainerSummary {
          id: container.id.unwrap_or_default(),
          name,
          state: container
            .state
            .map(convert_container_state)
            .unwrap_or_default(),
          image: container.image,
          labels: container.labels.unwrap_or_default(),
        })
      })
      .collect();
    Ok(containers)
  }

  async fn container_logs(
    &self,
    name: &str,
    tail: u64,
  ) -> anyhow::Result<String> {
    let options = LogsOptionsBuilder::new()
      .stdout(true)
      .stderr(true)
      .tail(&tail.to_string())
      .build();
    let mut stream = self.docker.logs(name, options.into());
    let mut log = String::new();
    while let Some(output) = stream.next().await {
      let output = output
        .with_context(|| format!("failed to read logs of {name}"))?;
      log.push_str(&String::from_utf8_lossy(&output.into_bytes()));
    }
    Ok(log)
  }

  /// Calls for stats once, similar to --no-stream on the cli.
  async fn container_stats(
    &self,
    id: &str,
  ) -> anyhow::Result<ContainerStats> {
    let mut res = self.docker.stats(
      id,
      StatsOptionsBuilder::new().stream(false).build().into(),
    );
    let stats = res
      .next()
      .await
      .with_context(|| {
        format!("unable to get container stats for {id} (got None)")
      })?
      .with_context(|| {
        format!("unable to get container stats for {id}")
      })?;

    let cpu = stats.cpu_stats.unwrap_or_default();
    let precpu = stats.precpu_stats.unwrap_or_default();
    let cpu_total = cpu
      .cpu_usage
      .as_ref()
      .and_then(|usage| usage.total_usage)
      .unwrap_or_default();
    let precpu_total = precpu
      .cpu_usage
      .as_ref()
      .and_then(|usage| usage.total_usage)
      .unwrap_or_default();
    let system_delta = cpu
      .system_cpu_usage
      .unwrap_or_default()
      .saturating_sub(precpu.system_cpu_usage.unwrap_or_default());
    let cpu_percent = if system_delta > 0 {
      let online = cpu.online_cpus.unwrap_or_default().max(1);
      cpu_total.saturating_sub(precpu_total) as f64
        / system_delta as f64
        * online as f64
        * 100.0
    } else {
      0.0
    };

    let memory = stats.memory_stats.unwrap_or_default();
    let network = stats.networks.unwrap_or_default();

    Ok(ContainerStats {
      cpu_percent,
      memory_usage_bytes: memory.usage.unwrap_or_default() as u64,
      memory_limit_bytes: memory.limit.unwrap_or_default() as u64,
      network_rx_bytes: network
        .values()
        .filter_map(|n| n.rx_bytes)
        .sum::<u64>(),
      network_tx_bytes: network
        .values()
        .filter_map(|n| n.tx_bytes)
        .sum::<u64>(),
    })
  }
}

fn container_create_body(
  service: &Service,
  labels: HashMap<String, String>,
) -> bollard::models::ContainerCreateBody {
  let env = service
    .env
    .iter()
    .map(|(key, value)| format!("{key}={value}"))
    .collect::<Vec<_>>();
  let binds = service
    .mounts
    .iter()
    .map(|mount| {
      if mount.read_only {
        format!("{}:{}:ro", mount.source, mount.target)
      } else {
        format!("{}:{}", mount.source, mount.target)
      }
    })
    .collect::<Vec<_>>();
  let exposed_ports = service
    .ports
    .iter()
    .map(|port| {
      (
        format!("{}/{}", port.container_port, port.protocol),
        Default::default(),
      )
    })
    .collect();
  let port_bindings = service
    .ports
    .iter()
    .map(|port| {
      (
        format!("{}/{}", port.container_port, port.protocol),
        Some(vec![bollard::models::PortBinding {
          host_ip: None,
          host_port: Some(port.host_port.to_string()),
        }]),
      )
    })
    .collect();
  bollard::models::ContainerCreateBody {
    image: Some(service.image.clone()),
    entrypoint: (!service.entrypoint.is_empty())
      .then(|| service.entrypoint.clone()),
    cmd: (!service.command.is_empty())
      .then(|| service.command.clone()),
    env: Some(env),
    labels: Some(labels),
    exposed_ports: Some(exposed_ports),
    host_config: Some(bollard::models::HostConfig {
      binds: (!binds.is_empty()).then_some(binds),
      port_bindings: Some(port_bindings),
      restart_policy: Some(bollard::models::RestartPolicy {
        name: Some(convert_restart_policy(service.restart_policy)),
        maximum_retry_count: None,
      }),
      privileged: Some(service.privileged),
      nano_cpus: service
        .cpu_limit
        .map(|cpus| (cpus * 1_000_000_000.0) as i64),
      memory: service.memory_limit,
      ..Default::default()
    }),
    ..Default::default()
  }
}

fn convert_restart_policy(
  policy: armada_client::entities::RestartPolicy,
) -> bollard::secret::RestartPolicyNameEnum {
  use armada_client::entities::RestartPolicy::*;
  match policy {
    No => bollard::secret::RestartPolicyNameEnum::NO,
    Always => bollard::secret::RestartPolicyNameEnum::ALWAYS,
    UnlessStopped => {
      bollard::secret::RestartPolicyNameEnum::UNLESS_STOPPED
    }
    OnFailure => bollard::secret::RestartPolicyNameEnum::ON_FAILURE,
  }
}

fn convert_container_state(
  state: bollard::secret::ContainerSummaryStateEnum,
) -> ServiceStateKind {
  match state {
    bollard::secret::ContainerSummaryStateEnum::EMPTY => {
      ServiceStateKind::Unknown
    }
    bollard::secret::ContainerSummaryStateEnum::CREATED => {
      ServiceStateKind::Created
    }
    bollard::secret::ContainerSummaryStateEnum::RUNNING => {
      ServiceStateKind::Running
    }
    bollard::secret::ContainerSummaryStateEnum::PAUSED => {
      ServiceStateKind::Stopped
    }
    bollard::secret::ContainerSummaryStateEnum::RESTARTING => {
      ServiceStateKind::Running
    }
    bollard::secret::ContainerSummaryStateEnum::EXITED => {
      ServiceStateKind::Exited
    }
    bollard::secret::ContainerSummaryStateEnum::REMOVING => {
      ServiceStateKind::Stopped
    }
    bollard::secret::ContainerSummaryStateEnum::DEAD => {
      ServiceStateKind::Exited
    }
  }
}

fn ignore_not_found(
  e: bollard::errors::Error,
) -> Result<(), bollard::errors::Error> {
  match e {
    bollard::errors::Error::DockerResponseServerError {
      status_code: 404,
      ..
    } => Ok(()),
    e => Err(e),
  }
}

fn ignore_not_modified(
  e: bollard::errors::Error,
) -> Result<(), bollard::errors::Error> {
  match e {
    bollard::errors::Error::DockerResponseServerError {
      status_code: 304,
      ..
    } => Ok(()),
    e => Err(e),
  }
}
