use std::{sync::Arc, time::Duration};

use anyhow::Context;
use armada_client::{
  ControlPlane,
  entities::{
    ServiceMetrics, ServiceStateKind, Timelength,
  },
};
use async_timing_util::wait_until_timelength;
use indexmap::IndexMap;
use tokio::time::timeout;

use crate::{
  bundle::CurrentBundle,
  engine::{ContainerEngine, service_label_filters},
  variables::Variables,
};

const PUSH_TIMEOUT: Duration = Duration::from_secs(60);

pub fn spawn_metrics_pusher(
  engine: Arc<dyn ContainerEngine>,
  api: Arc<dyn ControlPlane>,
  bundle: Arc<CurrentBundle>,
  variables: Arc<Variables>,
  polling_rate: Timelength,
) {
  tokio::spawn(async move {
    let polling_rate = polling_rate
      .try_into()
      .expect("invalid metrics polling rate");
    loop {
      wait_until_timelength(polling_rate, 200).await;
      let pushed = push_metrics_once(
        engine.as_ref(),
        api.as_ref(),
        &bundle,
        &variables,
      )
      .await;
      if let Err(e) = pushed {
        warn!("failed to push service metrics | {e:#}");
      }
    }
  });
}

/// Sample every running desired service once and push the rows
/// upstream, filtered by the device's metric allow list.
pub(crate) async fn push_metrics_once(
  engine: &dyn ContainerEngine,
  api: &dyn ControlPlane,
  bundle: &CurrentBundle,
  variables: &Variables,
) -> anyhow::Result<()> {
  let Some(bundle) = bundle.load() else {
    return Ok(());
  };
  let whitelist = variables.get().whitelisted_metrics.clone();
  let mut samples = Vec::new();
  for (application, app) in &bundle.applications {
    let Some(release) = app.latest_release() else {
      continue;
    };
    for service in release.services.keys() {
      let containers = engine
        .list_containers(&service_label_filters(
          application,
          service,
        ))
        .await?;
      let Some(running) = containers
        .into_iter()
        .find(|c| c.state == ServiceStateKind::Running)
      else {
        continue;
      };
      let stats = match engine.container_stats(&running.id).await {
        Ok(stats) => stats,
        Err(e) => {
          warn!(
            "failed to sample stats of {application}/{service} | {e:#}"
          );
          continue;
        }
      };
      let mut metrics = IndexMap::from([
        (String::from("cpu_percent"), stats.cpu_percent),
        (
          String::from("memory_usage_bytes"),
          stats.memory_usage_bytes as f64,
        ),
        (
          String::from("memory_limit_bytes"),
          stats.memory_limit_bytes as f64,
        ),
        (
          String::from("network_rx_bytes"),
          stats.network_rx_bytes as f64,
        ),
        (
          String::from("network_tx_bytes"),
          stats.network_tx_bytes as f64,
        ),
      ]);
      if let Some(whitelist) = &whitelist {
        metrics
          .retain(|name, _| whitelist.iter().any(|w| w == name));
      }
      samples.push(ServiceMetrics {
        application: application.clone(),
        service: service.clone(),
        metrics,
      });
    }
  }
  if samples.is_empty() {
    return Ok(());
  }
  timeout(PUSH_TIMEOUT, api.push_service_metrics(&samples))
    .await
    .context("timed out pushing service metrics")?
}
