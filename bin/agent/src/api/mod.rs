use std::sync::Arc;

use anyhow::Context;
use armada_client::api::{
  GetBundle, GetBundleResponse, GetContainerLog,
  GetContainerLogResponse, GetHealth, GetHealthResponse,
  GetVersion, GetVersionResponse, ListContainers,
  ListContainersResponse,
};
use armada_client::entities::ContainerListItem;
use axum::{
  Json, Router, extract::State, response::IntoResponse,
  response::Response, routing::post,
};
use resolver_api::Resolve;
use serde::{Deserialize, Serialize};

use crate::{
  bundle::CurrentBundle,
  engine::{
    APPLICATION_LABEL, ContainerEngine, MANAGED_LABEL,
    RELEASE_LABEL, SERVICE_LABEL,
  },
};

pub struct Args {
  pub engine: Arc<dyn ContainerEngine>,
  pub bundle: Arc<CurrentBundle>,
}

/// The device local control API, used by the on-host CLI over
/// `127.0.0.1:<server_port>`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "params")]
pub enum AgentRequest {
  GetHealth(GetHealth),
  GetVersion(GetVersion),
  GetBundle(GetBundle),
  ListContainers(ListContainers),
  GetContainerLog(GetContainerLog),
}

/// Serve the local api over the listener bound during
/// initialization.
pub async fn serve(
  listener: std::net::TcpListener,
  engine: Arc<dyn ContainerEngine>,
  bundle: Arc<CurrentBundle>,
) -> anyhow::Result<()> {
  let args = Arc::new(Args { engine, bundle });
  let app = Router::new()
    .route("/", post(handler))
    .with_state(args)
    .into_make_service();
  info!(
    "Local API starting on http://{}",
    listener
      .local_addr()
      .context("failed to read local api address")?
  );
  axum_server::from_tcp(listener)
    .serve(app)
    .await
    .context("failed to start local api server")
}

#[instrument(level = "debug", skip_all)]
async fn handler(
  State(args): State<Arc<Args>>,
  Json(request): Json<AgentRequest>,
) -> serror::Result<Response> {
  debug!("handling local api request | {request:?}");
  let response = match request {
    AgentRequest::GetHealth(request) => {
      Json(request.resolve(&args).await?).into_response()
    }
    AgentRequest::GetVersion(request) => {
      Json(request.resolve(&args).await?).into_response()
    }
    AgentRequest::GetBundle(request) => {
      Json(request.resolve(&args).await?).into_response()
    }
    AgentRequest::ListContainers(request) => {
      Json(request.resolve(&args).await?).into_response()
    }
    AgentRequest::GetContainerLog(request) => {
      Json(request.resolve(&args).await?).into_response()
    }
  };
  Ok(response)
}

impl Resolve<Args> for GetHealth {
  #[instrument(name = "GetHealth", level = "debug", skip_all)]
  async fn resolve(
    self,
    _: &Args,
  ) -> serror::Result<GetHealthResponse> {
    Ok(GetHealthResponse {})
  }
}

impl Resolve<Args> for GetVersion {
  #[instrument(name = "GetVersion", level = "debug", skip(self))]
  async fn resolve(
    self,
    _: &Args,
  ) -> serror::Result<GetVersionResponse> {
    Ok(GetVersionResponse {
      version: env!("CARGO_PKG_VERSION").to_string(),
    })
  }
}

impl Resolve<Args> for GetBundle {
  #[instrument(name = "GetBundle", level = "debug", skip_all)]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<GetBundleResponse> {
    Ok(args.bundle.load().map(|bundle| (*bundle).clone()))
  }
}

impl Resolve<Args> for ListContainers {
  #[instrument(name = "ListContainers", level = "debug", skip_all)]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<ListContainersResponse> {
    let containers = args
      .engine
      .list_containers(&[(
        MANAGED_LABEL.to_string(),
        String::from("true"),
      )])
      .await?;
    let containers = containers
      .into_iter()
      .map(|container| ContainerListItem {
        application: container.label(APPLICATION_LABEL).to_string(),
        service: container.label(SERVICE_LABEL).to_string(),
        release: container.label(RELEASE_LABEL).to_string(),
        id: Some(container.id),
        name: container.name,
        state: container.state,
        image: container.image,
      })
      .collect();
    Ok(containers)
  }
}

impl Resolve<Args> for GetContainerLog {
  #[instrument(name = "GetContainerLog", level = "debug", skip_all)]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<GetContainerLogResponse> {
    Ok(
      args
        .engine
        .container_logs(&self.container, self.tail)
        .await?,
    )
  }
}
