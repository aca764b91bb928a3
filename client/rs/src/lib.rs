//! # Armada Client
//!
//! Device-side client for the Armada control plane, plus the entity
//! types shared between the agent, the on-host CLI, and the control
//! plane wire format.

use anyhow::{Context as _, anyhow};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::entities::{
  ApplicationStatus, DeviceInfo, RegisterDeviceRequest,
  RegisterDeviceResponse, ServiceMetrics, ServiceState,
  ServiceStatus,
};

pub mod api;
pub mod entities;

mod tunnel;

pub use tunnel::{BoxedTunnel, Tunnel, WsByteStream};

/// The device-side view of the control plane. The agent core only
/// depends on this trait, so tests can run against in-memory fakes.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
  async fn register_device(
    &self,
    registration_token: &str,
  ) -> anyhow::Result<RegisterDeviceResponse>;

  /// Raw bundle bytes. Parsing / merging is the caller's concern so a
  /// degraded control plane cannot erase local desired state.
  async fn get_bundle_bytes(&self) -> anyhow::Result<Bytes>;

  async fn set_device_application_status(
    &self,
    application: &str,
    status: &ApplicationStatus,
  ) -> anyhow::Result<()>;

  async fn set_device_service_status(
    &self,
    application: &str,
    service: &str,
    status: &ServiceStatus,
  ) -> anyhow::Result<()>;

  async fn set_device_service_state(
    &self,
    application: &str,
    service: &str,
    state: &ServiceState,
  ) -> anyhow::Result<()>;

  async fn delete_device_application_status(
    &self,
    application: &str,
  ) -> anyhow::Result<()>;

  async fn delete_device_service_status(
    &self,
    application: &str,
    service: &str,
  ) -> anyhow::Result<()>;

  async fn delete_device_service_state(
    &self,
    application: &str,
    service: &str,
  ) -> anyhow::Result<()>;

  async fn set_device_info(
    &self,
    info: &DeviceInfo,
  ) -> anyhow::Result<()>;

  async fn push_service_metrics(
    &self,
    metrics: &[ServiceMetrics],
  ) -> anyhow::Result<()>;

  /// Block until the control plane requests a remote session, then
  /// return the byte stream carrying it.
  async fn open_tunnel(&self) -> anyhow::Result<BoxedTunnel>;

  fn set_access_key(&self, access_key: String);

  fn set_device_id(&self, device_id: String);
}

/// Http implementation of [ControlPlane] against the real control
/// plane. Auth state is swapped in after registration / key load.
pub struct ApiClient {
  address: String,
  project_id: String,
  http: reqwest::Client,
  access_key: ArcSwapOption<String>,
  device_id: ArcSwapOption<String>,
}

impl ApiClient {
  pub fn new(
    address: impl Into<String>,
    project_id: impl Into<String>,
  ) -> ApiClient {
    ApiClient {
      address: address.into().trim_end_matches('/').to_string(),
      project_id: project_id.into(),
      http: reqwest::Client::new(),
      access_key: Default::default(),
      device_id: Default::default(),
    }
  }

  fn project_url(&self, suffix: &str) -> String {
    format!(
      "{}/v1/projects/{}{suffix}",
      self.address, self.project_id
    )
  }

  fn device_url(&self, suffix: &str) -> anyhow::Result<String> {
    let device_id = self.device_id.load();
    let device_id = device_id
      .as_deref()
      .context("device id not set on api client")?;
    Ok(self.project_url(&format!("/devices/{device_id}{suffix}")))
  }

  fn auth(&self) -> anyhow::Result<HeaderValue> {
    let access_key = self.access_key.load();
    let access_key = access_key
      .as_deref()
      .context("access key not set on api client")?;
    HeaderValue::from_str(&format!("Bearer {access_key}"))
      .context("access key is not a valid header value")
  }

  async fn post_json<B: serde::Serialize + ?Sized>(
    &self,
    url: String,
    body: &B,
  ) -> anyhow::Result<reqwest::Response> {
    let res = self
      .http
      .post(&url)
      .header(AUTHORIZATION, self.auth()?)
      .json(body)
      .send()
      .await
      .with_context(|| format!("failed request | POST {url}"))?;
    into_result(res).await
  }

  async fn delete(&self, url: String) -> anyhow::Result<()> {
    let res = self
      .http
      .delete(&url)
      .header(AUTHORIZATION, self.auth()?)
      .send()
      .await
      .with_context(|| format!("failed request | DELETE {url}"))?;
    into_result(res).await?;
    Ok(())
  }
}

async fn into_result(
  res: reqwest::Response,
) -> anyhow::Result<reqwest::Response> {
  let status = res.status();
  if status.is_success() {
    return Ok(res);
  }
  let text = res.text().await.unwrap_or_default();
  Err(anyhow!("{status} | {text}"))
}

#[async_trait]
impl ControlPlane for ApiClient {
  async fn register_device(
    &self,
    registration_token: &str,
  ) -> anyhow::Result<RegisterDeviceResponse> {
    let url = self.project_url("/devices/register");
    let res = self
      .http
      .post(&url)
      .json(&RegisterDeviceRequest {
        registration_token: registration_token.to_string(),
      })
      .send()
      .await
      .with_context(|| format!("failed request | POST {url}"))?;
    into_result(res)
      .await?
      .json()
      .await
      .context("failed to parse registration response")
  }

  async fn get_bundle_bytes(&self) -> anyhow::Result<Bytes> {
    let url = self.device_url("/bundle")?;
    let res = self
      .http
      .get(&url)
      .header(AUTHORIZATION, self.auth()?)
      .send()
      .await
      .with_context(|| format!("failed request | GET {url}"))?;
    into_result(res)
      .await?
      .bytes()
      .await
      .context("failed to read bundle bytes")
  }

  async fn set_device_application_status(
    &self,
    application: &str,
    status: &ApplicationStatus,
  ) -> anyhow::Result<()> {
    self
      .post_json(
        self
          .device_url(&format!("/applications/{application}/status"))?,
        status,
      )
      .await?;
    Ok(())
  }

  async fn set_device_service_status(
    &self,
    application: &str,
    service: &str,
    status: &ServiceStatus,
  ) -> anyhow::Result<()> {
    self
      .post_json(
        self.device_url(&format!(
          "/applications/{application}/services/{service}/status"
        ))?,
        status,
      )
      .await?;
    Ok(())
  }

  async fn set_device_service_state(
    &self,
    application: &str,
    service: &str,
    state: &ServiceState,
  ) -> anyhow::Result<()> {
    self
      .post_json(
        self.device_url(&format!(
          "/applications/{application}/services/{service}/state"
        ))?,
        state,
      )
      .await?;
    Ok(())
  }

  async fn delete_device_application_status(
    &self,
    application: &str,
  ) -> anyhow::Result<()> {
    self
      .delete(
        self
          .device_url(&format!("/applications/{application}/status"))?,
      )
      .await
  }

  async fn delete_device_service_status(
    &self,
    application: &str,
    service: &str,
  ) -> anyhow::Result<()> {
    self
      .delete(self.device_url(&format!(
        "/applications/{application}/services/{service}/status"
      ))?)
      .await
  }

  async fn delete_device_service_state(
    &self,
    application: &str,
    service: &str,
  ) -> anyhow::Result<()> {
    self
      .delete(self.device_url(&format!(
        "/applications/{application}/services/{service}/state"
      ))?)
      .await
  }

  async fn set_device_info(
    &self,
    info: &DeviceInfo,
  ) -> anyhow::Result<()> {
    self.post_json(self.device_url("/info")?, info).await?;
    Ok(())
  }

  async fn push_service_metrics(
    &self,
    metrics: &[ServiceMetrics],
  ) -> anyhow::Result<()> {
    self.post_json(self.device_url("/metrics")?, metrics).await?;
    Ok(())
  }

  async fn open_tunnel(&self) -> anyhow::Result<BoxedTunnel> {
    let url = self
      .device_url("/tunnel")?
      .replacen("http", "ws", 1);
    let mut request = url
      .clone()
      .into_client_request()
      .context("failed to build tunnel request")?;
    request.headers_mut().insert(AUTHORIZATION, self.auth()?);
    let (ws, _) = tokio_tungstenite::connect_async(request)
      .await
      .with_context(|| format!("failed to connect tunnel | {url}"))?;
    tracing::debug!("tunnel connected | {url}");
    Ok(Box::new(WsByteStream::new(ws)))
  }

  fn set_access_key(&self, access_key: String) {
    self.access_key.store(Some(access_key.into()));
  }

  fn set_device_id(&self, device_id: String) {
    self.device_id.store(Some(device_id.into()));
  }
}
