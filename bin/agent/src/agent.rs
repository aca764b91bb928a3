use std::{
  os::unix::fs::DirBuilderExt,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use anyhow::Context;
use armada_client::{ApiClient, ControlPlane};
use tokio::{
  sync::watch,
  time::{interval, timeout},
};

use crate::{
  bundle::{BundleApplier, CurrentBundle},
  config::agent_config,
  docker::DockerEngine,
  engine::ContainerEngine,
  gc::StatusGarbageCollector,
  helpers,
  supervisor::Supervisor,
  validators::default_validators,
  variables::{Variables, spawn_variables_watcher},
};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(60);

const ACCESS_KEY_FILE: &str = "access-key";
const DEVICE_ID_FILE: &str = "device-id";
const BUNDLE_FILE: &str = "bundle";
const GC_LEDGER_FILE: &str = "gc-ledger";

/// Composition root. [Agent::initialize] is the only place an error
/// can abort the process; every worker spawned by [Agent::run] logs
/// and continues.
pub struct Agent {
  api: Arc<dyn ControlPlane>,
  engine: Arc<dyn ContainerEngine>,
  variables: Arc<Variables>,
  bundle: Arc<CurrentBundle>,
  listener: std::net::TcpListener,
  project_dir: PathBuf,
}

impl Agent {
  pub async fn initialize() -> anyhow::Result<Agent> {
    let config = agent_config();
    anyhow::ensure!(
      !env!("CARGO_PKG_VERSION").is_empty(),
      "agent version is empty"
    );
    anyhow::ensure!(
      !config.project_id.is_empty(),
      "project_id must be configured"
    );

    let project_dir =
      config.state_directory.join(&config.project_id);
    std::fs::DirBuilder::new()
      .recursive(true)
      .mode(0o700)
      .create(&project_dir)
      .with_context(|| {
        format!("failed to create state directory {project_dir:?}")
      })?;

    let api: Arc<dyn ControlPlane> = Arc::new(ApiClient::new(
      &config.controller_address,
      &config.project_id,
    ));
    initialize_credentials(
      api.as_ref(),
      &project_dir,
      &config.registration_token,
    )
    .await?;

    let variables =
      Variables::init(config.variables_directory.clone())
        .context("failed to start variables watcher")?;

    let listener = bind_server_listener(config.server_port).await;

    let engine: Arc<dyn ContainerEngine> =
      Arc::new(DockerEngine::default());

    Ok(Agent {
      api,
      engine,
      variables,
      bundle: Arc::new(CurrentBundle::default()),
      listener,
      project_dir,
    })
  }

  /// Spawn every worker, then serve the local api in the foreground.
  pub async fn run(self) -> anyhow::Result<()> {
    let Agent {
      api,
      engine,
      variables,
      bundle,
      listener,
      project_dir,
    } = self;
    let config = agent_config();

    spawn_variables_watcher(variables.clone());

    let supervisor = Supervisor::new(
      engine.clone(),
      api.clone(),
      default_validators(variables.clone()),
      Duration::from_secs(config.container_stop_grace),
    );
    let gc = StatusGarbageCollector::new(
      api.clone(),
      project_dir.join(GC_LEDGER_FILE),
    );
    gc.clone().spawn();

    let (desired_version_tx, desired_version_rx) =
      watch::channel(String::new());
    crate::update::spawn_updater(
      desired_version_rx,
      config.update_command.clone(),
    );
    crate::info::spawn_info_reporter(api.clone());
    crate::metrics::spawn_metrics_pusher(
      engine.clone(),
      api.clone(),
      bundle.clone(),
      variables.clone(),
      config.metrics_polling_rate,
    );
    crate::remote::spawn_remote_server(
      api.clone(),
      variables.clone(),
      config.ssh_endpoint.clone(),
    );

    BundleApplier::new(
      api,
      supervisor,
      gc,
      desired_version_tx,
      bundle.clone(),
      project_dir.join(BUNDLE_FILE),
    )
    .spawn();

    crate::api::serve(listener, engine, bundle).await
  }
}

/// Load the persisted device identity, or register with the control
/// plane and persist it atomically. Either way the api client ends up
/// authenticated.
pub(crate) async fn initialize_credentials(
  api: &dyn ControlPlane,
  project_dir: &Path,
  registration_token: &str,
) -> anyhow::Result<()> {
  let access_key_path = project_dir.join(ACCESS_KEY_FILE);
  let device_id_path = project_dir.join(DEVICE_ID_FILE);
  let access_key = helpers::read_optional_string(&access_key_path)?;
  let device_id = helpers::read_optional_string(&device_id_path)?;

  if let (Some(access_key), Some(device_id)) =
    (access_key, device_id)
  {
    info!("loaded device identity {device_id}");
    api.set_access_key(access_key);
    api.set_device_id(device_id);
    return Ok(());
  }

  anyhow::ensure!(
    !registration_token.is_empty(),
    "device is not registered and no registration_token is configured"
  );
  info!("registering device with control plane");
  let registered = timeout(
    REGISTER_TIMEOUT,
    api.register_device(registration_token),
  )
  .await
  .context("timed out registering device")?
  .context("failed to register device")?;

  helpers::atomic_write(
    &access_key_path,
    registered.access_key.as_bytes(),
    0o600,
  )?;
  helpers::atomic_write(
    &device_id_path,
    registered.device_id.as_bytes(),
    0o600,
  )?;
  info!("registered as device {}", registered.device_id);
  api.set_access_key(registered.access_key);
  api.set_device_id(registered.device_id);
  Ok(())
}

/// The local api port belongs to this agent. If another process still
/// holds it (usually a previous agent shutting down), keep trying on
/// a 1s tick until the bind succeeds.
async fn bind_server_listener(
  port: u16,
) -> std::net::TcpListener {
  let addr = format!("127.0.0.1:{port}");
  let mut ticker = interval(Duration::from_secs(1));
  loop {
    ticker.tick().await;
    match std::net::TcpListener::bind(&addr) {
      Ok(listener) => {
        info!("local api listener bound on {addr}");
        return listener;
      }
      Err(e) => {
        warn!("failed to bind local api on {addr}, retrying | {e:?}")
      }
    }
  }
}
