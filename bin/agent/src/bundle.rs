use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::ArcSwapOption;
use armada_client::{
  ControlPlane,
  entities::{Bundle, MinimalBundle},
};
use async_timing_util::{Timelength, wait_until_timelength};
use tokio::{sync::watch, time::timeout};

use crate::{
  gc::StatusGarbageCollector, helpers, supervisor::Supervisor,
};

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// The latest accepted bundle, published by pointer swap.
/// Single writer (the applier), many readers (local api, metrics).
#[derive(Default)]
pub struct CurrentBundle(ArcSwapOption<Bundle>);

impl CurrentBundle {
  pub fn load(&self) -> Option<Arc<Bundle>> {
    self.0.load_full()
  }

  fn store(&self, bundle: Bundle) {
    self.0.store(Some(Arc::new(bundle)));
  }

  #[cfg(test)]
  pub fn set_for_tests(&self, bundle: Bundle) {
    self.store(bundle);
  }
}

/// Polls the control plane for the desired bundle, merges it with the
/// last known good bundle, persists it atomically, and fans it out to
/// the supervisor, the status gc, the updater, and readers of
/// [CurrentBundle].
pub struct BundleApplier {
  api: Arc<dyn ControlPlane>,
  supervisor: Arc<Supervisor>,
  gc: Arc<StatusGarbageCollector>,
  desired_agent_version: watch::Sender<String>,
  current: Arc<CurrentBundle>,
  path: PathBuf,
}

impl BundleApplier {
  pub fn new(
    api: Arc<dyn ControlPlane>,
    supervisor: Arc<Supervisor>,
    gc: Arc<StatusGarbageCollector>,
    desired_agent_version: watch::Sender<String>,
    current: Arc<CurrentBundle>,
    path: PathBuf,
  ) -> BundleApplier {
    BundleApplier {
      api,
      supervisor,
      gc,
      desired_agent_version,
      current,
      path,
    }
  }

  pub fn spawn(self) {
    tokio::spawn(async move {
      // Converge from the last known good bundle before the first
      // network call, so a disconnected device still comes up.
      match self.load_persisted() {
        Ok(Some(bundle)) => {
          info!("applying persisted bundle");
          self.dispatch(bundle).await;
        }
        Ok(None) => {}
        // Corrupt files are discarded, not deleted. The next
        // successful download overwrites them atomically.
        Err(e) => warn!("discarding persisted bundle | {e:#}"),
      }
      loop {
        wait_until_timelength(Timelength::FiveSeconds, 500).await;
        if let Err(e) = self.cycle().await {
          warn!("bundle cycle failed | {e:#}");
        }
      }
    });
  }

  pub(crate) fn load_persisted(
    &self,
  ) -> anyhow::Result<Option<Bundle>> {
    let Some(bytes) = helpers::read_optional_file(&self.path)?
    else {
      return Ok(None);
    };
    serde_json::from_slice(&bytes)
      .with_context(|| {
        format!("persisted bundle at {:?} is corrupt", self.path)
      })
      .map(Some)
  }

  pub(crate) async fn cycle(&self) -> anyhow::Result<()> {
    let bytes = timeout(FETCH_TIMEOUT, self.api.get_bundle_bytes())
      .await
      .context("timed out fetching bundle")?
      .context("failed to fetch bundle")?;
    let previous = self.current.load();
    let Some(bundle) = merge_bundle(previous.as_deref(), &bytes)
    else {
      anyhow::bail!(
        "bundle bytes failed both full and minimal parse"
      );
    };
    let json = serde_json::to_vec(&bundle)
      .context("failed to serialize bundle")?;
    helpers::atomic_write(&self.path, &json, 0o644)
      .context("failed to persist bundle")?;
    self.dispatch(bundle).await;
    Ok(())
  }

  /// Fixed fan out order: the supervisor reconciles first, then the
  /// gc learns the new pair set, then everything else.
  pub(crate) async fn dispatch(&self, bundle: Bundle) {
    self.supervisor.set(&bundle).await;
    self.gc.set_bundle(&bundle);
    self
      .desired_agent_version
      .send_replace(bundle.desired_agent_version.clone());
    self.current.store(bundle);
  }
}

/// A payload parsing as a full [Bundle] replaces the previous one
/// entirely. A payload parsing only as [MinimalBundle] keeps the
/// previous applications and policies, overwriting just the desired
/// agent version, so control plane schema drift cannot erase local
/// desired state. A payload parsing as neither yields None.
pub(crate) fn merge_bundle(
  previous: Option<&Bundle>,
  bytes: &[u8],
) -> Option<Bundle> {
  if let Ok(bundle) = serde_json::from_slice::<Bundle>(bytes) {
    return Some(bundle);
  }
  let minimal =
    serde_json::from_slice::<MinimalBundle>(bytes).ok()?;
  let mut bundle = previous.cloned().unwrap_or_default();
  bundle.desired_agent_version = minimal.desired_agent_version;
  Some(bundle)
}
