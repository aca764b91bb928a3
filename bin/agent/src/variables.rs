use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use arc_swap::ArcSwap;
use async_timing_util::{Timelength, wait_until_timelength};

/// File names watched inside the variables directory.
/// Flag variables are enabled by the file's presence,
/// list variables hold one entry per line.
const DISABLE_SSH: &str = "disable-ssh";
const DISABLE_CUSTOM_COMMANDS: &str = "disable-custom-commands";
const DISABLE_PRIVILEGED: &str = "disable-privileged";
const WHITELISTED_IMAGES: &str = "whitelisted-images";
const WHITELISTED_METRICS: &str = "whitelisted-metrics";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableSet {
  pub disable_ssh: bool,
  pub disable_custom_commands: bool,
  pub disable_privileged: bool,
  /// None means all images are allowed.
  pub whitelisted_images: Option<Vec<String>>,
  /// None means all metrics are allowed.
  pub whitelisted_metrics: Option<Vec<String>>,
}

/// Device policy toggles sourced from the variables directory.
/// The directory is polled, and the current value is always readable
/// without blocking.
pub struct Variables {
  directory: PathBuf,
  current: ArcSwap<VariableSet>,
}

impl Variables {
  pub fn init(directory: PathBuf) -> anyhow::Result<Arc<Variables>> {
    let initial = read_variable_set(&directory)?;
    Ok(Arc::new(Variables {
      directory,
      current: ArcSwap::from_pointee(initial),
    }))
  }

  pub fn get(&self) -> Arc<VariableSet> {
    self.current.load_full()
  }

  /// Re-reads the directory. Returns whether anything changed.
  pub fn refresh(&self) -> anyhow::Result<bool> {
    let next = read_variable_set(&self.directory)?;
    if next == **self.current.load() {
      return Ok(false);
    }
    self.current.store(Arc::new(next));
    Ok(true)
  }
}

pub fn spawn_variables_watcher(variables: Arc<Variables>) {
  tokio::spawn(async move {
    loop {
      wait_until_timelength(Timelength::OneSecond, 100).await;
      match variables.refresh() {
        Ok(true) => {
          info!("device variables changed | {:?}", variables.get())
        }
        Ok(false) => {}
        Err(e) => warn!("failed to refresh device variables | {e:#}"),
      }
    }
  });
}

fn read_variable_set(
  directory: &PathBuf,
) -> anyhow::Result<VariableSet> {
  if !directory.is_dir() {
    // A missing directory is a valid install without local policy.
    return Ok(VariableSet::default());
  }
  // Surface unreadable directories instead of silently
  // reporting default policy.
  std::fs::read_dir(directory).with_context(|| {
    format!("failed to read variables directory {directory:?}")
  })?;
  Ok(VariableSet {
    disable_ssh: directory.join(DISABLE_SSH).exists(),
    disable_custom_commands: directory
      .join(DISABLE_CUSTOM_COMMANDS)
      .exists(),
    disable_privileged: directory.join(DISABLE_PRIVILEGED).exists(),
    whitelisted_images: read_list(
      &directory.join(WHITELISTED_IMAGES),
    ),
    whitelisted_metrics: read_list(
      &directory.join(WHITELISTED_METRICS),
    ),
  })
}

fn read_list(path: &PathBuf) -> Option<Vec<String>> {
  let contents = std::fs::read_to_string(path).ok()?;
  Some(
    contents
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect(),
  )
}
