use anyhow::anyhow;
use run_command::async_run_command;
use tokio::sync::watch;

/// Watches the bundle's desired agent version and runs the configured
/// self update command when it differs from the running version.
/// A failed update is retried when the desired version next changes;
/// the bundle applier re-sends on every accepted bundle anyway.
pub fn spawn_updater(
  mut desired_version: watch::Receiver<String>,
  update_command: String,
) {
  tokio::spawn(async move {
    loop {
      if desired_version.changed().await.is_err() {
        return;
      }
      let version = desired_version.borrow_and_update().clone();
      if let Err(e) = maybe_update(&version, &update_command).await
      {
        error!("self update to {version} failed | {e:#}");
      }
    }
  });
}

pub(crate) async fn maybe_update(
  version: &str,
  update_command: &str,
) -> anyhow::Result<()> {
  if version.is_empty() || version == env!("CARGO_PKG_VERSION") {
    return Ok(());
  }
  if update_command.is_empty() {
    debug!(
      "agent version {version} desired, but no update command is configured"
    );
    return Ok(());
  }
  info!("self updating to agent version {version}");
  let command = update_command.replace("{version}", version);
  let log = async_run_command(&command).await;
  if log.success() {
    info!("update command finished | {}", log.stdout);
    Ok(())
  } else {
    Err(anyhow!("{}", log.stderr.replace('\n', " | ")))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn current_version_is_a_noop() {
    maybe_update(env!("CARGO_PKG_VERSION"), "false")
      .await
      .unwrap();
    maybe_update("", "false").await.unwrap();
  }

  #[tokio::test]
  async fn missing_update_command_is_a_noop() {
    maybe_update("99.0.0", "").await.unwrap();
  }

  #[tokio::test]
  async fn update_command_runs_with_version_substituted() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("updated-to");
    let command =
      format!("cp /dev/null {}-{{version}}", marker.display());
    maybe_update("99.0.0", &command).await.unwrap();
    assert!(
      dir
        .path()
        .join("updated-to-99.0.0")
        .exists()
    );
  }

  #[tokio::test]
  async fn failing_update_command_errors() {
    let res =
      maybe_update("99.0.0", "ls /definitely/not/a/path").await;
    assert!(res.is_err());
  }
}
