#[macro_use]
extern crate tracing;

use crate::config::agent_config;

mod agent;
mod api;
mod bundle;
mod config;
mod docker;
mod engine;
mod gc;
mod helpers;
mod info;
mod metrics;
mod remote;
mod reporter;
mod supervisor;
mod update;
mod validators;
mod variables;

#[cfg(test)]
mod testing;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = agent_config();
  logger::init(&config.logging)?;
  if let Err(e) =
    rustls::crypto::aws_lc_rs::default_provider().install_default()
  {
    error!("Failed to install default crypto provider | {e:?}");
    std::process::exit(1);
  };

  info!("Armada Agent version: v{}", env!("CARGO_PKG_VERSION"));

  if config.pretty_startup_config {
    info!("{:#?}", config.sanitized());
  } else {
    info!("{:?}", config.sanitized());
  }

  let agent = agent::Agent::initialize().await?;
  agent.run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
