use std::{sync::Arc, time::Duration};

use anyhow::Context;
use armada_client::{BoxedTunnel, ControlPlane};
use tokio::time::interval;

use crate::variables::Variables;

/// Keeps a tunnel request open against the control plane and proxies
/// each accepted session to the local sshd. Vetoed entirely while the
/// DisableSSH variable is set; connection errors retry on a 1s tick.
pub fn spawn_remote_server(
  api: Arc<dyn ControlPlane>,
  variables: Arc<Variables>,
  ssh_endpoint: String,
) {
  tokio::spawn(async move {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
      ticker.tick().await;
      if variables.get().disable_ssh {
        continue;
      }
      let tunnel = match api.open_tunnel().await {
        Ok(tunnel) => tunnel,
        Err(e) => {
          debug!("failed to open remote tunnel | {e:#}");
          continue;
        }
      };
      info!("remote session opened");
      let ssh_endpoint = ssh_endpoint.clone();
      tokio::spawn(async move {
        match proxy_tunnel(tunnel, &ssh_endpoint).await {
          Ok(()) => info!("remote session closed"),
          Err(e) => warn!("remote session failed | {e:#}"),
        }
      });
    }
  });
}

pub(crate) async fn proxy_tunnel(
  mut tunnel: BoxedTunnel,
  endpoint: &str,
) -> anyhow::Result<()> {
  let mut local = tokio::net::TcpStream::connect(endpoint)
    .await
    .with_context(|| format!("failed to connect to {endpoint}"))?;
  tokio::io::copy_bidirectional(&mut tunnel, &mut local)
    .await
    .context("tunnel io failed")?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::*;

  #[tokio::test]
  async fn tunnel_bytes_reach_the_local_endpoint() {
    // Echo server standing in for sshd.
    let listener =
      tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 5];
      socket.read_exact(&mut buf).await.unwrap();
      socket.write_all(&buf).await.unwrap();
    });

    let (control_plane_side, agent_side) =
      tokio::io::duplex(1024);
    let proxy = tokio::spawn(async move {
      proxy_tunnel(Box::new(agent_side), &endpoint).await
    });

    let (mut read_half, mut write_half) =
      tokio::io::split(control_plane_side);
    write_half.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    read_half.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");
    drop(write_half);
    drop(read_half);
    proxy.await.unwrap().unwrap();
  }
}
