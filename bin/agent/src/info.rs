use std::{sync::Arc, time::Duration};

use armada_client::{ControlPlane, entities::DeviceInfo};
use async_timing_util::{Timelength, wait_until_timelength};
use sysinfo::{Networks, System};
use tokio::time::timeout;

const PUSH_TIMEOUT: Duration = Duration::from_secs(60);

pub fn spawn_info_reporter(api: Arc<dyn ControlPlane>) {
  tokio::spawn(async move {
    loop {
      let info = collect_device_info();
      match timeout(PUSH_TIMEOUT, api.set_device_info(&info)).await
      {
        Ok(Ok(())) => debug!("pushed device info"),
        Ok(Err(e)) => warn!("failed to push device info | {e:#}"),
        Err(_) => warn!("timed out pushing device info"),
      }
      wait_until_timelength(Timelength::OneMinute, 2000).await;
    }
  });
}

pub(crate) fn collect_device_info() -> DeviceInfo {
  let system = System::new_all();
  DeviceInfo {
    agent_version: env!("CARGO_PKG_VERSION").to_string(),
    hostname: System::host_name().unwrap_or_default(),
    os_name: System::name().unwrap_or_default(),
    os_version: System::os_version().unwrap_or_default(),
    kernel_version: System::kernel_version().unwrap_or_default(),
    cpu_count: system.cpus().len() as u32,
    total_memory_bytes: system.total_memory(),
    ip_address: local_ip_address(),
  }
}

/// First non loopback ipv4 on the host, if any.
fn local_ip_address() -> Option<String> {
  let networks = Networks::new_with_refreshed_list();
  networks
    .iter()
    .filter(|(name, _)| *name != "lo")
    .flat_map(|(_, network)| network.ip_networks())
    .find(|ip| ip.addr.is_ipv4() && !ip.addr.is_loopback())
    .map(|ip| ip.addr.to_string())
}
