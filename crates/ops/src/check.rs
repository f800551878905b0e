//! Waits for the application to actually listen on its declared ports,
//! observed from /proc/net inside the container.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tracing::debug;

use devloop_engine::ports::AppPortChecker;

use crate::exec;
use crate::SHELL;

/// The IPv6 files are missing when that stack is disabled, hence the
/// trailing `|| true`.
const PROC_NET_CMD: &str =
    "cat /proc/net/tcp /proc/net/udp /proc/net/tcp6 /proc/net/udp6 || true";
/// Kernel socket state for a listening TCP socket.
const TCP_LISTEN: u8 = 0x0a;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

pub struct ProcNetPortChecker {
    client: Client,
    namespace: String,
}

impl ProcNetPortChecker {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl AppPortChecker for ProcNetPortChecker {
    async fn wait_listening(
        &self,
        pod_name: &str,
        ports: &BTreeMap<String, Vec<u16>>,
        timeout: Duration,
    ) -> Result<()> {
        if ports.is_empty() {
            return Ok(());
        }
        let api = exec::pods(&self.client, &self.namespace);
        let deadline = tokio::time::Instant::now() + timeout;
        let waits = ports
            .iter()
            .filter(|(_, container_ports)| !container_ports.is_empty())
            .map(|(container, container_ports)| {
                wait_container(api.clone(), pod_name, container, container_ports, deadline)
            });
        futures::future::try_join_all(waits).await?;
        Ok(())
    }
}

async fn wait_container(
    api: Api<Pod>,
    pod_name: &str,
    container: &str,
    ports: &[u16],
    deadline: tokio::time::Instant,
) -> Result<()> {
    let mut delay = BACKOFF_START;
    loop {
        let command = vec![SHELL.to_string(), "-c".to_string(), PROC_NET_CMD.to_string()];
        let missing: Vec<u16> = match exec::run_capture(&api, pod_name, container, command).await {
            Ok(out) => {
                let listening = listening_ports(&out.stdout);
                ports
                    .iter()
                    .copied()
                    .filter(|p| !listening.contains(p))
                    .collect()
            }
            Err(e) => {
                debug!(container = %container, error = %e, "listen probe failed");
                ports.to_vec()
            }
        };
        if missing.is_empty() {
            debug!(container = %container, "all application ports listening");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "port(s) {missing:?} in container {container} never reached LISTEN state"
            );
        }
        let wake = std::cmp::min(tokio::time::Instant::now() + delay, deadline);
        tokio::time::sleep_until(wake).await;
        delay = std::cmp::min(delay * 2, BACKOFF_CAP);
    }
}

/// Local ports in LISTEN state, parsed from concatenated /proc/net tables.
/// Only the local port and state columns matter; everything else on the
/// line is ignored.
fn listening_ports(proc_net: &str) -> BTreeSet<u16> {
    let mut out = BTreeSet::new();
    for line in proc_net.lines() {
        if line.contains("local_address") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let state = match u8::from_str_radix(fields[3], 16) {
            Ok(state) => state,
            Err(_) => continue,
        };
        if state != TCP_LISTEN {
            continue;
        }
        let port_hex = match fields[1].rsplit_once(':') {
            Some((_, port_hex)) => port_hex,
            None => continue,
        };
        if let Ok(port) = u16::from_str_radix(port_hex, 16) {
            out.insert(port);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 0100007F:0016 01 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 20 4 30 10 -1
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
   2: 00000000:0035 00000000:0000 07 00000000:00000000 00:00000000 00000000   102        0 20000 2 0000000000000000 0
   0: 00000000000000000000000000000000:238C 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 30000 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn listen_entries_are_extracted_across_tables() {
        let ports = listening_ports(SAMPLE);
        // 0x0BB8 from tcp, 0x238C from tcp6; the established connection and
        // the udp socket do not count.
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![3000, 9100]);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let ports = listening_ports("nonsense\n1: short\n");
        assert!(ports.is_empty());
    }
}
