//! Port-forward coordination: tear down stale forwards, check the
//! application is listening, bring the devfile's endpoint mapping up.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use devloop_core::ComponentStatus;

use crate::ports::{AppPortChecker, PortForwarder};
use crate::EngineError;

const LISTEN_TIMEOUT: Duration = Duration::from_secs(60);
const LISTEN_TIMEOUT_ENV: &str = "DEVLOOP_PORT_CHECK_TIMEOUT_SECS";

fn listen_timeout() -> Duration {
    parse_listen_timeout(std::env::var(LISTEN_TIMEOUT_ENV).ok().as_deref())
}

fn parse_listen_timeout(raw: Option<&str>) -> Duration {
    raw.and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(LISTEN_TIMEOUT)
}

/// Brings forwarding in line with the devfile mapping. A replaced pod or a
/// changed endpoint set stops everything first; the listen check is
/// advisory because forwarding can still partially work.
pub(crate) async fn refresh(
    forwarder: &dyn PortForwarder,
    checker: &dyn AppPortChecker,
    status: &mut ComponentStatus,
    pod_name: &str,
    ports: &BTreeMap<String, Vec<u16>>,
    pod_changed: bool,
    ports_changed: bool,
) -> Result<(), EngineError> {
    if pod_changed || ports_changed {
        debug!(pod_changed, ports_changed, "stopping stale port forwards");
        forwarder.stop().await;
    }
    if ports.is_empty() {
        status.endpoints_forwarded = BTreeMap::new();
        return Ok(());
    }
    if let Err(err) = checker.wait_listening(pod_name, ports, listen_timeout()).await {
        warn!(error = format!("{err:#}"),
              "application not listening on all declared ports, forwarding anyway");
    }
    forwarder
        .start(pod_name, ports)
        .await
        .map_err(|err| EngineError::Other(err.context("starting port forwarding")))?;
    status.endpoints_forwarded = forwarder.forwarded_ports();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::ports::ForwardedPort;

    #[derive(Default)]
    struct RecordingForwarder {
        calls: Mutex<Vec<String>>,
        active: Mutex<BTreeMap<String, Vec<u16>>>,
    }

    #[async_trait]
    impl PortForwarder for RecordingForwarder {
        async fn start(
            &self,
            _pod_name: &str,
            ports: &BTreeMap<String, Vec<u16>>,
        ) -> anyhow::Result<Vec<ForwardedPort>> {
            self.calls.lock().unwrap().push("start".to_string());
            *self.active.lock().unwrap() = ports.clone();
            Ok(Vec::new())
        }

        async fn stop(&self) {
            self.calls.lock().unwrap().push("stop".to_string());
            self.active.lock().unwrap().clear();
        }

        fn forwarded_ports(&self) -> BTreeMap<String, Vec<u16>> {
            self.active.lock().unwrap().clone()
        }
    }

    struct OkChecker;

    #[async_trait]
    impl AppPortChecker for OkChecker {
        async fn wait_listening(
            &self,
            _pod_name: &str,
            _ports: &BTreeMap<String, Vec<u16>>,
            _timeout: Duration,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct DeafChecker;

    #[async_trait]
    impl AppPortChecker for DeafChecker {
        async fn wait_listening(
            &self,
            _pod_name: &str,
            _ports: &BTreeMap<String, Vec<u16>>,
            _timeout: Duration,
        ) -> anyhow::Result<()> {
            anyhow::bail!("port 3000 never came up")
        }
    }

    fn mapping() -> BTreeMap<String, Vec<u16>> {
        BTreeMap::from([("runtime".to_string(), vec![3000])])
    }

    #[test]
    fn listen_timeout_falls_back_on_bad_input() {
        assert_eq!(parse_listen_timeout(None), Duration::from_secs(60));
        assert_eq!(parse_listen_timeout(Some("soon")), Duration::from_secs(60));
        assert_eq!(parse_listen_timeout(Some("5")), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn a_replaced_pod_restarts_forwarding() {
        let forwarder = RecordingForwarder::default();
        let mut status = ComponentStatus::new();
        refresh(&forwarder, &OkChecker, &mut status, "pod-2", &mapping(), true, false)
            .await
            .unwrap();
        assert_eq!(*forwarder.calls.lock().unwrap(), vec!["stop", "start"]);
        assert_eq!(status.endpoints_forwarded, mapping());
    }

    #[tokio::test]
    async fn an_unchanged_pod_keeps_existing_forwards() {
        let forwarder = RecordingForwarder::default();
        let mut status = ComponentStatus::new();
        refresh(&forwarder, &OkChecker, &mut status, "pod-1", &mapping(), false, false)
            .await
            .unwrap();
        assert_eq!(*forwarder.calls.lock().unwrap(), vec!["start"]);
    }

    #[tokio::test]
    async fn a_failed_listen_check_is_not_fatal() {
        let forwarder = RecordingForwarder::default();
        let mut status = ComponentStatus::new();
        refresh(&forwarder, &DeafChecker, &mut status, "pod-1", &mapping(), false, true)
            .await
            .unwrap();
        assert_eq!(status.endpoints_forwarded, mapping());
    }

    #[tokio::test]
    async fn no_endpoints_means_no_forwarding() {
        let forwarder = RecordingForwarder::default();
        let mut status = ComponentStatus::new();
        status.endpoints_forwarded = mapping();
        refresh(
            &forwarder,
            &OkChecker,
            &mut status,
            "pod-1",
            &BTreeMap::new(),
            false,
            true,
        )
        .await
        .unwrap();
        assert_eq!(*forwarder.calls.lock().unwrap(), vec!["stop"]);
        assert!(status.endpoints_forwarded.is_empty());
    }
}
