//! Periodic serial port monitor.
//!
//! Rescans the local ports on a fixed interval and reconciles the registry
//! with what is actually plugged in: new paths get a TCP server, vanished
//! paths get their listener and handle torn down.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::SerialRegistry;
use crate::server::SerialTcpServer;
use crate::{scan, SerialPortInfo};

/// Rescan driver. Interval 0 disables the periodic loop entirely; `sync_now`
/// still works for on-demand refreshes.
pub struct SerialMonitor {
    registry: Arc<SerialRegistry>,
    interval_ms: u64,
    cancel: CancellationToken,
}

impl SerialMonitor {
    pub fn new(registry: Arc<SerialRegistry>, interval_ms: u64) -> Self {
        Self { registry, interval_ms, cancel: CancellationToken::new() }
    }

    /// Start the periodic loop. Runs one synchronous pass first so the
    /// registry is populated before the server starts answering queries.
    pub async fn start(&self) {
        if self.interval_ms == 0 {
            debug!("serial monitor disabled (interval 0)");
            return;
        }

        self.sync_now().await;

        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        let interval = Duration::from_millis(self.interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let ports = tokio::task::spawn_blocking(scan::list_ports)
                    .await
                    .unwrap_or_default();
                sync_registry(&registry, ports).await;
            }
            debug!("serial monitor stopped");
        });

        info!("serial monitor started, interval {} ms", self.interval_ms);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One reconcile pass against a fresh scan.
    pub async fn sync_now(&self) {
        let ports = tokio::task::spawn_blocking(scan::list_ports)
            .await
            .unwrap_or_default();
        sync_registry(&self.registry, ports).await;
    }
}

/// Reconcile the registry against an observed port list: publish servers for
/// new paths, tear down state for paths that disappeared.
pub(crate) async fn sync_registry(registry: &Arc<SerialRegistry>, ports: Vec<SerialPortInfo>) {
    for info in &ports {
        registry.record_details(info.clone());
        if registry.tcp_port_for_path(&info.path).is_none() {
            match SerialTcpServer::spawn(registry.clone(), &info.path).await {
                Ok(server) => {
                    debug!("published {} on tcp port {}", server.path, server.tcp_port);
                }
                Err(e) => warn!("failed to create tcp server for {}: {}", info.path, e),
            }
        }
    }

    for known in registry.server_paths() {
        if !ports.iter().any(|p| p.path == known) {
            registry.remove_path(&known);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_convergence() {
        let registry = SerialRegistry::new();

        // Appearance: one tick later a listener exists and the index maps it.
        let info = SerialPortInfo::unknown("/dev/ttyUSB0");
        sync_registry(&registry, vec![info.clone()]).await;

        let tcp_port = registry.tcp_port_for_path("/dev/ttyUSB0").expect("listener published");
        assert_eq!(registry.path_for_tcp_port(tcp_port).as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(registry.details("/dev/ttyUSB0"), Some(info));

        // Listener genuinely accepts.
        let conn = tokio::net::TcpStream::connect(("127.0.0.1", tcp_port)).await;
        assert!(conn.is_ok());

        // Stable across ticks: same port, no duplicate server.
        sync_registry(&registry, vec![SerialPortInfo::unknown("/dev/ttyUSB0")]).await;
        assert_eq!(registry.tcp_port_for_path("/dev/ttyUSB0"), Some(tcp_port));

        // Disappearance: maps purged within one tick.
        sync_registry(&registry, Vec::new()).await;
        assert_eq!(registry.tcp_port_for_path("/dev/ttyUSB0"), None);
        assert_eq!(registry.path_for_tcp_port(tcp_port), None);
        assert!(registry.details("/dev/ttyUSB0").is_none());
        assert!(registry.server_paths().is_empty());
    }

    #[tokio::test]
    async fn test_two_ports_one_vanishes() {
        let registry = SerialRegistry::new();
        let ports = vec![
            SerialPortInfo::unknown("/dev/ttyACM0"),
            SerialPortInfo::unknown("/dev/ttyACM1"),
        ];
        sync_registry(&registry, ports).await;
        assert_eq!(registry.server_paths().len(), 2);

        sync_registry(&registry, vec![SerialPortInfo::unknown("/dev/ttyACM1")]).await;
        assert_eq!(registry.tcp_port_for_path("/dev/ttyACM0"), None);
        assert!(registry.tcp_port_for_path("/dev/ttyACM1").is_some());
    }
}
