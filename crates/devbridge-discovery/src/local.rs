//! Local serial ports presented as discovery results.

use std::collections::HashMap;

use devbridge_serial::SerialRegistry;

use crate::{Protocol, ServiceInfo};

/// Snapshot the registry's published serial servers as synthetic
/// `ServiceInfo` entries, sorted by path. The UI connects to these exactly
/// like network devices: host is this bridge, port is the per-path TCP
/// listener.
pub fn local_serial_services(registry: &SerialRegistry, host: &str) -> Vec<ServiceInfo> {
    registry
        .snapshot_servers()
        .into_iter()
        .map(|(path, tcp_port, details)| {
            let protocol = if path.contains("USB") || path.contains("usb") {
                Protocol::Usb
            } else {
                Protocol::Serial
            };
            let txt = HashMap::from([
                ("board".to_string(), details.manufacturer),
                ("serial_number".to_string(), details.serial_number),
                ("vendor_id".to_string(), details.vendor_id),
                ("product_id".to_string(), details.product_id),
            ]);
            ServiceInfo {
                name: path.clone(),
                host: host.to_string(),
                port: tcp_port,
                ty: "local".to_string(),
                protocol,
                fqdn: path,
                txt,
            }
        })
        .collect()
}
