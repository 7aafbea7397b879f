//! devbridge Discovery
//!
//! Finds devices a browser UI can bridge to:
//!
//! - **mDNS/DNS-SD**: browses the caller's requested service types in
//!   parallel, deduplicates across responders and returns a deterministic,
//!   sorted device list.
//!
//! - **Local serial**: folds the registry's published serial-port TCP
//!   servers into the same result shape, so the UI treats an attached
//!   USB-UART like any other discovered device.

mod error;
pub mod local;
pub mod mdns;

pub use error::{DiscoveryError, DiscoveryResult};
pub use local::local_serial_services;
pub use mdns::{clamp_timeout, scan, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS};

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport a discovered service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Serial,
    Usb,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Serial => "serial",
            Protocol::Usb => "usb",
        };
        f.write_str(s)
    }
}

/// A parsed form of one requested service type token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceType {
    pub ty: String,
    pub protocol: Protocol,
}

/// One discovery result, network or local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub ty: String,
    pub protocol: Protocol,
    pub fqdn: String,
    pub txt: HashMap<String, String>,
}

/// Tokens that request the local serial snapshot instead of a network browse.
pub fn is_local_serial_token(token: &str) -> bool {
    matches!(
        token.to_ascii_lowercase().as_str(),
        "local" | "local.serial" | "local:serial" | "local-serial"
    )
}

/// Parse one requested type token: a local-serial synonym, or an mDNS name
/// like `_hap._tcp` (any suffix tolerated). Unknown shapes yield None.
pub fn parse_service_type(token: &str) -> Option<ServiceType> {
    let token = token.to_ascii_lowercase();

    if is_local_serial_token(&token) {
        return Some(ServiceType { ty: "local".to_string(), protocol: Protocol::Serial });
    }

    if !token.starts_with('_') {
        return None;
    }
    let protocol = if token.contains("._tcp") {
        Protocol::Tcp
    } else if token.contains("._udp") {
        Protocol::Udp
    } else {
        return None;
    };

    let name = token.split('.').next()?.trim_start_matches('_');
    if name.is_empty() {
        return None;
    }
    Some(ServiceType { ty: name.to_string(), protocol })
}

/// Split the caller's comma-separated `types` value into network browse
/// targets plus whether any local-serial synonym appeared. Unparseable
/// tokens are dropped.
pub fn parse_type_list(csv: &str) -> (Vec<ServiceType>, bool) {
    let mut network = Vec::new();
    let mut wants_local = false;

    for token in csv.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if is_local_serial_token(token) {
            wants_local = true;
        } else if let Some(st) = parse_service_type(token) {
            network.push(st);
        }
    }

    (network, wants_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network_types() {
        let st = parse_service_type("_http._tcp").unwrap();
        assert_eq!(st.ty, "http");
        assert_eq!(st.protocol, Protocol::Tcp);

        let st = parse_service_type("_OSC._UDP.local.").unwrap();
        assert_eq!(st.ty, "osc");
        assert_eq!(st.protocol, Protocol::Udp);
    }

    #[test]
    fn test_parse_local_synonyms() {
        for token in ["local", "local.serial", "local:serial", "local-serial", "LOCAL"] {
            let st = parse_service_type(token).unwrap();
            assert_eq!(st.ty, "local");
            assert_eq!(st.protocol, Protocol::Serial);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_service_type("http").is_none());
        assert!(parse_service_type("_http").is_none());
        assert!(parse_service_type("_._tcp").is_none());
        assert!(parse_service_type("").is_none());
    }

    #[test]
    fn test_parse_type_list_mixed() {
        let (network, wants_local) = parse_type_list(" _http._tcp , local , nonsense ,, _osc._udp");
        assert_eq!(network.len(), 2);
        assert!(wants_local);

        let (network, wants_local) = parse_type_list("");
        assert!(network.is_empty());
        assert!(!wants_local);
    }

    #[test]
    fn test_service_info_json_roundtrip() {
        let info = ServiceInfo {
            name: "zigbee-gw".to_string(),
            host: "10.0.0.2".to_string(),
            port: 6638,
            ty: "zigstar_gw".to_string(),
            protocol: Protocol::Tcp,
            fqdn: "zigbee-gw".to_string(),
            txt: HashMap::from([("board".to_string(), "esp32".to_string())]),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"type\":\"zigstar_gw\""));
        assert!(json.contains("\"protocol\":\"tcp\""));
        let back: ServiceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
