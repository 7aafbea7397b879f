//! devbridge Serial
//!
//! Publishes every local serial port as a TCP listener and forwards bytes
//! between a shared serial handle and any number of concurrent TCP clients:
//!
//! - **Registry**: process-wide owner of open serial handles, reference
//!   counts, per-path modem-line state and the path-to-TCP-port index.
//!
//! - **TCP server**: one listener per discovered tty; each accepted client
//!   gets a bidirectional pump session over the shared handle.
//!
//! - **Monitor**: periodic rescan that creates and tears down listeners as
//!   devices appear and disappear.

mod error;
pub mod monitor;
pub mod registry;
pub mod scan;
pub mod server;

pub use error::{SerialError, SerialResult};
pub use monitor::SerialMonitor;
pub use registry::{PortHandle, SerialRegistry};
pub use server::SerialTcpServer;

use serde::{Deserialize, Serialize};

/// Baud rate used when a port is first published, before any control call.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Baud rates the control surface accepts.
pub const VALID_BAUD_RATES: [u32; 8] =
    [9_600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800, 500_000];

pub fn is_valid_baud_rate(baud: u32) -> bool {
    VALID_BAUD_RATES.contains(&baud)
}

/// Identity of a physical serial port, captured once per scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortInfo {
    pub path: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub vendor_id: String,
    pub product_id: String,
}

impl SerialPortInfo {
    /// A port known only by path (the /dev glob fallback).
    pub fn unknown(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            manufacturer: "Unknown".to_string(),
            serial_number: String::new(),
            vendor_id: String::new(),
            product_id: String::new(),
        }
    }
}

/// Control-line and speed state for one path. Owned by the registry and kept
/// across open/close cycles, so a reset sequence configured before a device
/// reboot survives the reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialState {
    #[serde(rename = "DTR")]
    pub dtr: bool,
    #[serde(rename = "RTS")]
    pub rts: bool,
    #[serde(rename = "BaudRate")]
    pub baud_rate: u32,
}

impl Default for SerialState {
    fn default() -> Self {
        Self { dtr: false, rts: false, baud_rate: DEFAULT_BAUD }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_baud_rates() {
        assert!(is_valid_baud_rate(115_200));
        assert!(is_valid_baud_rate(500_000));
        assert!(!is_valid_baud_rate(9_601));
        assert!(!is_valid_baud_rate(0));
    }

    #[test]
    fn test_state_json_field_names() {
        let state = SerialState { dtr: true, rts: false, baud_rate: 230_400 };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["DTR"], true);
        assert_eq!(json["RTS"], false);
        assert_eq!(json["BaudRate"], 230_400);
    }

    #[test]
    fn test_state_default() {
        let state = SerialState::default();
        assert!(!state.dtr);
        assert!(!state.rts);
        assert_eq!(state.baud_rate, DEFAULT_BAUD);
    }
}
