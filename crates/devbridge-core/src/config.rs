//! Configuration types for devbridge

use serde::{Deserialize, Serialize};

/// Default HTTP/WebSocket listen port
pub const DEFAULT_PORT: u16 = 8765;

/// Default serial rescan interval in milliseconds
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 10_000;

/// Main configuration for the bridge server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP/WebSocket listen port
    pub port: u16,
    /// Serial port rescan interval in milliseconds (0 disables the monitor)
    pub serial_scan_interval: u64,
    /// Host to advertise to clients (auto-detected if None)
    pub advertise_host: Option<String>,
    /// Verbose debug logging
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            serial_scan_interval: DEFAULT_SCAN_INTERVAL_MS,
            advertise_host: None,
            debug: false,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set serial rescan interval
    pub fn with_scan_interval(mut self, millis: u64) -> Self {
        self.serial_scan_interval = millis;
        self
    }

    /// Builder pattern: set advertised host
    pub fn with_advertise_host(mut self, host: Option<String>) -> Self {
        self.advertise_host = host;
        self
    }

    /// Builder pattern: set debug mode
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// The host clients should be pointed at: the configured override,
    /// the primary local IPv4, or loopback as a last resort.
    pub fn advertised_host(&self) -> String {
        if let Some(host) = &self.advertise_host {
            if !host.is_empty() {
                return host.clone();
            }
        }
        crate::net::primary_ipv4().unwrap_or_else(|| "127.0.0.1".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.serial_scan_interval, DEFAULT_SCAN_INTERVAL_MS);
        assert!(config.advertise_host.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn test_advertise_override() {
        let config = Config::new().with_advertise_host(Some("192.168.1.50".to_string()));
        assert_eq!(config.advertised_host(), "192.168.1.50");

        // Empty override falls through to auto-detection, which always
        // produces something usable.
        let config = Config::new().with_advertise_host(Some(String::new()));
        assert!(!config.advertised_host().is_empty());
    }
}
