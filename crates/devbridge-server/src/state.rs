//! Shared application state

use std::sync::Arc;

use devbridge_core::Config;
use devbridge_serial::{SerialMonitor, SerialRegistry};

/// State handed to every handler: the configuration, the serial registry,
/// and the monitor (for on-demand rescans from the discovery endpoint).
pub struct AppState {
    pub config: Config,
    pub registry: Arc<SerialRegistry>,
    pub monitor: Arc<SerialMonitor>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<SerialRegistry>, monitor: Arc<SerialMonitor>) -> Self {
        Self { config, registry, monitor }
    }
}
