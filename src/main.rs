//! devbridge - Local bridge server for browser-based device tooling
//!
//! Bridges a browser UI to embedded devices over WebSocket-to-TCP, publishes
//! local serial ports as TCP listeners, and answers mDNS discovery queries.

use anyhow::Result;
use clap::Parser;
use devbridge_core::config::{DEFAULT_PORT, DEFAULT_SCAN_INTERVAL_MS};
use devbridge_core::Config;
use devbridge_serial::{SerialMonitor, SerialRegistry};
use devbridge_server::{create_router, AppState};
use std::future::IntoFuture;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// devbridge - Bridge browser UIs to serial and network-attached devices
#[derive(Parser, Debug)]
#[command(name = "devbridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// HTTP/WebSocket server port
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "PORT")]
    port: u16,

    /// Serial port scan interval in milliseconds (0 disables the monitor)
    #[arg(long, default_value_t = DEFAULT_SCAN_INTERVAL_MS, env = "SERIAL_SCAN_INTERVAL")]
    serial_scan_interval: u64,

    /// Host to advertise to clients (auto-detected if omitted)
    #[arg(long, env = "ADVERTISE_HOST")]
    advertise_host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// DEBUG_MODE accepts the usual truthy spellings, not just clap's booleans.
fn debug_mode_env() -> bool {
    matches!(
        std::env::var("DEBUG_MODE").ok().as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let debug = args.debug || debug_mode_env();

    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    if debug {
        info!("debug mode enabled");
    }

    let config = Config::new()
        .with_port(args.port)
        .with_scan_interval(args.serial_scan_interval)
        .with_advertise_host(args.advertise_host)
        .with_debug(debug);

    info!("Local Bridge Server v{}", env!("CARGO_PKG_VERSION"));
    info!("access UI at http://{}:{}", config.advertised_host(), config.port);

    // Serial registry, monitor and the HTTP surface
    let registry = SerialRegistry::new();
    let monitor = Arc::new(SerialMonitor::new(registry.clone(), config.serial_scan_interval));
    monitor.start().await;

    let state = Arc::new(AppState::new(config.clone(), registry.clone(), monitor.clone()));
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;

    // select rather than graceful shutdown: live proxy sessions must not
    // hold the process open once a signal arrives
    tokio::select! {
        result = axum::serve(listener, router).into_future() => {
            result?;
        }
        _ = shutdown_signal() => {
            info!("graceful shutdown starting...");
        }
    }

    monitor.stop();
    registry.shutdown();
    info!("shutdown complete");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
