//! Parallel mDNS browse aggregation.
//!
//! Each requested service type gets its own daemon and its own task, all
//! bounded by the same clamped deadline. The task boundary doubles as the
//! panic barrier: the resolver library is known to panic on some malformed
//! responses, and a panicking browse must cost us only that one type's
//! results.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{DiscoveryError, DiscoveryResult, Protocol, ServiceInfo, ServiceType};

pub const MIN_TIMEOUT_MS: u64 = 500;
pub const MAX_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

/// Clamp a caller-supplied browse timeout into the supported window.
pub fn clamp_timeout(ms: Option<u64>) -> u64 {
    ms.unwrap_or(DEFAULT_TIMEOUT_MS).clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

/// Browse every network type in `types` concurrently and return a
/// deduplicated, `(name, host, port)`-sorted device list. `fallback_host`
/// stands in for responders that advertise no usable address.
pub async fn scan(types: &[ServiceType], timeout_ms: u64, fallback_host: &str) -> Vec<ServiceInfo> {
    let network: Vec<ServiceType> = types
        .iter()
        .filter(|st| matches!(st.protocol, Protocol::Tcp | Protocol::Udp))
        .cloned()
        .collect();
    if network.is_empty() {
        debug!("no valid services requested for scan");
        return Vec::new();
    }

    let labels: Vec<String> =
        network.iter().map(|st| format!("{}.{}", st.ty, st.protocol)).collect();
    info!("scanning for: {} with timeout {} ms", labels.join(", "), timeout_ms);

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let tasks: Vec<_> = network
        .into_iter()
        .map(|st| {
            let fallback = fallback_host.to_string();
            tokio::spawn(async move { browse_one(st, deadline, &fallback).await })
        })
        .collect();

    let mut entries = Vec::new();
    for task in tasks {
        match task.await {
            Ok(Ok(found)) => entries.extend(found),
            Ok(Err(e)) => warn!("{}", e),
            // A panicking browse is a failed browse for that type only.
            Err(e) => warn!("browse task failed: {}", e),
        }
    }

    let results = fold(entries);
    info!("scan done, found {}", results.len());
    results
}

/// Dedup on `(name, host, port)` with first arrival winning, then sort the
/// survivors by the same key.
fn fold(entries: Vec<ServiceInfo>) -> Vec<ServiceInfo> {
    let mut seen = std::collections::HashSet::new();
    let mut results = Vec::new();
    for entry in entries {
        let key = format!("{}|{}|{}", entry.name, entry.host, entry.port);
        if seen.insert(key) {
            results.push(entry);
        }
    }
    results.sort_by(|a, b| {
        (&a.name, &a.host, a.port).cmp(&(&b.name, &b.host, b.port))
    });
    results
}

async fn browse_one(
    st: ServiceType,
    deadline: Instant,
    fallback_host: &str,
) -> DiscoveryResult<Vec<ServiceInfo>> {
    let service_name = format!("_{}._{}.local.", st.ty, st.protocol);

    let daemon = ServiceDaemon::new().map_err(|e| {
        DiscoveryError::Mdns(format!("failed to create resolver for {}: {}", service_name, e))
    })?;
    let receiver = daemon.browse(&service_name).map_err(|e| {
        let _ = daemon.shutdown();
        DiscoveryError::Mdns(format!("browse error for {}: {}", service_name, e))
    })?;

    let mut found = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(resolved))) => {
                let entry = convert(&resolved, &st, fallback_host);
                debug!(
                    "found: {} on {}:{} ({}, {})",
                    st.ty,
                    entry.host,
                    entry.port,
                    entry.txt.get("board").map(String::as_str).unwrap_or(""),
                    entry.txt.get("serial_number").map(String::as_str).unwrap_or(""),
                );
                found.push(entry);
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    let _ = daemon.stop_browse(&service_name);
    let _ = daemon.shutdown();
    Ok(found)
}

fn convert(resolved: &mdns_sd::ServiceInfo, st: &ServiceType, fallback_host: &str) -> ServiceInfo {
    let instance = instance_name(resolved.get_fullname(), resolved.get_type());

    let mut addrs: Vec<IpAddr> = resolved.get_addresses().iter().copied().collect();
    addrs.sort();
    let host = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(ToString::to_string)
        .unwrap_or_else(|| {
            let hostname = resolved.get_hostname();
            if hostname.is_empty() {
                fallback_host.to_string()
            } else {
                hostname.to_string()
            }
        });

    let txt: HashMap<String, String> = resolved
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    ServiceInfo {
        name: instance.clone(),
        host,
        port: resolved.get_port(),
        ty: st.ty.clone(),
        protocol: st.protocol,
        fqdn: instance,
        txt,
    }
}

/// `inst._hap._tcp.local.` -> `inst`
fn instance_name(fullname: &str, ty_domain: &str) -> String {
    fullname
        .strip_suffix(ty_domain)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}
