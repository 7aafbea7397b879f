//! Local network helpers

use std::net::{IpAddr, UdpSocket};

/// Get the primary local IPv4 address.
///
/// Binds a UDP socket and connects it to an external address; no packet is
/// sent, but the OS picks the outbound interface, whose address is the one
/// LAN peers can reach us at. Loopback and link-local results are rejected.
pub fn primary_ipv4() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;

    match addr.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_link_local() => Some(ip.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_ipv4_shape() {
        // May legitimately be None on an offline host; when present it must
        // be a parseable non-loopback IPv4.
        if let Some(ip) = primary_ipv4() {
            let parsed: std::net::Ipv4Addr = ip.parse().unwrap();
            assert!(!parsed.is_loopback());
        }
    }
}
