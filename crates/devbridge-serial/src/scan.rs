//! Serial port enumeration.
//!
//! Prefers the OS enumeration from the serialport crate; when that reports
//! nothing (common in containers and on stripped-down Linux images) falls
//! back to globbing the usual /dev names. macOS exposes each device as both
//! `/dev/cu.*` and `/dev/tty.*`; the tty form wins and duplicates are
//! suppressed.

use serialport::SerialPortType;
use tracing::debug;

use crate::SerialPortInfo;

const DEV_GLOBS: [&str; 4] =
    ["/dev/ttyUSB*", "/dev/ttyACM*", "/dev/ttyS*", "/dev/serial/by-id/*"];

/// Enumerate local serial ports, deduplicated and sorted by path.
pub fn list_ports() -> Vec<SerialPortInfo> {
    let mut raw = match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let mut info = match p.port_type {
                    SerialPortType::UsbPort(usb) => SerialPortInfo {
                        path: String::new(),
                        manufacturer: usb.manufacturer.unwrap_or_else(|| "Unknown".to_string()),
                        serial_number: usb.serial_number.unwrap_or_default(),
                        vendor_id: format!("{:04x}", usb.vid),
                        product_id: format!("{:04x}", usb.pid),
                    },
                    _ => SerialPortInfo::unknown(""),
                };
                info.path = p.port_name;
                info
            })
            .collect(),
        Err(e) => {
            debug!("error getting port list: {}", e);
            Vec::new()
        }
    };

    if raw.is_empty() {
        debug!("port enumeration returned 0 ports, trying /dev fallback");
        raw = glob_fallback();
    }

    let ports = normalize(raw);
    debug!("found {} serial ports", ports.len());
    ports
}

fn glob_fallback() -> Vec<SerialPortInfo> {
    let mut found = Vec::new();
    for pattern in DEV_GLOBS {
        let Ok(matches) = glob::glob(pattern) else { continue };
        for entry in matches.flatten() {
            found.push(SerialPortInfo::unknown(entry.to_string_lossy().into_owned()));
        }
    }
    found
}

/// Apply the cu->tty preference and drop duplicate paths. Output is sorted by
/// path so scans are deterministic.
fn normalize(raw: Vec<SerialPortInfo>) -> Vec<SerialPortInfo> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for mut info in raw {
        if info.path.is_empty() {
            continue;
        }
        if let Some(rest) = info.path.strip_prefix("/dev/cu.") {
            info.path = format!("/dev/tty.{}", rest);
        }
        if seen.insert(info.path.clone()) {
            out.push(info);
        }
    }

    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(ports: &[SerialPortInfo]) -> Vec<&str> {
        ports.iter().map(|p| p.path.as_str()).collect()
    }

    #[test]
    fn test_normalize_prefers_tty_over_cu() {
        let raw = vec![
            SerialPortInfo::unknown("/dev/tty.usbserial-0001"),
            SerialPortInfo::unknown("/dev/cu.usbserial-0001"),
        ];
        let out = normalize(raw);
        assert_eq!(paths(&out), ["/dev/tty.usbserial-0001"]);
    }

    #[test]
    fn test_normalize_renames_lone_cu() {
        let raw = vec![SerialPortInfo::unknown("/dev/cu.usbmodem42")];
        let out = normalize(raw);
        assert_eq!(paths(&out), ["/dev/tty.usbmodem42"]);
    }

    #[test]
    fn test_normalize_cu_first_then_tty() {
        let raw = vec![
            SerialPortInfo::unknown("/dev/cu.usbserial-0001"),
            SerialPortInfo::unknown("/dev/tty.usbserial-0001"),
        ];
        let out = normalize(raw);
        assert_eq!(paths(&out), ["/dev/tty.usbserial-0001"]);
    }

    #[test]
    fn test_normalize_drops_empty_and_duplicates() {
        let raw = vec![
            SerialPortInfo::unknown(""),
            SerialPortInfo::unknown("/dev/ttyUSB0"),
            SerialPortInfo::unknown("/dev/ttyUSB0"),
            SerialPortInfo::unknown("/dev/ttyACM1"),
        ];
        let out = normalize(raw);
        assert_eq!(paths(&out), ["/dev/ttyACM1", "/dev/ttyUSB0"]);
    }
}
