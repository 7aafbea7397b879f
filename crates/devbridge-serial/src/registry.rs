//! Process-wide serial port registry.
//!
//! Owns every open serial handle, the per-path reference counts, modem-line
//! state, and the path-to-TCP-port index. All map mutation happens under a
//! single lock; the lock is never held across serial or network I/O. Handles
//! are opened and closed outside the critical section, and sessions share a
//! handle through [`PortHandle`] clones whose inner device can be closed out
//! from under a blocked pump.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{SerialError, SerialPortInfo, SerialResult, SerialState};

/// How long a pump read blocks before giving the loop a chance to observe
/// the stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Settle delay after toggling a modem line, so USB-UART adapters latch the
/// level before the next operation.
const MODEM_LINE_SETTLE: Duration = Duration::from_millis(10);

/// Settle delay after force-closing a port before it may be reopened.
const REOPEN_SETTLE: Duration = Duration::from_millis(100);

/// A shared, closable serial handle.
///
/// Clones refer to the same OS device. [`close`](Self::close) drops the
/// device for every clone at once; subsequent reads and writes fail with
/// `BrokenPipe`, which is what ends the peer pump of a session.
#[derive(Clone)]
pub struct PortHandle {
    inner: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
}

impl PortHandle {
    fn new(port: Box<dyn SerialPort>) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(port))) }
    }

    /// Read up to `buf.len()` bytes. A quiet line yields `Ok(0)` after the
    /// short port timeout rather than blocking indefinitely.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(port) => match port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e),
            },
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "serial handle closed")),
        }
    }

    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(port) => port.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "serial handle closed")),
        }
    }

    /// Set DTR and/or RTS, best-effort. Each applied line is followed by a
    /// short settle delay. Errors are logged, not returned: some devices
    /// (ptys in particular) reject modem-line ioctls outright.
    pub fn set_modem_lines(&self, dtr: Option<bool>, rts: Option<bool>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(port) = guard.as_mut() else { return };

        if let Some(level) = dtr {
            match port.write_data_terminal_ready(level) {
                Ok(()) => {
                    debug!("DTR set to {}", level);
                    std::thread::sleep(MODEM_LINE_SETTLE);
                }
                Err(e) => warn!("DTR set error: {}", e),
            }
        }
        if let Some(level) = rts {
            match port.write_request_to_send(level) {
                Ok(()) => {
                    debug!("RTS set to {}", level);
                    std::thread::sleep(MODEM_LINE_SETTLE);
                }
                Err(e) => warn!("RTS set error: {}", e),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    fn close(&self) {
        let dropped = self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        if dropped.is_some() {
            debug!("closing serial port");
        }
    }
}

struct ServerEntry {
    tcp_port: u16,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    ports: HashMap<String, PortHandle>,
    refcounts: HashMap<String, usize>,
    states: HashMap<String, SerialState>,
    servers: HashMap<String, ServerEntry>,
    tcp_to_path: HashMap<u16, String>,
    details: HashMap<String, SerialPortInfo>,
}

/// Process-wide serial state. One instance is shared by the TCP servers, the
/// monitor, the discovery fold-in and the HTTP control surface.
#[derive(Default)]
pub struct SerialRegistry {
    inner: Mutex<Inner>,
}

impl SerialRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Control-line and baud state for `path`, defaulting for paths never
    /// touched by a control call.
    pub fn state(&self, path: &str) -> SerialState {
        let inner = self.lock();
        inner.states.get(path).copied().unwrap_or_default()
    }

    pub fn set_state(&self, path: &str, state: SerialState) {
        self.lock().states.insert(path.to_string(), state);
    }

    /// Cached scan identity for `path`, if the monitor has seen it.
    pub fn details(&self, path: &str) -> Option<SerialPortInfo> {
        self.lock().details.get(path).cloned()
    }

    pub fn record_details(&self, info: SerialPortInfo) {
        self.lock().details.insert(info.path.clone(), info);
    }

    /// Check out the shared handle for `path`, opening it at `baud` if no
    /// session holds it yet. Every successful checkout must be paired with a
    /// [`release`](Self::release).
    pub fn checkout(&self, path: &str, baud: u32) -> SerialResult<PortHandle> {
        {
            let mut inner = self.lock();
            if let Some(handle) = inner.ports.get(path).cloned() {
                *inner.refcounts.entry(path.to_string()).or_insert(0) += 1;
                let refs = inner.refcounts[path];
                debug!("reusing serial port {}, refs: {}", path, refs);
                return Ok(handle);
            }
        }

        // No handle yet: open outside the lock.
        let port = open_port(path, baud)?;
        let handle = PortHandle::new(port);
        info!("opened serial port {} at {} baud", path, baud);

        let mut inner = self.lock();
        if let Some(existing) = inner.ports.get(path).cloned() {
            // Another session opened the port while we were opening ours.
            *inner.refcounts.entry(path.to_string()).or_insert(0) += 1;
            drop(inner);
            handle.close();
            return Ok(existing);
        }
        inner.ports.insert(path.to_string(), handle.clone());
        inner.refcounts.insert(path.to_string(), 1);
        Ok(handle)
    }

    /// Drop one reference to `path`. The last reference closes the handle,
    /// which unblocks any pump still reading from it.
    pub fn release(&self, path: &str) {
        let closed = {
            let mut inner = self.lock();
            match inner.refcounts.get_mut(path) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    debug!("released serial port {}, refs remaining: {}", path, *count);
                    None
                }
                Some(_) => {
                    inner.refcounts.remove(path);
                    inner.ports.remove(path)
                }
                None => None,
            }
        };
        if let Some(handle) = closed {
            handle.close();
            info!("last reference to {} released, port closed", path);
        }
    }

    pub fn refcount(&self, path: &str) -> usize {
        self.lock().refcounts.get(path).copied().unwrap_or(0)
    }

    pub fn has_open_handle(&self, path: &str) -> bool {
        self.lock().ports.contains_key(path)
    }

    /// Force-close the stored handle so the next checkout reopens at
    /// `new_baud`. Sessions still pumping see their handle die and wind down
    /// through the normal stop path. Sleeps briefly after the close so the
    /// OS releases the device before any reopen.
    pub async fn reopen(&self, path: &str, new_baud: u32) {
        let closed = {
            let mut inner = self.lock();
            inner.refcounts.remove(path);
            inner.ports.remove(path)
        };
        if let Some(handle) = closed {
            handle.close();
        }
        tokio::time::sleep(REOPEN_SETTLE).await;
        info!("closed serial port {}, next open uses {} baud", path, new_baud);
    }

    /// Record a listening TCP server for `path`.
    pub fn register_server(&self, path: &str, tcp_port: u16, cancel: CancellationToken) {
        let mut inner = self.lock();
        inner.servers.insert(path.to_string(), ServerEntry { tcp_port, cancel });
        inner.tcp_to_path.insert(tcp_port, path.to_string());
    }

    pub fn tcp_port_for_path(&self, path: &str) -> Option<u16> {
        self.lock().servers.get(path).map(|entry| entry.tcp_port)
    }

    pub fn path_for_tcp_port(&self, tcp_port: u16) -> Option<String> {
        self.lock().tcp_to_path.get(&tcp_port).cloned()
    }

    /// Paths that currently have a listening server.
    pub fn server_paths(&self) -> Vec<String> {
        self.lock().servers.keys().cloned().collect()
    }

    /// Sorted `(path, tcp_port, details)` view of the published servers, for
    /// the discovery fold-in.
    pub fn snapshot_servers(&self) -> Vec<(String, u16, SerialPortInfo)> {
        let inner = self.lock();
        let mut entries: Vec<_> = inner
            .servers
            .iter()
            .map(|(path, entry)| {
                let details = inner
                    .details
                    .get(path)
                    .cloned()
                    .unwrap_or_else(|| SerialPortInfo::unknown(path.clone()));
                (path.clone(), entry.tcp_port, details)
            })
            .collect();
        drop(inner);
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Tear down everything known about `path`: stop its listener, close its
    /// handle, purge the maps. Modem-line state intentionally survives so a
    /// replugged device comes back with the same configuration.
    pub fn remove_path(&self, path: &str) {
        let (server, handle) = {
            let mut inner = self.lock();
            let server = inner.servers.remove(path);
            if let Some(entry) = &server {
                inner.tcp_to_path.remove(&entry.tcp_port);
            }
            inner.refcounts.remove(path);
            inner.details.remove(path);
            (server, inner.ports.remove(path))
        };
        if let Some(entry) = server {
            entry.cancel.cancel();
            info!("closed TCP server for {}", path);
        }
        if let Some(handle) = handle {
            handle.close();
        }
    }

    /// Close every listener and handle. Used on shutdown.
    pub fn shutdown(&self) {
        for path in self.server_paths() {
            self.remove_path(&path);
        }
        // Handles can exist without a server (opened via a control call).
        let orphans: Vec<String> = self.lock().ports.keys().cloned().collect();
        for path in orphans {
            self.remove_path(&path);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn open_port(path: &str, baud: u32) -> SerialResult<Box<dyn SerialPort>> {
    debug!("attempting to open serial port {} at {} baud", path, baud);
    serialport::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|source| {
            warn!("failed to open port {}: {}", path, source);
            SerialError::Open { path: path.to_string(), source }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BAUD;

    #[test]
    fn test_state_defaults_and_roundtrip() {
        let registry = SerialRegistry::new();
        let state = registry.state("/dev/ttyUSB9");
        assert_eq!(state, SerialState::default());

        let updated = SerialState { dtr: true, rts: false, baud_rate: 230_400 };
        registry.set_state("/dev/ttyUSB9", updated);
        assert_eq!(registry.state("/dev/ttyUSB9"), updated);

        // Repeating the same write is a no-op.
        registry.set_state("/dev/ttyUSB9", updated);
        assert_eq!(registry.state("/dev/ttyUSB9"), updated);
    }

    #[test]
    fn test_tcp_port_index() {
        let registry = SerialRegistry::new();
        let cancel = CancellationToken::new();
        registry.register_server("/dev/ttyACM0", 40123, cancel.clone());

        assert_eq!(registry.tcp_port_for_path("/dev/ttyACM0"), Some(40123));
        assert_eq!(registry.path_for_tcp_port(40123).as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(registry.path_for_tcp_port(1), None);

        registry.remove_path("/dev/ttyACM0");
        assert!(cancel.is_cancelled());
        assert_eq!(registry.tcp_port_for_path("/dev/ttyACM0"), None);
        assert_eq!(registry.path_for_tcp_port(40123), None);
    }

    #[test]
    fn test_release_without_checkout_is_noop() {
        let registry = SerialRegistry::new();
        registry.release("/dev/ttyUSB0");
        assert_eq!(registry.refcount("/dev/ttyUSB0"), 0);
        assert!(!registry.has_open_handle("/dev/ttyUSB0"));
    }

    #[cfg(unix)]
    #[test]
    fn test_checkout_refcounting_on_pty() {
        let (_master, slave) = serialport::TTYPort::pair().expect("pty pair");
        let path = slave.name().expect("pty slave name");
        drop(slave);

        let registry = SerialRegistry::new();
        let first = registry.checkout(&path, DEFAULT_BAUD).expect("first checkout");
        assert_eq!(registry.refcount(&path), 1);
        assert!(registry.has_open_handle(&path));

        let second = registry.checkout(&path, DEFAULT_BAUD).expect("second checkout");
        assert_eq!(registry.refcount(&path), 2);

        registry.release(&path);
        assert_eq!(registry.refcount(&path), 1);
        assert!(registry.has_open_handle(&path));
        assert!(!second.is_closed());

        registry.release(&path);
        assert_eq!(registry.refcount(&path), 0);
        assert!(!registry.has_open_handle(&path));
        assert!(first.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reopen_drops_handle() {
        let (_master, slave) = serialport::TTYPort::pair().expect("pty pair");
        let path = slave.name().expect("pty slave name");
        drop(slave);

        let registry = SerialRegistry::new();
        let handle = registry.checkout(&path, DEFAULT_BAUD).expect("checkout");
        registry.reopen(&path, 230_400).await;

        assert!(handle.is_closed());
        assert_eq!(registry.refcount(&path), 0);
        assert!(!registry.has_open_handle(&path));
        assert!(handle.write_all(b"x").is_err());
    }
}
