//! Per-port TCP server.
//!
//! Publishes one serial path as a TCP listener on an OS-assigned port. Every
//! accepted client becomes a session of two pumps over the shared serial
//! handle checked out from the registry: serial->tcp and tcp->serial. The
//! first error in either direction fires a one-shot stop that eagerly drops
//! the session's registry reference (closing the handle when it was the last
//! one) and shuts the socket down, so the peer pump unblocks and drains.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::SerialRegistry;
use crate::{SerialError, SerialResult};

const PUMP_BUF: usize = 1024;
const SOCKET_BUF: usize = 64 * 1024;

/// Backoff when the serial line is quiet, so the read pump does not spin.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// A listening TCP server bound to one serial path.
pub struct SerialTcpServer {
    pub path: String,
    pub tcp_port: u16,
}

impl SerialTcpServer {
    /// Bind on an ephemeral port, register with the registry, and start
    /// accepting clients. The listener stops when the registry cancels the
    /// token it was registered with (device vanished or shutdown).
    pub async fn spawn(registry: Arc<SerialRegistry>, path: &str) -> SerialResult<Self> {
        let listener = TcpListener::bind("0.0.0.0:0").await.map_err(|source| {
            SerialError::Bind { path: path.to_string(), source }
        })?;
        let tcp_port = listener
            .local_addr()
            .map_err(|source| SerialError::Bind { path: path.to_string(), source })?
            .port();

        let cancel = CancellationToken::new();
        registry.register_server(path, tcp_port, cancel.clone());
        info!("TCP server for {} listening on {}", path, tcp_port);

        let accept_path = path.to_string();
        tokio::spawn(accept_loop(listener, registry, accept_path, cancel));

        Ok(Self { path: path.to_string(), tcp_port })
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<SerialRegistry>,
    path: String,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                debug!("connection error on {}: {}", path, e);
                continue;
            }
        };
        info!("client connected for {} from {}", path, peer);

        if let Err(e) = configure_stream(&stream) {
            debug!("failed to tune client socket: {}", e);
        }
        let conn = match stream.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            Ok(s)
        }) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("failed to convert client socket: {}", e);
                continue;
            }
        };

        let registry = registry.clone();
        let path = path.clone();
        tokio::task::spawn_blocking(move || run_session(conn, registry, path));
    }
    debug!("accept loop for {} finished", path);
}

/// Disable Nagle, widen the buffers, keep the connection alive. Flashing
/// traffic is many small writes where delayed ACK latency dominates.
fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_recv_buffer_size(SOCKET_BUF)?;
    sock.set_send_buffer_size(SOCKET_BUF)?;
    sock.set_keepalive(true)?;
    Ok(())
}

/// One-shot session teardown. Whichever pump fails first releases the
/// registry reference (closing the serial handle if this was the last
/// session) and shuts the socket down both ways so the other pump's blocked
/// read returns.
struct SessionStop {
    fired: AtomicBool,
    registry: Arc<SerialRegistry>,
    path: String,
    conn: std::net::TcpStream,
}

impl SessionStop {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.registry.release(&self.path);
            let _ = self.conn.shutdown(Shutdown::Both);
        }
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

fn run_session(conn: std::net::TcpStream, registry: Arc<SerialRegistry>, path: String) {
    let state = registry.state(&path);
    let handle = match registry.checkout(&path, state.baud_rate) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };
    // Re-assert the desired control lines for every session; bootloaders
    // sample them at connect time.
    handle.set_modem_lines(Some(state.dtr), Some(state.rts));

    let (writer, stop_conn) = match (conn.try_clone(), conn.try_clone()) {
        (Ok(w), Ok(s)) => (w, s),
        _ => {
            warn!("failed to clone client socket for {}", path);
            registry.release(&path);
            return;
        }
    };
    let stop = Arc::new(SessionStop {
        fired: AtomicBool::new(false),
        registry,
        path: path.clone(),
        conn: stop_conn,
    });

    let serial_to_tcp = {
        let handle = handle.clone();
        let stop = stop.clone();
        let mut writer = writer;
        std::thread::spawn(move || {
            let mut buf = [0u8; PUMP_BUF];
            while !stop.is_fired() {
                match handle.read(&mut buf) {
                    Ok(0) => std::thread::sleep(IDLE_BACKOFF),
                    Ok(n) => {
                        if let Err(e) = writer.write_all(&buf[..n]) {
                            debug!("serial->tcp write error: {}", e);
                            stop.fire();
                        }
                    }
                    Err(e) => {
                        debug!("serial->tcp read error: {}", e);
                        stop.fire();
                    }
                }
            }
        })
    };

    let mut conn = conn;
    let mut buf = [0u8; PUMP_BUF];
    while !stop.is_fired() {
        match conn.read(&mut buf) {
            Ok(0) => {
                debug!("tcp->serial: client closed");
                stop.fire();
            }
            Ok(n) => {
                if let Err(e) = handle.write_all(&buf[..n]) {
                    debug!("tcp->serial write error: {}", e);
                    stop.fire();
                }
            }
            Err(e) => {
                debug!("tcp->serial read error: {}", e);
                stop.fire();
            }
        }
    }

    let _ = serial_to_tcp.join();
    debug!("connection closed for {}", path);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::SerialRegistry;
    use serialport::{SerialPort, TTYPort};
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;

    async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn pty() -> (TTYPort, String) {
        let (master, slave) = TTYPort::pair().expect("pty pair");
        let path = slave.name().expect("pty slave name");
        (master, path)
    }

    /// Read exactly `n` bytes from the pty master, tolerating short reads
    /// and timeouts.
    fn read_exact_blocking(master: &mut TTYPort, n: usize) -> Vec<u8> {
        master.set_timeout(Duration::from_millis(50)).unwrap();
        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut buf = [0u8; 64];
        while out.len() < n {
            assert!(Instant::now() < deadline, "timed out reading from pty master");
            match master.read(&mut buf) {
                Ok(got) => out.extend_from_slice(&buf[..got]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => panic!("pty read failed: {e}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_two_clients_share_one_handle() {
        let (mut master, path) = pty();
        let registry = SerialRegistry::new();
        let server = SerialTcpServer::spawn(registry.clone(), &path).await.unwrap();

        let addr = format!("127.0.0.1:{}", server.tcp_port);
        let mut a = tokio::net::TcpStream::connect(&addr).await.unwrap();
        let mut b = tokio::net::TcpStream::connect(&addr).await.unwrap();

        a.write_all(b"A").await.unwrap();
        b.write_all(b"B").await.unwrap();

        let got = tokio::task::spawn_blocking(move || read_exact_blocking(&mut master, 2))
            .await
            .unwrap();
        let mut got_sorted = got.clone();
        got_sorted.sort_unstable();
        assert_eq!(got_sorted, b"AB");

        {
            let registry = registry.clone();
            let path = path.clone();
            wait_for(move || registry.refcount(&path) == 2, "both sessions open").await;
        }
        assert!(registry.has_open_handle(&path));

        drop(a);
        {
            let registry = registry.clone();
            let path = path.clone();
            wait_for(move || registry.refcount(&path) == 1, "first disconnect").await;
        }
        assert!(registry.has_open_handle(&path));

        drop(b);
        {
            let registry = registry.clone();
            let path = path.clone();
            wait_for(move || registry.refcount(&path) == 0, "second disconnect").await;
        }
        assert!(!registry.has_open_handle(&path));
    }

    #[tokio::test]
    async fn test_serial_to_tcp_forwarding() {
        let (mut master, path) = pty();
        let registry = SerialRegistry::new();
        let server = SerialTcpServer::spawn(registry.clone(), &path).await.unwrap();

        let addr = format!("127.0.0.1:{}", server.tcp_port);
        let client = tokio::net::TcpStream::connect(&addr).await.unwrap();

        {
            let registry = registry.clone();
            let path = path.clone();
            wait_for(move || registry.refcount(&path) == 1, "session open").await;
        }

        tokio::task::spawn_blocking(move || {
            master.write_all(b"hello").unwrap();
            // keep the master alive long enough for the bytes to drain
            std::thread::sleep(Duration::from_millis(500));
        });

        let mut got = Vec::new();
        client.readable().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while got.len() < 5 {
            assert!(Instant::now() < deadline, "timed out reading from client");
            let mut buf = [0u8; 64];
            match client.try_read(&mut buf) {
                Ok(0) => panic!("connection closed early"),
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("client read failed: {e}"),
            }
        }
        assert_eq!(got, b"hello");
    }
}
