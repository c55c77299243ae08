//! Cluster connection and read loop.
//!
//! One `ClusterConnection` exists per configured endpoint. It exclusively
//! owns its TCP socket, runs exactly one read-loop task, and serializes
//! all writes (including the reconnects the send path may trigger) through
//! a single async mutex so bytes from concurrent callers never interleave.
//!
//! # Failure semantics
//!
//! A zero-byte read is treated exactly like a read error: the remainder of
//! the framer is flushed as one final line, then a [`ConnectionEvent::Faulted`]
//! is emitted. A deliberate [`disconnect`](ClusterConnection::disconnect)
//! is *not* a fault and emits nothing — the distinction keeps intentional
//! shutdowns from spawning reconnection workers upstream.
//!
//! A generation counter retires the previous read loop on every
//! (re)connect and disconnect, so a stale loop can never report a fault
//! for a socket that has already been replaced.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::framing::LineFramer;

// ============================================================================
// Constants
// ============================================================================

/// Bounded timeout for every TCP connect, including reconnects from the
/// send path.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer size; cluster lines are short, spots rarely exceed 100 bytes.
const READ_BUF_SIZE: usize = 2048;

/// Line terminator appended to every outbound line.
const LINE_TERMINATOR: &str = "\r\n";

// ============================================================================
// ConnectionEvent
// ============================================================================

/// A notification from a connection to its owning manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// One decoded inbound line, including the end-of-stream flush line.
    Line {
        /// Source cluster name.
        cluster: String,
        /// Line text, terminator stripped.
        line: String,
    },

    /// The connection was (re)established successfully.
    Reconnected {
        /// Cluster name.
        cluster: String,
    },

    /// The established connection was lost unexpectedly, or a connect
    /// attempt failed.
    Faulted {
        /// Cluster name.
        cluster: String,
    },
}

// ============================================================================
// ClusterConnection
// ============================================================================

/// TCP connection to one cluster endpoint.
///
/// Cheap to clone; all clones share the same socket and read loop.
///
/// # Thread Safety
///
/// `ClusterConnection` is `Send + Sync`. Writes are serialized internally;
/// [`disconnect`](Self::disconnect) is idempotent and callable from any
/// task.
pub struct ClusterConnection {
    inner: Arc<Inner>,
}

impl Clone for ClusterConnection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner {
    /// Cluster name events are tagged with.
    name: String,
    /// `host:port`, immutable for the connection's lifetime.
    addr: String,
    /// Event channel to the manager.
    events: mpsc::UnboundedSender<ConnectionEvent>,
    /// Serializes writes and every reconnect, wherever triggered.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Cleared by the read loop on EOF or read error; the send path
    /// consults it instead of probing a dead socket.
    alive: AtomicBool,
    /// Deliberate-shutdown marker; read loops must stay silent.
    closed: AtomicBool,
    /// Bumped on every (re)connect and disconnect to retire old loops.
    generation: AtomicU64,
    /// Current read-loop task.
    read_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// ClusterConnection - Constructor
// ============================================================================

impl ClusterConnection {
    /// Creates a disconnected connection for one endpoint.
    ///
    /// Events are delivered on `events`; the channel is unbounded so a
    /// slow manager can never stall the read loop.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                addr: addr.into(),
                events,
                writer: tokio::sync::Mutex::new(None),
                alive: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                read_task: parking_lot::Mutex::new(None),
            }),
        }
    }
}

// ============================================================================
// ClusterConnection - Public API
// ============================================================================

impl ClusterConnection {
    /// Returns the cluster name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns `true` while an established connection is believed usable.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Opens the TCP socket and starts the read loop.
    ///
    /// Returns `true` on success (a [`ConnectionEvent::Reconnected`] is
    /// emitted); on failure tears down partial state, emits
    /// [`ConnectionEvent::Faulted`], and returns `false`. Safely
    /// re-callable after a failure.
    pub async fn connect(&self) -> bool {
        self.inner.closed.store(false, Ordering::SeqCst);
        let mut writer = self.inner.writer.lock().await;

        match self.establish(&mut writer).await {
            Ok(()) => true,
            Err(e) => {
                warn!(cluster = %self.inner.name, error = %e, "connect failed");
                self.emit(ConnectionEvent::Faulted {
                    cluster: self.inner.name.clone(),
                });
                false
            }
        }
    }

    /// Sends one line, appending the terminator.
    ///
    /// If the connection is known dead, one bounded-timeout reconnect is
    /// attempted before writing. A write failure triggers exactly one
    /// automatic reconnect-and-resend; if that also fails, a
    /// [`ConnectionEvent::Faulted`] is emitted and the error is returned
    /// so interactive callers can report it.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if a remote close had been observed
    ///   on the established connection and it could not be restored
    /// - [`Error::Connect`] / [`Error::ConnectTimeout`] if there was no
    ///   established connection and the dial failed
    /// - [`Error::Send`] if the write failed after the automatic retry
    pub async fn send_line(&self, text: &str) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;

        // Known-dead socket: reconnect first rather than writing into it.
        if !self.is_alive() || writer.is_none() {
            // A held writer with the alive flag down means the read loop
            // observed the remote closing an established connection.
            let remote_closed = writer.is_some();
            debug!(cluster = %self.inner.name, "send on dead connection, reconnecting first");
            if let Err(e) = self.establish(&mut writer).await {
                self.fault();
                return Err(if remote_closed {
                    Error::connection_closed(&self.inner.name)
                } else {
                    e
                });
            }
        }

        match Self::write_line(&mut writer, text).await {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!(
                    cluster = %self.inner.name,
                    error = %first,
                    "write failed, attempting reconnect-and-resend"
                );

                if let Err(e) = self.establish(&mut writer).await {
                    self.fault();
                    debug!(cluster = %self.inner.name, error = %e, "reconnect for resend failed");
                    return Err(Error::send(&self.inner.name, first.to_string()));
                }

                match Self::write_line(&mut writer, text).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.fault();
                        Err(Error::send(&self.inner.name, e.to_string()))
                    }
                }
            }
        }
    }

    /// Closes the connection deliberately.
    ///
    /// Cancels the read loop and releases the socket. Idempotent, callable
    /// from any task, and never emits a fault.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.alive.store(false, Ordering::SeqCst);
        // Retire the loop before aborting so it cannot report a fault in
        // the window between abort being requested and taking effect.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(task) = self.inner.read_task.lock().take() {
            task.abort();
        }

        let mut writer = self.inner.writer.lock().await;
        if writer.take().is_some() {
            debug!(cluster = %self.inner.name, "disconnected");
        }
    }
}

// ============================================================================
// ClusterConnection - Internals
// ============================================================================

impl ClusterConnection {
    /// Establishes a fresh socket under the writer lock, retiring any
    /// previous read loop. Used by `connect` and by both send-path
    /// reconnects, so all of them share one serialization point.
    async fn establish(&self, writer: &mut Option<OwnedWriteHalf>) -> Result<()> {
        let connect = TcpStream::connect(&self.inner.addr);
        let stream = match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                *writer = None;
                self.inner.alive.store(false, Ordering::SeqCst);
                return Err(Error::connect(&self.inner.name, e.to_string()));
            }
            Err(_) => {
                *writer = None;
                self.inner.alive.store(false, Ordering::SeqCst);
                return Err(Error::connect_timeout(
                    &self.inner.name,
                    CONNECT_TIMEOUT.as_millis() as u64,
                ));
            }
        };

        // Interactive line traffic; coalescing adds nothing but latency.
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(task) = self.inner.read_task.lock().take() {
            task.abort();
        }

        *writer = Some(write_half);
        self.inner.alive.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(read_loop(inner, read_half, generation));
        *self.inner.read_task.lock() = Some(handle);

        info!(cluster = %self.inner.name, addr = %self.inner.addr, "connection established");
        self.emit(ConnectionEvent::Reconnected {
            cluster: self.inner.name.clone(),
        });

        Ok(())
    }

    /// Writes one terminated line to the held writer.
    async fn write_line(
        writer: &mut Option<OwnedWriteHalf>,
        text: &str,
    ) -> std::io::Result<()> {
        let Some(w) = writer.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no socket",
            ));
        };
        w.write_all(text.as_bytes()).await?;
        w.write_all(LINE_TERMINATOR.as_bytes()).await?;
        w.flush().await
    }

    /// Marks the connection dead and emits a fault (unless deliberately
    /// closed).
    fn fault(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        if !self.inner.closed.load(Ordering::SeqCst) {
            self.emit(ConnectionEvent::Faulted {
                cluster: self.inner.name.clone(),
            });
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // A dropped manager just means nobody is listening anymore.
        let _ = self.inner.events.send(event);
    }
}

// ============================================================================
// Read Loop
// ============================================================================

/// Single reader per socket: lines are emitted in exact wire order.
async fn read_loop(inner: Arc<Inner>, mut read_half: OwnedReadHalf, generation: u64) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        match read_half.read(&mut buf).await {
            // Graceful remote close is a fault, same as an I/O error.
            Ok(0) => {
                debug!(cluster = %inner.name, "remote closed connection");
                break;
            }
            Ok(n) => {
                for line in framer.push(&buf[..n]) {
                    emit_line(&inner, line);
                }
            }
            Err(e) => {
                debug!(cluster = %inner.name, error = %e, "read error");
                break;
            }
        }
    }

    // Best-effort flush of an unterminated trailing line.
    if let Some(line) = framer.finish() {
        emit_line(&inner, line);
    }

    // Only the current loop reports the fault; a retired loop (replaced
    // socket) and a deliberate disconnect both stay silent.
    if inner.generation.load(Ordering::SeqCst) == generation
        && !inner.closed.load(Ordering::SeqCst)
    {
        inner.alive.store(false, Ordering::SeqCst);
        let _ = inner.events.send(ConnectionEvent::Faulted {
            cluster: inner.name.clone(),
        });
    }
}

fn emit_line(inner: &Inner, line: String) {
    let _ = inner.events.send(ConnectionEvent::Line {
        cluster: inner.name.clone(),
        line,
    });
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{Duration, timeout};

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    async fn bind_local() -> TcpListener {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        TcpListener::bind(addr).await.expect("bind")
    }

    fn connection_for(
        listener: &TcpListener,
    ) -> (ClusterConnection, UnboundedReceiver<ConnectionEvent>) {
        let addr = listener.local_addr().expect("local addr").to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        (ClusterConnection::new("TEST", addr, tx), rx)
    }

    async fn recv(rx: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("event before timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_connect_emits_reconnected_and_receives_lines() {
        let listener = bind_local().await;
        let (conn, mut rx) = connection_for(&listener);

        assert!(conn.connect().await);
        assert!(conn.is_alive());

        let (mut server, _) = listener.accept().await.expect("accept");
        server
            .write_all(b"Hello from cluster\r\n")
            .await
            .expect("server write");

        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Reconnected {
                cluster: "TEST".into()
            }
        );
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Line {
                cluster: "TEST".into(),
                line: "Hello from cluster".into()
            }
        );
    }

    #[tokio::test]
    async fn test_connect_failure_returns_false_and_faults() {
        // Bind then drop to get a port that refuses connections.
        let listener = bind_local().await;
        let (conn, mut rx) = connection_for(&listener);
        drop(listener);

        assert!(!conn.connect().await);
        assert!(!conn.is_alive());
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Faulted {
                cluster: "TEST".into()
            }
        );

        // Re-callable after failure.
        assert!(!conn.connect().await);
    }

    #[tokio::test]
    async fn test_remote_close_flushes_partial_line_then_faults() {
        let listener = bind_local().await;
        let (conn, mut rx) = connection_for(&listener);

        assert!(conn.connect().await);
        let (mut server, _) = listener.accept().await.expect("accept");
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Reconnected {
                cluster: "TEST".into()
            }
        );

        server.write_all(b"PARTIAL").await.expect("server write");
        drop(server);

        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Line {
                cluster: "TEST".into(),
                line: "PARTIAL".into()
            }
        );
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Faulted {
                cluster: "TEST".into()
            }
        );
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_disconnect_is_silent_and_idempotent() {
        let listener = bind_local().await;
        let (conn, mut rx) = connection_for(&listener);

        assert!(conn.connect().await);
        let _server = listener.accept().await.expect("accept");
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Reconnected {
                cluster: "TEST".into()
            }
        );

        conn.disconnect().await;
        conn.disconnect().await;
        assert!(!conn.is_alive());

        // No Faulted (or anything else) may arrive after a deliberate
        // disconnect.
        let quiet = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(quiet.is_err(), "unexpected event after disconnect: {quiet:?}");
    }

    #[tokio::test]
    async fn test_send_line_appends_terminator() {
        let listener = bind_local().await;
        let (conn, _rx) = connection_for(&listener);

        assert!(conn.connect().await);
        let (mut server, _) = listener.accept().await.expect("accept");

        conn.send_line("SH/DX 10").await.expect("send");

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.expect("server read");
        assert_eq!(&buf[..n], b"SH/DX 10\r\n");
    }

    #[tokio::test]
    async fn test_send_on_dead_connection_reconnects_first() {
        let listener = bind_local().await;
        let (conn, mut rx) = connection_for(&listener);

        assert!(conn.connect().await);
        let (server, _) = listener.accept().await.expect("accept");
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Reconnected {
                cluster: "TEST".into()
            }
        );

        // Remote drops us; read loop notices and marks the socket dead.
        drop(server);
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Faulted {
                cluster: "TEST".into()
            }
        );
        assert!(!conn.is_alive());

        // Send must transparently reconnect, then deliver the line.
        conn.send_line("RETRY").await.expect("send after fault");

        let (mut server, _) = listener.accept().await.expect("second accept");
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.expect("server read");
        assert_eq!(&buf[..n], b"RETRY\r\n");
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn test_send_fails_when_reconnect_impossible() {
        let listener = bind_local().await;
        let (conn, mut rx) = connection_for(&listener);

        assert!(conn.connect().await);
        let (server, _) = listener.accept().await.expect("accept");
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Reconnected {
                cluster: "TEST".into()
            }
        );

        drop(server);
        drop(listener);
        assert_eq!(
            recv(&mut rx).await,
            ConnectionEvent::Faulted {
                cluster: "TEST".into()
            }
        );

        // The remote close was observed on an established connection, so
        // the unrestorable send reports exactly that.
        let err = conn.send_line("DOOMED").await.expect_err("send must fail");
        assert!(matches!(err, Error::ConnectionClosed { .. }), "got {err:?}");
        assert!(err.is_connection_error());
    }
}
