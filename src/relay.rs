//! Local relay listener fanning cluster traffic out to TCP peers.
//!
//! The relay accepts plain telnet-style peers (logging software, a
//! terminal), greets each with the configured banner, pushes every
//! broadcast line to all of them, and surfaces peer input as
//! [`RelayEvent::CommandReceived`]. A peer that errors on write, stalls a
//! write past its bounded timeout, or hangs up is evicted in full (socket
//! and read task); the others are untouched. Broadcast writes run
//! concurrently so one slow peer never delays delivery to the rest.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::event::RelayEvent;
use crate::framing::LineFramer;

// ============================================================================
// Constants
// ============================================================================

/// Accept poll interval; bounds how long shutdown can take.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Line terminator for everything written to peers.
const LINE_TERMINATOR: &str = "\r\n";

/// Broadcast buffer for relay event subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on one peer's broadcast write; a peer that cannot drain
/// its socket within this window is evicted.
const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// RelayServer
// ============================================================================

/// The local fan-out listener.
///
/// Cheap to clone; all clones share the same listener and peer set.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: RelayConfig,
    /// Connected peers by id. Writers sit behind their own async lock so
    /// a broadcast never holds this registry lock across an await.
    peers: Mutex<FxHashMap<u64, Peer>>,
    next_peer_id: AtomicU64,
    events: broadcast::Sender<RelayEvent>,
    shutdown: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

/// One downstream peer: its write half plus the read task draining it.
/// Both are torn down together, so an evicted or stopped peer can no
/// longer inject commands.
struct Peer {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    /// Filled in right after the read loop is spawned.
    reader: Option<JoinHandle<()>>,
}

impl Peer {
    fn abort_reader(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

// ============================================================================
// RelayServer - Public API
// ============================================================================

impl RelayServer {
    /// Creates a stopped relay for the given config.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                peers: Mutex::new(FxHashMap::default()),
                next_peer_id: AtomicU64::new(1),
                events,
                shutdown: AtomicBool::new(false),
                accept_task: Mutex::new(None),
                bound_addr: Mutex::new(None),
            }),
        }
    }

    /// Binds the listener and starts accepting peers.
    ///
    /// Idempotent: a second call while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the bind fails (port in use, bad
    /// address).
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            debug!("relay already running");
            return Ok(());
        }

        let addr = SocketAddr::new(self.inner.config.bind_ip, self.inner.config.port);
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        *self.inner.bound_addr.lock() = Some(bound);
        self.inner.shutdown.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(accept_loop(inner, listener));
        *self.inner.accept_task.lock() = Some(task);

        info!(addr = %bound, "relay listening");
        Ok(())
    }

    /// Stops accepting, drops every peer, and releases the port.
    ///
    /// Idempotent: stopping a stopped relay is a no-op.
    pub async fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);

        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            // The accept loop observes the flag within one poll interval.
            let _ = task.await;
            info!("relay stopped");
        }

        *self.inner.bound_addr.lock() = None;

        // Tear each peer down in full: aborting the read task drops the
        // read half, so a lingering peer cannot keep injecting commands.
        let dropped: Vec<Peer> = {
            let mut peers = self.inner.peers.lock();
            peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in &dropped {
            peer.abort_reader();
        }
        if !dropped.is_empty() {
            let _ = self.inner.events.send(RelayEvent::ClientCount(0));
        }
    }

    /// Writes one line (terminator appended) to every connected peer.
    ///
    /// Writes run concurrently, so a peer with a full socket buffer
    /// cannot delay delivery to the others. A peer whose write fails or
    /// exceeds [`PEER_WRITE_TIMEOUT`] is evicted; the rest are unaffected.
    pub async fn broadcast_line(&self, line: &str) {
        let snapshot: Vec<(u64, Arc<tokio::sync::Mutex<OwnedWriteHalf>>)> = {
            let peers = self.inner.peers.lock();
            peers
                .iter()
                .map(|(&id, peer)| (id, Arc::clone(&peer.writer)))
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let line: Arc<str> = Arc::from(line);
        let mut writes = tokio::task::JoinSet::new();
        for (id, writer) in snapshot {
            let line = Arc::clone(&line);
            writes.spawn(async move {
                let mut writer = writer.lock().await;
                let write = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(LINE_TERMINATOR.as_bytes()).await?;
                    writer.flush().await
                };
                match timeout(PEER_WRITE_TIMEOUT, write).await {
                    Ok(Ok(())) => None,
                    Ok(Err(_)) | Err(_) => Some(id),
                }
            });
        }

        while let Some(joined) = writes.join_next().await {
            if let Ok(Some(id)) = joined {
                debug!(peer = id, "peer write failed or stalled, evicting");
                remove_peer(&self.inner, id);
            }
        }
    }

    /// Subscribes to relay events (peer commands, client-count changes).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Returns `true` while the accept loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .accept_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Returns the bound address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound_addr.lock()
    }

    /// Returns the bound port, once started.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    /// Returns the number of connected peers.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    /// Sends a command line to the relay as if a peer had typed it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelayNotRunning`] when the relay is stopped.
    pub fn inject_command(&self, line: impl Into<String>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::RelayNotRunning);
        }
        let _ = self
            .inner
            .events
            .send(RelayEvent::CommandReceived(line.into()));
        Ok(())
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

/// Accepts peers until the shutdown flag is set, polling so the flag is
/// observed even when nobody connects.
async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    debug!("relay accept loop started");

    while !inner.shutdown.load(Ordering::SeqCst) {
        let accepted = match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                error!(error = %e, "relay accept failed");
                continue;
            }
            Err(_) => continue,
        };

        let (stream, peer_addr) = accepted;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "set_nodelay failed");
        }

        let (read_half, mut write_half) = stream.into_split();

        // Greet before registering so the banner always precedes any
        // broadcast traffic on this socket.
        let banner = format!("{}{LINE_TERMINATOR}", inner.config.welcome);
        if let Err(e) = write_half.write_all(banner.as_bytes()).await {
            debug!(peer = %peer_addr, error = %e, "peer gone before greeting");
            continue;
        }

        let id = inner.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let count = {
            let mut peers = inner.peers.lock();
            peers.insert(
                id,
                Peer {
                    writer: Arc::new(tokio::sync::Mutex::new(write_half)),
                    reader: None,
                },
            );
            peers.len()
        };
        info!(peer = id, addr = %peer_addr, clients = count, "relay peer connected");
        let _ = inner.events.send(RelayEvent::ClientCount(count));

        let reader = tokio::spawn(peer_read_loop(Arc::clone(&inner), id, read_half));
        let mut peers = inner.peers.lock();
        match peers.get_mut(&id) {
            Some(peer) => peer.reader = Some(reader),
            // The peer hung up before we could register its read task.
            None => reader.abort(),
        }
    }

    debug!("relay accept loop terminated");
}

/// Reads command lines from one peer until it hangs up.
async fn peer_read_loop(inner: Arc<Inner>, id: u64, mut read_half: OwnedReadHalf) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 1024];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in framer.push(&buf[..n]) {
                    debug!(peer = id, %line, "peer command");
                    let _ = inner.events.send(RelayEvent::CommandReceived(line));
                }
            }
            Err(e) => {
                debug!(peer = id, error = %e, "peer read failed");
                break;
            }
        }
    }

    // An unterminated final line is still a command.
    if let Some(line) = framer.finish() {
        let _ = inner.events.send(RelayEvent::CommandReceived(line));
    }

    remove_peer(&inner, id);
}

/// Destroys a peer entirely: registry entry, write half, and read task.
fn remove_peer(inner: &Inner, id: u64) {
    let (peer, count) = {
        let mut peers = inner.peers.lock();
        let Some(peer) = peers.remove(&id) else {
            return;
        };
        (peer, peers.len())
    };
    // A no-op when the read loop itself is the caller, since it is
    // already past its last await.
    peer.abort_reader();

    info!(peer = id, clients = count, "relay peer disconnected");
    let _ = inner.events.send(RelayEvent::ClientCount(count));
}

// ============================================================================
// Tests
// ============================================================================
