//! Cluster manager: active selection, activity records, self-healing.
//!
//! [`ClusterManager`] owns every configured [`ClusterConnection`] and
//! tracks exactly one as *active*. It runs three kinds of background work:
//!
//! - one event pump consuming [`ConnectionEvent`]s from all connections,
//! - one keepalive loop for the manager's lifetime,
//! - at most one reconnection worker per currently-faulted active cluster.
//!
//! # State
//!
//! The active pointer and every per-cluster [`ActivityRecord`] live behind
//! a single coordination lock; nothing else mutates them. Each record
//! holds the cluster's last-activity and last-keepalive timestamps, its
//! keepalive-suppression and replay-in-flight flags, and the reconnection
//! worker handle — exactly one record per configured cluster.
//!
//! # Invariants
//!
//! - at most one active cluster;
//! - at most one reconnection worker per cluster name;
//! - at most one login replay in flight per cluster name;
//! - suppression is set on fault and cleared on that cluster's next
//!   successful reconnect;
//! - a deliberate disconnect never spawns a worker.

// ============================================================================
// Submodules
// ============================================================================

/// Exponential backoff schedule for reconnection workers.
pub mod backoff;

/// Login / command replay state machine.
mod login;

pub use backoff::Backoff;
pub use login::ReplayTiming;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClusterDef;
use crate::error::{Error, Result};
use crate::event::ClusterEvent;
use crate::transport::{ClusterConnection, ConnectionEvent};

// ============================================================================
// Constants
// ============================================================================

/// Keepalive poll interval.
const KEEPALIVE_POLL: Duration = Duration::from_secs(30);

/// Inactivity threshold; a keepalive is sent only when both the last
/// inbound activity and the last keepalive are older than this.
const IDLE_THRESHOLD: Duration = Duration::from_secs(180);

/// Broadcast buffer for external subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// ActivityRecord
// ============================================================================

/// Per-cluster bookkeeping, mutated only under the manager's state lock.
struct ActivityRecord {
    /// Last inbound line (or connect) for this cluster.
    last_activity: Instant,
    /// Last keepalive sent to this cluster.
    last_keepalive: Instant,
    /// Keepalive suppression: set on fault, cleared on the next
    /// successful reconnect.
    suppressed: bool,
    /// Login replay in flight; blocks re-entrant replays.
    replaying: bool,
    /// Force-login request carried from `connect` to the replay spawned
    /// by the resulting Reconnected event.
    pending_force_login: bool,
    /// Reconnection worker, at most one per cluster.
    reconnect: Option<JoinHandle<()>>,
    /// Running replay task, aborted on disconnect.
    replay: Option<JoinHandle<()>>,
}

impl ActivityRecord {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            last_activity: now,
            last_keepalive: now,
            suppressed: false,
            replaying: false,
            pending_force_login: false,
            reconnect: None,
            replay: None,
        }
    }

    fn worker_running(&self) -> bool {
        self.reconnect.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct ManagerState {
    /// The single upstream endpoint currently selected for send/receive.
    active: Option<String>,
    records: FxHashMap<String, ActivityRecord>,
}

struct ClusterHandle {
    def: ClusterDef,
    conn: ClusterConnection,
}

// ============================================================================
// ClusterManager
// ============================================================================

/// Owns all configured cluster connections; exactly one is active.
///
/// Construct with [`ClusterManager::new`]; the returned `Arc` is shared
/// with the background tasks, so call [`shutdown`](Self::shutdown) when
/// done.
pub struct ClusterManager {
    clusters: FxHashMap<String, ClusterHandle>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<ClusterEvent>,
    timing: ReplayTiming,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// ClusterManager - Constructor
// ============================================================================

impl ClusterManager {
    /// Creates a manager for the given cluster definitions and starts its
    /// event pump and keepalive loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any definition is invalid or a name
    /// is duplicated.
    pub fn new(defs: Vec<ClusterDef>) -> Result<Arc<Self>> {
        Self::with_timing(defs, ReplayTiming::default())
    }

    /// Creates a manager with custom replay timing (tests use short
    /// delays; production uses [`ReplayTiming::default`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any definition is invalid or a name
    /// is duplicated.
    pub fn with_timing(defs: Vec<ClusterDef>, timing: ReplayTiming) -> Result<Arc<Self>> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut clusters = FxHashMap::default();
        let mut records = FxHashMap::default();

        for def in defs {
            def.validate()?;
            if clusters.contains_key(&def.name) {
                return Err(Error::config(format!("duplicate cluster name: {}", def.name)));
            }

            let conn = ClusterConnection::new(def.name.clone(), def.addr(), event_tx.clone());
            records.insert(def.name.clone(), ActivityRecord::new());
            clusters.insert(def.name.clone(), ClusterHandle { def, conn });
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let manager = Arc::new(Self {
            clusters,
            state: Mutex::new(ManagerState {
                active: None,
                records,
            }),
            events,
            timing,
            pump_task: Mutex::new(None),
            keepalive_task: Mutex::new(None),
        });

        let pump = tokio::spawn(Arc::clone(&manager).event_pump(event_rx));
        *manager.pump_task.lock() = Some(pump);

        let keepalive = tokio::spawn(Arc::clone(&manager).keepalive_loop());
        *manager.keepalive_task.lock() = Some(keepalive);

        info!(clusters = manager.clusters.len(), "cluster manager started");
        Ok(manager)
    }
}

// ============================================================================
// ClusterManager - Public API
// ============================================================================

impl ClusterManager {
    /// Subscribes to manager events (`(cluster, line)` traffic plus
    /// fault/reconnect notifications).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Returns a snapshot of the active cluster name.
    #[must_use]
    pub fn active_cluster(&self) -> Option<String> {
        self.state.lock().active.clone()
    }

    /// Returns the configured cluster names.
    #[must_use]
    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    /// Connects the named cluster and marks it active.
    ///
    /// On success: the previous active cluster's reconnection worker is
    /// cancelled, this cluster's activity is reset, its suppression
    /// cleared, its worker cancelled, and login replay runs (forced if
    /// `force_login`). Returns `false` for an unknown name or a failed
    /// connect — connect failures are reported, never thrown.
    pub async fn connect(self: &Arc<Self>, name: &str, force_login: bool) -> bool {
        let Some(handle) = self.clusters.get(name) else {
            warn!(cluster = %name, "connect requested for unknown cluster");
            return false;
        };

        // Become active before dialing so the very first inbound lines are
        // already attributed to the active cluster. Rolled back on failure.
        let previous = {
            let mut state = self.state.lock();

            // Switching active cancels the previous cluster's worker so no
            // orphaned loop survives the switch.
            if let Some(prev) = state.active.clone()
                && prev != name
                && let Some(rec) = state.records.get_mut(&prev)
                && let Some(worker) = rec.reconnect.take()
            {
                debug!(cluster = %prev, "cancelling reconnection worker of previous active");
                worker.abort();
            }

            let previous = state.active.replace(name.to_string());

            if let Some(rec) = state.records.get_mut(name) {
                // Carried to the replay spawned by the Reconnected event.
                rec.pending_force_login = force_login;
            }
            previous
        };

        if !handle.conn.connect().await {
            let mut state = self.state.lock();
            if state.active.as_deref() == Some(name) {
                state.active = previous;
            }
            if let Some(rec) = state.records.get_mut(name) {
                rec.pending_force_login = false;
                // The failed dial's fault event may have started a worker
                // already; it dies with the active selection gone.
                if let Some(worker) = rec.reconnect.take() {
                    worker.abort();
                }
            }
            return false;
        }

        {
            let mut state = self.state.lock();
            if let Some(rec) = state.records.get_mut(name) {
                let now = Instant::now();
                rec.last_activity = now;
                rec.last_keepalive = now;
                rec.suppressed = false;
                if let Some(worker) = rec.reconnect.take() {
                    worker.abort();
                }
            }
        }

        info!(cluster = %name, force_login, "cluster connected and active");
        true
    }

    /// Sends one raw line to the active cluster.
    ///
    /// A no-op returning `Ok(())` when nothing is active.
    ///
    /// # Errors
    ///
    /// Propagates the send-path error after its one automatic retry is
    /// exhausted, so interactive command entry can report the failure.
    pub async fn send_raw(&self, line: &str) -> Result<()> {
        let Some(conn) = self.active_connection() else {
            debug!("send_raw ignored, no active cluster");
            return Ok(());
        };
        conn.send_line(line).await
    }

    /// Disconnects the named cluster deliberately.
    ///
    /// Stops its reconnection worker and replay, closes the socket, and
    /// clears the active pointer if it matches. Never a fault.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCluster`] for an unconfigured name.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let Some(handle) = self.clusters.get(name) else {
            return Err(Error::unknown_cluster(name));
        };

        {
            let mut state = self.state.lock();
            if state.active.as_deref() == Some(name) {
                state.active = None;
            }
            if let Some(rec) = state.records.get_mut(name) {
                if let Some(worker) = rec.reconnect.take() {
                    worker.abort();
                }
                if let Some(replay) = rec.replay.take() {
                    replay.abort();
                }
                rec.replaying = false;
                rec.pending_force_login = false;
            }
        }

        handle.conn.disconnect().await;
        debug!(cluster = %name, "cluster disconnected");
        Ok(())
    }

    /// Disconnects every cluster.
    pub async fn disconnect_all(&self) {
        for name in self.cluster_names() {
            // Names come from our own map.
            let _ = self.disconnect(&name).await;
        }
    }

    /// Stops the background tasks and disconnects everything.
    pub async fn shutdown(&self) {
        info!("cluster manager shutting down");

        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
        self.disconnect_all().await;
        if let Some(task) = self.pump_task.lock().take() {
            task.abort();
        }
    }
}

// ============================================================================
// ClusterManager - Internals
// ============================================================================

impl ClusterManager {
    fn active_connection(&self) -> Option<ClusterConnection> {
        let name = self.state.lock().active.clone()?;
        self.clusters.get(&name).map(|h| h.conn.clone())
    }

    pub(crate) fn cluster_def(&self, name: &str) -> Option<&ClusterDef> {
        self.clusters.get(name).map(|h| &h.def)
    }

    pub(crate) fn connection(&self, name: &str) -> Option<ClusterConnection> {
        self.clusters.get(name).map(|h| h.conn.clone())
    }

    /// Consumes connection events, keeps the records current, and
    /// re-broadcasts to external subscribers.
    async fn event_pump(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        debug!("event pump started");

        while let Some(event) = rx.recv().await {
            match event {
                ConnectionEvent::Line { cluster, line } => {
                    {
                        let mut state = self.state.lock();
                        if let Some(rec) = state.records.get_mut(&cluster) {
                            rec.last_activity = Instant::now();
                        }
                    }
                    let _ = self.events.send(ClusterEvent::Line { cluster, line });
                }

                ConnectionEvent::Faulted { cluster } => {
                    self.handle_fault(&cluster);
                    let _ = self.events.send(ClusterEvent::Faulted { cluster });
                }

                ConnectionEvent::Reconnected { cluster } => {
                    let force_login = {
                        let mut state = self.state.lock();
                        match state.records.get_mut(&cluster) {
                            Some(rec) => {
                                let now = Instant::now();
                                rec.last_activity = now;
                                rec.last_keepalive = now;
                                rec.suppressed = false;
                                if let Some(worker) = rec.reconnect.take() {
                                    worker.abort();
                                }
                                std::mem::take(&mut rec.pending_force_login)
                            }
                            None => false,
                        }
                    };

                    let _ = self.events.send(ClusterEvent::Reconnected {
                        cluster: cluster.clone(),
                    });
                    self.spawn_replay(&cluster, force_login);
                }
            }
        }

        debug!("event pump terminated");
    }

    /// Marks a cluster fault-suppressed and, iff it is the active
    /// selection, ensures exactly one reconnection worker is running.
    /// Idle clusters are left alone.
    pub(crate) fn handle_fault(self: &Arc<Self>, cluster: &str) {
        let mut state = self.state.lock();
        let is_active = state.active.as_deref() == Some(cluster);

        let Some(rec) = state.records.get_mut(cluster) else {
            return;
        };
        rec.suppressed = true;

        if !is_active {
            debug!(cluster = %cluster, "fault on idle cluster, no worker");
            return;
        }
        if rec.worker_running() {
            debug!(cluster = %cluster, "reconnection worker already running");
            return;
        }

        warn!(cluster = %cluster, "fault on active cluster, starting reconnection worker");
        let worker = tokio::spawn(reconnect_worker(Arc::clone(self), cluster.to_string()));
        rec.reconnect = Some(worker);
    }

    /// Spawns login replay unless one is already in flight for this
    /// cluster; the gate is claimed synchronously under the state lock.
    fn spawn_replay(self: &Arc<Self>, cluster: &str, force_login: bool) {
        {
            let mut state = self.state.lock();
            let Some(rec) = state.records.get_mut(cluster) else {
                return;
            };
            if rec.replaying {
                debug!(cluster = %cluster, "login replay already in flight");
                return;
            }
            rec.replaying = true;
        }

        // Subscribe here, not inside the task: the pump broadcasts this
        // connection's first lines right after this call returns, and the
        // replay's grace/prompt waits must be able to see them.
        let events = self.subscribe();
        let task = tokio::spawn(login::run_replay(
            Arc::clone(self),
            cluster.to_string(),
            force_login,
            events,
        ));

        let mut state = self.state.lock();
        if let Some(rec) = state.records.get_mut(cluster) {
            rec.replay = Some(task);
        }
    }

    /// Returns the active cluster's name when it is due a keepalive.
    fn keepalive_target(&self) -> Option<String> {
        let state = self.state.lock();
        let name = state.active.as_ref()?;
        let rec = state.records.get(name)?;

        if rec.suppressed {
            return None;
        }

        let now = Instant::now();
        let idle = now.duration_since(rec.last_activity) > IDLE_THRESHOLD
            && now.duration_since(rec.last_keepalive) > IDLE_THRESHOLD;
        idle.then(|| name.clone())
    }

    /// One shared loop for the manager's lifetime; only the active
    /// cluster is ever kept alive.
    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_POLL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(name) = self.keepalive_target() else {
                continue;
            };
            let Some(conn) = self.connection(&name) else {
                continue;
            };

            debug!(cluster = %name, "sending keepalive");
            match conn.send_line("").await {
                Ok(()) => {
                    let mut state = self.state.lock();
                    if let Some(rec) = state.records.get_mut(&name) {
                        rec.last_keepalive = Instant::now();
                    }
                }
                Err(e) => {
                    // Unified with read-detected faults: suppress and
                    // start the worker immediately.
                    warn!(cluster = %name, error = %e, "keepalive send failed");
                    self.handle_fault(&name);
                }
            }
        }
    }
}

// ============================================================================
// Reconnection Worker
// ============================================================================

/// Backoff retry loop restoring a faulted active connection.
///
/// Runs until cancelled, the cluster loses the active selection, or a
/// connect succeeds; the resulting Reconnected event cancels the stored
/// handle, so no duplicate worker can start while one is live.
async fn reconnect_worker(manager: Arc<ClusterManager>, cluster: String) {
    let Some(conn) = manager.connection(&cluster) else {
        return;
    };
    let mut backoff = Backoff::new();

    loop {
        if manager.active_cluster().as_deref() != Some(cluster.as_str()) {
            debug!(cluster = %cluster, "no longer active, reconnection worker stopping");
            return;
        }
        if conn.is_alive() {
            return;
        }

        debug!(cluster = %cluster, "reconnect attempt");
        if conn.connect().await {
            info!(cluster = %cluster, "reconnection worker restored connection");
            return;
        }

        let delay = backoff.next_delay();
        debug!(cluster = %cluster, delay_ms = delay.as_millis() as u64, "reconnect failed, backing off");
        tokio::time::sleep(delay).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
