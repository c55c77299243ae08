//! spotlink - DX cluster connection core with a local relay.
//!
//! This library keeps a logging station connected to a DX cluster node:
//! it manages a set of configured telnet cluster endpoints, holds exactly
//! one of them active, heals the active connection when it drops, and
//! fans the node's traffic out to local TCP peers.
//!
//! # Architecture
//!
//! Data flows through three layers:
//!
//! - **Transport**: one [`ClusterConnection`] per endpoint, each owning a
//!   TCP socket and a read loop that decodes telnet byte streams into lines
//! - **Manager**: the [`ClusterManager`] selects the active cluster, runs
//!   login/command replay after every (re)connect, keeps idle links alive,
//!   and restores faulted ones with jittered exponential backoff
//! - **Relay**: the [`RelayServer`] accepts local peers (logging software,
//!   a plain terminal) and [`bridge`]s them to the active cluster
//!
//! Key design principles:
//!
//! - Faults are reported as events, never thrown from connect paths
//! - At most one reconnection worker and one replay per cluster
//! - A deliberate disconnect is silent; only unexpected loss is a fault
//! - Lines from one cluster arrive in wire order
//!
//! # Quick Start
//!
//! ```no_run
//! use spotlink::{ClusterDef, ClusterManager, RelayConfig, RelayServer, bridge};
//!
//! #[tokio::main]
//! async fn main() -> spotlink::Result<()> {
//!     let defs = vec![
//!         ClusterDef::new("VE7CC", "ve7cc.net", 23)
//!             .with_auto_login("N0CALL")
//!             .with_default_commands(["SET/SKIMMER", "SH/FILTER"]),
//!     ];
//!
//!     let manager = ClusterManager::new(defs)?;
//!     manager.connect("VE7CC", false).await;
//!
//!     let relay = RelayServer::new(RelayConfig::new(7310));
//!     relay.start().await?;
//!
//!     // Peers on 127.0.0.1:7310 now see VE7CC's traffic and can type
//!     // commands back to it.
//!     let wiring = bridge(manager.clone(), relay.clone());
//!
//!     tokio::signal::ctrl_c().await?;
//!     wiring.shutdown();
//!     relay.stop().await;
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bridge`] | Manager ↔ relay wiring |
//! | [`config`] | Cluster definitions and relay settings |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`event`] | Event payloads for subscribers |
//! | [`framing`] | Telnet byte stream → line decoding |
//! | [`manager`] | Active selection, replay, keepalive, reconnection |
//! | [`relay`] | Local TCP fan-out listener |
//! | [`transport`] | Cluster socket ownership (internal) |

// ============================================================================
// Modules
// ============================================================================

/// Manager ↔ relay wiring.
///
/// [`bridge()`] pumps active-cluster lines to relay peers and peer
/// commands back upstream.
pub mod bridge;

/// Cluster definitions and relay settings.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Event payloads published to subscribers.
pub mod event;

/// Telnet byte stream to line decoding.
///
/// [`LineFramer`] handles CR, LF and CRLF terminators split across
/// arbitrary chunk boundaries.
pub mod framing;

/// Cluster manager: active selection, login replay, keepalive, and
/// reconnection workers.
pub mod manager;

/// Local TCP fan-out listener for logging software and terminals.
pub mod relay;

/// Cluster TCP transport layer.
///
/// Internal module handling socket ownership, the read loop, and the
/// retrying send path.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Wiring
pub use bridge::{BridgeHandle, bridge};

// Configuration types
pub use config::{ClusterDef, RelayConfig};

// Error types
pub use error::{Error, Result};

// Event types
pub use event::{ClusterEvent, RelayEvent};

// Framing
pub use framing::LineFramer;

// Manager types
pub use manager::{Backoff, ClusterManager, ReplayTiming};

// Relay
pub use relay::RelayServer;

// Transport types
pub use transport::{ClusterConnection, ConnectionEvent};
