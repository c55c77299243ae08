//! Cluster TCP transport layer.
//!
//! This module handles the upstream side: one [`ClusterConnection`] per
//! configured endpoint, each owning one TCP socket and one read-loop task.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected → (Faulted) → Reconnecting → Connected
//! ```
//!
//! 1. [`ClusterConnection::connect`] - bounded-timeout TCP connect
//! 2. Read loop decodes lines and emits [`ConnectionEvent`]s in wire order
//! 3. [`ClusterConnection::send_line`] - serialized writes with one
//!    automatic reconnect-and-resend
//! 4. [`ClusterConnection::disconnect`] - deliberate shutdown, never
//!    reported as a fault
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Socket ownership, read loop, send path |

// ============================================================================
// Submodules
// ============================================================================

/// Cluster socket ownership, read loop, and send path.
pub mod connection;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{ClusterConnection, ConnectionEvent};
