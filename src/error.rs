//! Error types for spotlink.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use spotlink::{Result, Error};
//!
//! async fn example(manager: &ClusterManager) -> Result<()> {
//!     manager.send_raw("SH/DX 10").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::UnknownCluster`] |
//! | Connect | [`Error::Connect`], [`Error::ConnectTimeout`] |
//! | Established connection | [`Error::ConnectionClosed`], [`Error::Send`] |
//! | Relay | [`Error::RelayNotRunning`] |
//! | External | [`Error::Io`] |
//!
//! Connect failures are normally surfaced as `false` from the connect
//! APIs rather than as errors; the `Connect`/`ConnectTimeout` variants
//! exist for the internal send-path retry, which must report *why* a
//! resend could not be attempted. A deliberate disconnect is never an
//! error and never produces a fault notification.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a cluster definition or relay configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Request named a cluster that was never configured.
    #[error("Unknown cluster: {name}")]
    UnknownCluster {
        /// The unconfigured cluster name.
        name: String,
    },

    // ========================================================================
    // Connect Errors
    // ========================================================================
    /// TCP connect to a cluster endpoint failed.
    #[error("Connect to {cluster} failed: {message}")]
    Connect {
        /// Name of the cluster endpoint.
        cluster: String,
        /// Description of the connect failure.
        message: String,
    },

    /// TCP connect did not complete within the bounded timeout.
    #[error("Connect to {cluster} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Name of the cluster endpoint.
        cluster: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Established-Connection Errors
    // ========================================================================
    /// Remote close was observed on an established connection and the
    /// send path could not restore it.
    #[error("Connection to {cluster} closed")]
    ConnectionClosed {
        /// Name of the cluster endpoint.
        cluster: String,
    },

    /// Line send failed after the automatic retry was exhausted.
    #[error("Send to {cluster} failed: {message}")]
    Send {
        /// Name of the cluster endpoint.
        cluster: String,
        /// Description of the write failure.
        message: String,
    },

    // ========================================================================
    // Relay Errors
    // ========================================================================
    /// Relay server operation requested while the listener is stopped.
    #[error("Relay server is not running")]
    RelayNotRunning,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an unknown-cluster error.
    #[inline]
    pub fn unknown_cluster(name: impl Into<String>) -> Self {
        Self::UnknownCluster { name: name.into() }
    }

    /// Creates a connect error.
    #[inline]
    pub fn connect(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// Creates a connect timeout error.
    #[inline]
    pub fn connect_timeout(cluster: impl Into<String>, timeout_ms: u64) -> Self {
        Self::ConnectTimeout {
            cluster: cluster.into(),
            timeout_ms,
        }
    }

    /// Creates a connection-closed error.
    #[inline]
    pub fn connection_closed(cluster: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            cluster: cluster.into(),
        }
    }

    /// Creates a send error.
    #[inline]
    pub fn send(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Send {
            cluster: cluster.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::ConnectionClosed { .. }
                | Self::Send { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry; configuration errors
    /// will not.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::ConnectionClosed { .. }
                | Self::Send { .. }
                | Self::Io(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connect("W3LPL", "connection refused");
        assert_eq!(
            err.to_string(),
            "Connect to W3LPL failed: connection refused"
        );
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("cluster name must not be empty");
        assert_eq!(
            err.to_string(),
            "Configuration error: cluster name must not be empty"
        );
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::connect_timeout("VE7CC", 10_000);
        let other_err = Error::connect("VE7CC", "refused");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        let conn_err = Error::connect("W3LPL", "refused");
        let timeout_err = Error::connect_timeout("W3LPL", 1000);
        let closed_err = Error::connection_closed("W3LPL");
        let other_err = Error::config("bad");

        assert!(conn_err.is_connection_error());
        assert!(timeout_err.is_connection_error());
        assert!(closed_err.is_connection_error());
        assert!(!other_err.is_connection_error());
    }

    #[test]
    fn test_is_recoverable() {
        let send_err = Error::send("W3LPL", "broken pipe");
        let config_err = Error::config("bad");
        let unknown_err = Error::unknown_cluster("NOPE");

        assert!(send_err.is_recoverable());
        assert!(!config_err.is_recoverable());
        assert!(!unknown_err.is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "no route");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
