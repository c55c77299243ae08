//! Event payloads published by the manager and the relay server.
//!
//! Fan-out uses `tokio::sync::broadcast` so one slow or failed subscriber
//! can never block delivery to the others; payloads are therefore plain
//! `Clone` values with no handles inside.

// ============================================================================
// ClusterEvent
// ============================================================================

/// A notification from the cluster manager to external listeners.
///
/// Lines from one cluster are delivered in wire order; no ordering is
/// guaranteed across different clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// One decoded line received from a cluster, tagged with its source.
    Line {
        /// Name of the cluster the line arrived from.
        cluster: String,
        /// The line text, terminator stripped.
        line: String,
    },

    /// A cluster (re)connected successfully.
    Reconnected {
        /// Name of the reconnected cluster.
        cluster: String,
    },

    /// A cluster's established connection was lost unexpectedly.
    ///
    /// Never emitted for a deliberate disconnect.
    Faulted {
        /// Name of the faulted cluster.
        cluster: String,
    },
}

impl ClusterEvent {
    /// Returns the cluster name the event concerns.
    #[inline]
    #[must_use]
    pub fn cluster(&self) -> &str {
        match self {
            Self::Line { cluster, .. }
            | Self::Reconnected { cluster }
            | Self::Faulted { cluster } => cluster,
        }
    }

    /// Returns the line text if this is a `Line` event.
    #[inline]
    #[must_use]
    pub fn line(&self) -> Option<&str> {
        match self {
            Self::Line { line, .. } => Some(line),
            _ => None,
        }
    }
}

// ============================================================================
// RelayEvent
// ============================================================================

/// A notification from the relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A downstream peer sent a command line, forwarded verbatim.
    CommandReceived(String),

    /// The number of connected peers changed.
    ClientCount(usize),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_accessor() {
        let line = ClusterEvent::Line {
            cluster: "VE7CC".into(),
            line: "DX de W3LPL: 14025.0 K1ABC".into(),
        };
        assert_eq!(line.cluster(), "VE7CC");
        assert_eq!(line.line(), Some("DX de W3LPL: 14025.0 K1ABC"));

        let faulted = ClusterEvent::Faulted {
            cluster: "W3LPL".into(),
        };
        assert_eq!(faulted.cluster(), "W3LPL");
        assert_eq!(faulted.line(), None);
    }
}
