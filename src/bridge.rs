//! Glue between the cluster manager and the relay server.
//!
//! Two pump tasks: active-cluster lines flow out to relay peers, and
//! peer command lines flow back to the active cluster. Lines from a
//! non-active cluster are dropped here so peers only ever see one node's
//! traffic.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::{ClusterEvent, RelayEvent};
use crate::manager::ClusterManager;
use crate::relay::RelayServer;

// ============================================================================
// BridgeHandle
// ============================================================================

/// Owns the two pump tasks; dropping it does NOT stop them, call
/// [`shutdown`](Self::shutdown).
pub struct BridgeHandle {
    downstream: JoinHandle<()>,
    upstream: JoinHandle<()>,
}

impl BridgeHandle {
    /// Stops both pumps. The manager and relay keep running.
    pub fn shutdown(&self) {
        self.downstream.abort();
        self.upstream.abort();
        debug!("bridge stopped");
    }
}

/// Wires a manager and a relay together and returns the handle that
/// controls the wiring.
#[must_use]
pub fn bridge(manager: Arc<ClusterManager>, relay: RelayServer) -> BridgeHandle {
    let downstream = tokio::spawn(pump_cluster_to_relay(
        Arc::clone(&manager),
        relay.clone(),
    ));
    let upstream = tokio::spawn(pump_relay_to_cluster(manager, relay));

    BridgeHandle {
        downstream,
        upstream,
    }
}

// ============================================================================
// Pumps
// ============================================================================

/// Forwards active-cluster lines to every relay peer.
async fn pump_cluster_to_relay(manager: Arc<ClusterManager>, relay: RelayServer) {
    let mut events = manager.subscribe();

    loop {
        match events.recv().await {
            Ok(ClusterEvent::Line { cluster, line }) => {
                if manager.active_cluster().as_deref() == Some(cluster.as_str()) {
                    relay.broadcast_line(&line).await;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "bridge lagged behind cluster traffic");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Forwards relay peer commands to the active cluster.
async fn pump_relay_to_cluster(manager: Arc<ClusterManager>, relay: RelayServer) {
    let mut events = relay.subscribe();

    loop {
        match events.recv().await {
            Ok(RelayEvent::CommandReceived(line)) => {
                if let Err(e) = manager.send_raw(&line).await {
                    warn!(error = %e, "peer command failed upstream");
                }
            }
            Ok(RelayEvent::ClientCount(_)) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "bridge lagged behind peer commands");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::config::{ClusterDef, RelayConfig};
    use crate::framing::LineFramer;
    use crate::manager::ReplayTiming;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn fast_timing() -> ReplayTiming {
        ReplayTiming {
            grace: Duration::from_millis(50),
            prompt_wait: Duration::from_millis(200),
            step_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_lines_and_commands_flow_both_ways() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.expect("bind");
        let cluster_addr = listener.local_addr().expect("addr");

        // Cluster side: push one spot, then collect every line the
        // manager sends upstream.
        let (server_lines_tx, mut server_lines) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            sock.write_all(b"DX de W3LPL: 14025.0 K1ABC\r\n")
                .await
                .expect("spot");

            let mut framer = LineFramer::new();
            let mut buf = [0u8; 256];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for line in framer.push(&buf[..n]) {
                            if server_lines_tx.send(line).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        let def = ClusterDef::new(
            "W3LPL",
            cluster_addr.ip().to_string(),
            cluster_addr.port(),
        );
        let manager = ClusterManager::with_timing(vec![def], fast_timing()).expect("manager");

        let relay = RelayServer::new(RelayConfig::new(0).with_welcome("ready"));
        relay.start().await.expect("relay start");

        let handle = bridge(Arc::clone(&manager), relay.clone());

        // Peer first, so it is registered before the spot arrives.
        let peer = TcpStream::connect(relay.local_addr().expect("bound"))
            .await
            .expect("peer connect");
        let mut peer = BufReader::new(peer);
        let mut banner = String::new();
        peer.read_line(&mut banner).await.expect("banner");

        assert!(manager.connect("W3LPL", false).await);

        // Downstream: cluster line reaches the relay peer.
        let mut spot = String::new();
        timeout(RECV_TIMEOUT, peer.read_line(&mut spot))
            .await
            .expect("spot before timeout")
            .expect("peer read");
        assert_eq!(
            spot.trim_end_matches(['\r', '\n']),
            "DX de W3LPL: 14025.0 K1ABC"
        );

        // Upstream: a peer command reaches the cluster socket.
        peer.get_mut()
            .write_all(b"SH/DX 20\r\n")
            .await
            .expect("peer write");

        let got = loop {
            let line = timeout(RECV_TIMEOUT, server_lines.recv())
                .await
                .expect("upstream line")
                .expect("server running");
            // The replay completion flush also lands here; skip blanks.
            if !line.is_empty() {
                break line;
            }
        };
        assert_eq!(got, "SH/DX 20");

        handle.shutdown();
        relay.stop().await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_forwarding() {
        let manager = ClusterManager::with_timing(Vec::new(), fast_timing()).expect("manager");
        let relay = RelayServer::new(RelayConfig::new(0));
        relay.start().await.expect("relay start");

        let handle = bridge(Arc::clone(&manager), relay.clone());
        handle.shutdown();

        // Commands injected after shutdown go nowhere; this must not
        // hang or panic.
        relay.inject_command("SH/DX").expect("running");
        tokio::time::sleep(Duration::from_millis(100)).await;

        relay.stop().await;
        manager.shutdown().await;
    }
}
