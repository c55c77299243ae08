//! Connects to a DX cluster and relays its traffic to local TCP peers.
//!
//! Usage:
//!
//! ```text
//! cargo run --example cluster_relay -- <host> <port> <callsign> [relay-port]
//! ```
//!
//! Then attach any telnet client to the relay port (default 7310) to watch
//! the cluster stream and type commands upstream.

use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use spotlink::{ClusterDef, ClusterManager, RelayConfig, RelayServer, bridge};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [host, port, callsign, rest @ ..] = args.as_slice() else {
        bail!("usage: cluster_relay <host> <port> <callsign> [relay-port]");
    };
    let port: u16 = port.parse().context("cluster port")?;
    let relay_port: u16 = match rest {
        [p, ..] => p.parse().context("relay port")?,
        [] => 7310,
    };

    let def = ClusterDef::new("cluster", host.as_str(), port)
        .with_auto_login(callsign.as_str())
        .with_default_commands(["SET/PAGE 0"]);

    let manager = ClusterManager::new(vec![def])?;
    if !manager.connect("cluster", false).await {
        bail!("could not connect to {host}:{port}");
    }

    let relay = RelayServer::new(RelayConfig::new(relay_port));
    relay.start().await?;
    let wiring = bridge(manager.clone(), relay.clone());

    println!("relaying {host}:{port} on 127.0.0.1:{relay_port}, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    wiring.shutdown();
    relay.stop().await;
    manager.shutdown().await;
    Ok(())
}
