//! End-to-end negotiation between a client and a server over the
//! in-memory signaling bus, with real peer connections on loopback.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::time::timeout;
use vtt_net::{client, server, Connection, RtcConfig, SignalBus};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DATA_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test(flavor = "multi_thread")]
async fn client_and_server_exchange_data() -> Result<()> {
    init_logging();
    let bus = SignalBus::new();

    let server_signaler = bus.signaler();
    let server_id = server_signaler.id().clone();
    let mut peers = server(server_signaler, RtcConfig::host_only());

    let client_peer = client(server_id, bus.signaler(), &RtcConfig::host_only()).await?;

    let server_peer = timeout(Duration::from_secs(10), peers.recv())
        .await
        .context("waiting for the routed peer")?
        .context("peer sequence ended")?;

    timeout(CONNECT_TIMEOUT, client_peer.connected()).await??;
    timeout(CONNECT_TIMEOUT, server_peer.connected()).await??;

    let mut client_stream = client_peer.data_stream().context("client data stream")?;
    let mut server_stream = server_peer.data_stream().context("server data stream")?;

    client_stream.send(Bytes::from_static(b"roll 2d6")).await?;
    let received = timeout(DATA_TIMEOUT, server_stream.recv())
        .await
        .context("waiting for client data")?
        .context("server stream ended")?;
    assert_eq!(received.as_ref(), b"roll 2d6");

    server_stream.send(Bytes::from_static(b"you rolled 9")).await?;
    let received = timeout(DATA_TIMEOUT, client_stream.recv())
        .await
        .context("waiting for server data")?
        .context("client stream ended")?;
    assert_eq!(received.as_ref(), b"you rolled 9");

    client_peer.close();
    timeout(Duration::from_secs(10), client_peer.closed()).await?;
    timeout(Duration::from_secs(10), server_peer.closed()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn two_clients_get_independent_peers() -> Result<()> {
    init_logging();
    let bus = SignalBus::new();

    let server_signaler = bus.signaler();
    let server_id = server_signaler.id().clone();
    let mut peers = server(server_signaler, RtcConfig::host_only());

    // Sequential so the routed peers map unambiguously to the clients.
    let first = client(server_id.clone(), bus.signaler(), &RtcConfig::host_only()).await?;
    let routed_a = timeout(Duration::from_secs(10), peers.recv())
        .await
        .context("first routed peer")?
        .context("peer sequence ended")?;
    timeout(CONNECT_TIMEOUT, first.connected()).await??;
    timeout(CONNECT_TIMEOUT, routed_a.connected()).await??;

    let second = client(server_id, bus.signaler(), &RtcConfig::host_only()).await?;
    let routed_b = timeout(Duration::from_secs(10), peers.recv())
        .await
        .context("second routed peer")?
        .context("peer sequence ended")?;
    timeout(CONNECT_TIMEOUT, second.connected()).await??;
    timeout(CONNECT_TIMEOUT, routed_b.connected()).await??;

    // Closing one pairing leaves the other connected.
    first.close();
    timeout(Duration::from_secs(10), routed_a.closed()).await?;
    timeout(CONNECT_TIMEOUT, second.connected()).await??;

    second.close();
    timeout(Duration::from_secs(10), routed_b.closed()).await?;
    Ok(())
}
