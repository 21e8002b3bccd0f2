//! Relay-backed signaling against a local PeerJS-style relay server.
//!
//! The server here implements just enough of the relay protocol for the
//! tests: it reads the id from the connect query, confirms the session
//! with `OPEN`, routes `CANDIDATE` frames by destination id and echoes
//! heartbeats.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use vtt_net::rtc::relay::{self, RelayConfig};
use vtt_net::{client, server, AddressableSignal, Connection, RtcConfig, Signal};

type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;

fn query_param(uri: &str, name: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_owned())
    })
}

/// Accept relay clients, routing frames between them. When `silent` is
/// set the server registers clients but never sends anything, which lets
/// the liveness deadline kick in.
async fn spawn_relay_server(silent: bool) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let registry = registry.clone();
            tokio::spawn(async move {
                let uri = Arc::new(Mutex::new(String::new()));
                let capture = uri.clone();
                let Ok(socket) = tokio_tungstenite::accept_hdr_async(
                    stream,
                    move |req: &Request, resp: Response| {
                        *capture.lock().unwrap() = req.uri().to_string();
                        Ok(resp)
                    },
                )
                .await
                else {
                    return;
                };

                let uri = uri.lock().unwrap().clone();
                let Some(id) = query_param(&uri, "id") else {
                    return;
                };

                let (tx, mut rx) = mpsc::unbounded_channel();
                registry.lock().unwrap().insert(id.clone(), tx.clone());
                if !silent {
                    let _ = tx.send(Message::Text(r#"{"type":"OPEN"}"#.to_owned()));
                }

                let (mut sink, mut reader) = socket.split();
                let writer = tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(Ok(message)) = reader.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    if silent {
                        continue;
                    }
                    let Ok(mut frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    match frame["type"].as_str() {
                        Some("HEARTBEAT") => {
                            let _ = tx.send(Message::Text(r#"{"type":"HEARTBEAT"}"#.to_owned()));
                        }
                        Some("CANDIDATE") => {
                            let Some(dst) = frame["dst"].as_str().map(str::to_owned) else {
                                continue;
                            };
                            frame["src"] = serde_json::Value::String(id.clone());
                            let peer = registry.lock().unwrap().get(&dst).cloned();
                            match peer {
                                Some(peer) => {
                                    let _ = peer.send(Message::Text(frame.to_string()));
                                }
                                None => {
                                    let _ = tx
                                        .send(Message::Text(r#"{"type":"EXPIRE"}"#.to_owned()));
                                }
                            }
                        }
                        _ => {}
                    }
                }

                registry.lock().unwrap().remove(&id);
                writer.abort();
            });
        }
    });
    Ok(addr)
}

fn relay_config(addr: SocketAddr) -> RelayConfig {
    RelayConfig::new(format!("ws://{addr}"))
}

#[tokio::test]
async fn signalers_become_ready_and_exchange_signals() -> Result<()> {
    let addr = spawn_relay_server(false).await?;

    let alice = relay::connect(relay_config(addr));
    let mut bob = relay::connect(relay_config(addr));

    timeout(Duration::from_secs(5), alice.ready()).await??;
    timeout(Duration::from_secs(5), bob.ready()).await??;

    alice
        .send(AddressableSignal {
            from: alice.id().clone(),
            to: Some(bob.id().clone()),
            signal: Signal::shutdown(),
        })
        .await?;

    let delivered = timeout(Duration::from_secs(5), bob.recv())
        .await
        .context("waiting for the relayed signal")?
        .context("signaler ended")?;
    assert_eq!(&delivered.from, alice.id());
    assert!(delivered.signal.is_shutdown());

    alice.close();
    bob.close();
    Ok(())
}

#[tokio::test]
async fn liveness_deadline_closes_a_dead_session() -> Result<()> {
    let addr = spawn_relay_server(true).await?;

    let mut config = relay_config(addr);
    config.heartbeat = Duration::from_millis(100);
    config.timeout = Duration::from_millis(400);
    let signaler = relay::connect(config);

    // Never ready (no OPEN), and closed once the deadline expires.
    timeout(Duration::from_secs(5), signaler.closed()).await?;
    assert!(signaler.ready().await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn full_negotiation_through_the_relay() -> Result<()> {
    let addr = spawn_relay_server(false).await?;

    let server_signaler = relay::connect(relay_config(addr));
    let server_id = server_signaler.id().clone();
    let mut peers = server(server_signaler, RtcConfig::host_only());

    let client_peer = client(
        server_id,
        relay::connect(relay_config(addr)),
        &RtcConfig::host_only(),
    )
    .await?;

    let server_peer = timeout(Duration::from_secs(15), peers.recv())
        .await
        .context("waiting for the routed peer")?
        .context("peer sequence ended")?;

    timeout(Duration::from_secs(30), client_peer.connected()).await??;
    timeout(Duration::from_secs(30), server_peer.connected()).await??;

    let mut client_stream = client_peer.data_stream().context("client data stream")?;
    let mut server_stream = server_peer.data_stream().context("server data stream")?;

    client_stream.send(Bytes::from_static(b"ping")).await?;
    let received = timeout(Duration::from_secs(10), server_stream.recv())
        .await
        .context("waiting for data")?
        .context("stream ended")?;
    assert_eq!(received.as_ref(), b"ping");

    client_peer.close();
    timeout(Duration::from_secs(10), server_peer.closed()).await?;
    Ok(())
}
