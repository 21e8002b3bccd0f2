//! Client and server roles over a [`Signaler`].
//!
//! The client directs everything at one well-known server id and builds a
//! single impolite peer. The server routes inbound signals by origin,
//! lazily building one polite peer per distinct remote. Opposite glare
//! roles on the two ends are what make negotiation converge.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::Result;
use crate::rtc::peer::Peer;
use crate::rtc::signaler::Signaler;
use crate::rtc::types::{AddressableSignal, PeerId, RtcConfig, Signal};

/// Connect to the server listening as `server` on the signaling channel.
///
/// Returns the single peer for that pairing. Closing the signaler closes
/// the peer; closing the peer sends a shutdown notice and releases the
/// signaler.
pub async fn client(server: PeerId, signaler: Signaler, config: &RtcConfig) -> Result<Peer> {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let peer = Peer::new(false, config, signal_tx).await?;

    let own = signaler.id().clone();
    let outbound = signaler.sender();

    // Stamp outgoing signals with our identity and the server address.
    let forward_to = server.clone();
    let forward_out = outbound.clone();
    let forward_own = own.clone();
    tokio::spawn(async move {
        while let Some(signal) = signal_rx.recv().await {
            let message = AddressableSignal {
                from: forward_own.clone(),
                to: Some(forward_to.clone()),
                signal,
            };
            if forward_out.send(message).await.is_err() {
                break;
            }
        }
    });

    // Inbound signals feed the peer; losing the channel closes it.
    let inbound_peer = peer.clone();
    tokio::spawn(async move {
        let mut signaler = signaler;
        loop {
            tokio::select! {
                message = signaler.recv() => match message {
                    Some(message) => {
                        if message.signal.is_shutdown() {
                            debug!(from = %message.from, "remote shut the pairing down");
                            break;
                        }
                        inbound_peer.feed(message.signal);
                    }
                    None => break,
                },
                _ = inbound_peer.closed() => {
                    // Local close: tell the server so it can drop its peer.
                    let _ = outbound
                        .send(AddressableSignal {
                            from: own.clone(),
                            to: Some(server.clone()),
                            signal: Signal::shutdown(),
                        })
                        .await;
                    break;
                }
            }
        }
        inbound_peer.close();
        signaler.close();
    });

    Ok(peer)
}

/// Listen for clients on the signaling channel.
///
/// Yields exactly one [`Peer`] per distinct remote origin; further
/// signals from a known origin are routed to its existing peer. When the
/// signaler ends, every routed peer is closed and the sequence ends.
pub fn server(signaler: Signaler, config: RtcConfig) -> mpsc::UnboundedReceiver<Peer> {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    tokio::spawn(route(signaler, config, peers_tx));
    peers_rx
}

struct Route {
    peer: Peer,
    forwarder: JoinHandle<()>,
}

async fn route(mut signaler: Signaler, config: RtcConfig, peers_tx: mpsc::UnboundedSender<Peer>) {
    let mut table: HashMap<PeerId, Route> = HashMap::new();
    let own = signaler.id().clone();
    let outbound = signaler.sender();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<PeerId>();

    loop {
        tokio::select! {
            message = signaler.recv() => match message {
                Some(message) => {
                    let origin = message.from.clone();
                    if message.signal.is_shutdown() {
                        match table.remove(&origin) {
                            Some(route) => {
                                info!(peer = %origin, "peer shut down");
                                route.forwarder.abort();
                                route.peer.close();
                            }
                            // A shutdown can race our own teardown of the
                            // same pairing; nothing to do then.
                            None => debug!(peer = %origin, "shutdown for unknown peer"),
                        }
                        continue;
                    }

                    let peer = match table.get(&origin) {
                        Some(route) => route.peer.clone(),
                        None => {
                            match admit(&own, &origin, &config, &outbound, &closed_tx).await {
                                Ok(route) => {
                                    info!(peer = %origin, "new peer");
                                    let peer = route.peer.clone();
                                    if peers_tx.send(peer.clone()).is_err() {
                                        // Nobody is accepting peers anymore.
                                        route.forwarder.abort();
                                        peer.close();
                                        break;
                                    }
                                    table.insert(origin.clone(), route);
                                    peer
                                }
                                Err(error) => {
                                    warn!(peer = %origin, %error, "failed to build peer");
                                    continue;
                                }
                            }
                        }
                    };
                    peer.feed(message.signal);
                }
                None => break,
            },
            Some(origin) = closed_rx.recv() => {
                // Detach forwarding before dropping the entry so a late
                // in-flight signal cannot revive the dead peer.
                if let Some(route) = table.remove(&origin) {
                    route.forwarder.abort();
                    debug!(peer = %origin, "peer closed, removing route");
                    let _ = outbound
                        .send(AddressableSignal {
                            from: own.clone(),
                            to: Some(origin.clone()),
                            signal: Signal::shutdown(),
                        })
                        .await;
                }
            }
        }
    }

    for (_, route) in table.drain() {
        route.forwarder.abort();
        route.peer.close();
    }
}

/// Build the polite peer for a newly seen origin and wire its outgoing
/// signals back through the signaler.
async fn admit(
    own: &PeerId,
    origin: &PeerId,
    config: &RtcConfig,
    outbound: &mpsc::Sender<AddressableSignal>,
    closed_tx: &mpsc::UnboundedSender<PeerId>,
) -> Result<Route> {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let peer = Peer::new(true, config, signal_tx).await?;

    let forward_own = own.clone();
    let forward_to = origin.clone();
    let forward_out = outbound.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(signal) = signal_rx.recv().await {
            let message = AddressableSignal {
                from: forward_own.clone(),
                to: Some(forward_to.clone()),
                signal,
            };
            if forward_out.send(message).await.is_err() {
                break;
            }
        }
    });

    let watched = peer.clone();
    let watched_origin = origin.clone();
    let watched_closed = closed_tx.clone();
    tokio::spawn(async move {
        watched.closed().await;
        let _ = watched_closed.send(watched_origin);
    });

    Ok(Route { peer, forwarder })
}
