//! In-process signaling bus.
//!
//! Every signal sent by any participant is broadcast to all of them; each
//! signaler delivers only what is addressed to it. Reference behavior for
//! the protocol layer and the backbone of the end-to-end tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::connection::{Connection, ConnectionState, Lifecycle};
use crate::error::Result;
use crate::stream::{network_stream, StreamHalves};
use crate::rtc::signaler::Signaler;
use crate::rtc::types::{AddressableSignal, PeerId};

const BUS_CAPACITY: usize = 256;
const CHANNEL_BUFFER: usize = 64;

/// Broadcast bus connecting any number of [`Signaler`]s in one process.
#[derive(Clone)]
pub struct SignalBus {
    bus: broadcast::Sender<AddressableSignal>,
}

impl SignalBus {
    pub fn new() -> Self {
        SignalBus {
            bus: broadcast::channel(BUS_CAPACITY).0,
        }
    }

    /// Attach a new participant with a fresh identity. The signaler is
    /// immediately ready.
    pub fn signaler(&self) -> Signaler {
        let id = PeerId::fresh();
        let conn = Arc::new(BusConn::new());

        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (out_tx, mut out_rx) = mpsc::channel::<AddressableSignal>(CHANNEL_BUFFER);

        let mut bus_rx = self.bus.subscribe();
        let deliver_conn = conn.clone();
        let own_id = id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = bus_rx.recv() => match message {
                        Ok(message) if message.to.as_ref() == Some(&own_id) => {
                            if in_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "signal bus receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = deliver_conn.lifecycle.wait_closed() => break,
                }
            }
        });

        let bus_tx = self.bus.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                // Send only fails with no subscribers at all, which is fine.
                let _ = bus_tx.send(message);
            }
        });

        Signaler::new(
            id,
            network_stream(
                conn,
                StreamHalves {
                    inbound: in_rx,
                    outbound: out_tx,
                },
            ),
        )
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

struct BusConn {
    lifecycle: Lifecycle,
}

impl BusConn {
    fn new() -> Self {
        let lifecycle = Lifecycle::new();
        lifecycle.set_state(ConnectionState::Connected);
        let closer = lifecycle.clone();
        tokio::spawn(async move {
            closer.close_requested().await;
            closer.mark_closed();
        });
        BusConn { lifecycle }
    }
}

#[async_trait]
impl Connection for BusConn {
    async fn ready(&self) -> Result<()> {
        self.lifecycle.connected().await
    }

    async fn closed(&self) {
        self.lifecycle.wait_closed().await;
    }

    fn close(&self) {
        self.lifecycle.request_close();
    }
}
