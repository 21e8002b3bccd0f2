//! Reconnecting websocket client.
//!
//! The client presents a single [`NetworkStream`] of websocket messages
//! across any number of underlying sockets. Unexpected drops are retried
//! with exponential backoff; an explicit `close()` ends the connection
//! permanently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionState, Lifecycle};
use crate::error::Result;
use crate::stream::{network_stream, NetworkStream, StreamHalves};

const CHANNEL_BUFFER: usize = 64;

/// Exponential reconnect backoff: `min(2^failures * 100ms, 5s)`.
///
/// Only failed connection attempts count as failures; a drop after the
/// socket was fully connected retries at the base delay.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    failures: u32,
}

impl Backoff {
    const BASE_MILLIS: u64 = 100;
    const MAX_MILLIS: u64 = 5_000;

    fn new() -> Self {
        Self::default()
    }

    fn next_delay(&self) -> Duration {
        let factor = 1u64 << self.failures.min(16);
        Duration::from_millis((Self::BASE_MILLIS * factor).min(Self::MAX_MILLIS))
    }

    fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Handle to a reconnecting websocket connection.
///
/// Cheap to clone; all clones observe the same lifecycle.
#[derive(Clone)]
pub struct WsClient {
    lifecycle: Lifecycle,
}

impl WsClient {
    /// Connect to `url`, reconnecting on unexpected drops until closed.
    ///
    /// Messages sent on the returned stream while the socket is down are
    /// buffered (up to the channel capacity) and flushed on reconnect.
    pub fn connect(url: impl Into<String>) -> (WsClient, NetworkStream<Message>) {
        let lifecycle = Lifecycle::new();
        let client = WsClient {
            lifecycle: lifecycle.clone(),
        };

        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);
        tokio::spawn(supervise(url.into(), lifecycle, in_tx, out_rx));

        let stream = network_stream(
            Arc::new(client.clone()),
            StreamHalves {
                inbound: in_rx,
                outbound: out_tx,
            },
        );
        (client, stream)
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Resolves whenever the client is (or next becomes) connected.
    /// Unlike [`Connection::ready`], this is meaningful across reconnects.
    pub async fn connected(&self) -> Result<()> {
        self.lifecycle.connected().await
    }
}

#[async_trait]
impl Connection for WsClient {
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

async fn supervise(
    url: String,
    lifecycle: Lifecycle,
    in_tx: mpsc::Sender<Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    let mut backoff = Backoff::new();
    loop {
        if lifecycle.is_close_requested() {
            break;
        }
        lifecycle.set_state(ConnectionState::Connecting);

        let attempt = tokio::select! {
            res = connect_async(url.as_str()) => res,
            _ = lifecycle.close_requested() => break,
        };

        match attempt {
            Ok((socket, _response)) => {
                backoff.reset();
                debug!(url = %url, "websocket connected");
                lifecycle.set_state(ConnectionState::Connected);
                pump(socket, &lifecycle, &in_tx, &mut out_rx).await;
                if lifecycle.is_close_requested() {
                    break;
                }
                lifecycle.set_state(ConnectionState::Connecting);
                warn!(url = %url, "websocket dropped, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(backoff.next_delay()) => {}
                    _ = lifecycle.close_requested() => break,
                }
            }
            Err(error) => {
                let delay = backoff.next_delay();
                backoff.record_failure();
                warn!(url = %url, %error, ?delay, "websocket connect failed");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = lifecycle.close_requested() => break,
                }
            }
        }
    }
    lifecycle.mark_closed();
}

/// Drive one socket until it drops or a close is requested.
async fn pump(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    lifecycle: &Lifecycle,
    in_tx: &mpsc::Sender<Message>,
    out_rx: &mut mpsc::Receiver<Message>,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(message)) => {
                    if message.is_close() {
                        continue;
                    }
                    if in_tx.send(message).await.is_err() {
                        // Consumer went away; nothing left to deliver to.
                        lifecycle.request_close();
                        break;
                    }
                }
                Some(Err(error)) => {
                    debug!(%error, "websocket read failed");
                    break;
                }
                None => break,
            },
            message = out_rx.recv() => match message {
                Some(message) => {
                    if let Err(error) = sink.send(message).await {
                        debug!(%error, "websocket write failed");
                        break;
                    }
                }
                None => {
                    // All writers dropped; shut the connection down cleanly.
                    lifecycle.request_close();
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = lifecycle.close_requested() => {
                let _ = sink.close().await;
                break;
            }
        }
    }
}
