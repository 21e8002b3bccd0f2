//! Signaling over a PeerJS-style websocket relay.
//!
//! The relay matters only until peers negotiate their direct link: it
//! assigns no ids (we bring our own), it just forwards `CANDIDATE` frames
//! to the destination id. Readiness is the relay's `OPEN` frame, not the
//! websocket handshake. Liveness is a periodic heartbeat, which the relay
//! echoes, plus a deadline on inbound relay frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionState, Lifecycle};
use crate::error::Result;
use crate::stream::{network_stream, NetworkStream, StreamHalves};
use crate::ws::WsClient;
use crate::rtc::signaler::Signaler;
use crate::rtc::types::{random_token, AddressableSignal, PeerId};

const CHANNEL_BUFFER: usize = 64;
const TOKEN_LENGTH: usize = 16;
const HEARTBEAT_FRAME: &str = r#"{"type":"HEARTBEAT"}"#;

/// Wire frames of the relay protocol.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum RelayFrame {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "CANDIDATE")]
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<PeerId>,
        dst: PeerId,
        payload: AddressableSignal,
    },
    #[serde(rename = "ID-TAKEN")]
    IdTaken,
    #[serde(rename = "EXPIRE")]
    Expire,
    #[serde(rename = "ERROR")]
    Error {
        #[serde(default)]
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base websocket url of the relay, e.g. `ws://host:9000/peerjs`.
    pub url: String,
    /// API key expected by the relay.
    pub key: String,
    /// How often to send a heartbeat frame.
    pub heartbeat: Duration,
    /// Close the signaler when nothing has arrived for this long.
    pub timeout: Duration,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RelayConfig {
            url: url.into(),
            key: "peerjs".to_owned(),
            heartbeat: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Connect to the relay under a fresh id.
///
/// The returned signaler is ready once the relay confirms the session
/// with `OPEN`; the websocket below it reconnects on its own.
pub fn connect(config: RelayConfig) -> Signaler {
    let id = PeerId::fresh();
    let url = session_url(&config.url, &id, &random_token(TOKEN_LENGTH), &config.key);
    let (ws, ws_stream) = WsClient::connect(url);

    let conn = Arc::new(RelayConn {
        lifecycle: Lifecycle::new(),
    });
    let teardown_conn = conn.clone();
    let teardown_ws = ws.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = teardown_conn.lifecycle.close_requested() => {}
            _ = teardown_ws.closed() => {}
        }
        teardown_ws.close();
        teardown_ws.closed().await;
        teardown_conn.lifecycle.mark_closed();
    });

    let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);
    tokio::spawn(relay_task(ws_stream, conn.clone(), config, in_tx, out_rx));

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

/// Session url for one relay registration. A bare `ws://host:port` base
/// gets a root path first: a query appended straight onto the authority
/// produces a request line no websocket server accepts.
fn session_url(base: &str, id: &PeerId, token: &str, key: &str) -> String {
    let mut url = base.to_owned();
    let after_scheme = base.find("://").map(|at| at + 3).unwrap_or(0);
    if !base[after_scheme..].contains('/') {
        url.push('/');
    }
    format!("{url}?id={id}&token={token}&key={key}")
}

struct RelayConn {
    lifecycle: Lifecycle,
}

#[async_trait]
impl Connection for RelayConn {
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

async fn relay_task(
    mut ws_stream: NetworkStream<Message>,
    conn: Arc<RelayConn>,
    config: RelayConfig,
    in_tx: mpsc::Sender<AddressableSignal>,
    mut out_rx: mpsc::Receiver<AddressableSignal>,
) {
    let ws_out = ws_stream.sender();
    let mut heartbeat = tokio::time::interval(config.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            message = ws_stream.recv() => match message {
                Some(Message::Text(text)) => {
                    last_seen = Instant::now();
                    match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(RelayFrame::Open) => {
                            debug!("relay session open");
                            conn.lifecycle.set_state(ConnectionState::Connected);
                        }
                        Ok(RelayFrame::Candidate { payload, .. }) => {
                            if in_tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Ok(RelayFrame::Heartbeat) => {}
                        Ok(RelayFrame::Expire) => {
                            warn!("relay could not deliver a signal");
                        }
                        Ok(RelayFrame::IdTaken) => {
                            error!("relay rejected our id as taken");
                            conn.close();
                        }
                        Ok(RelayFrame::Error { payload }) => {
                            error!(%payload, "relay error");
                            conn.close();
                        }
                        Err(err) => debug!(%err, "unrecognized relay frame"),
                    }
                }
                // Pings and pongs only prove the socket, not the relay
                // session, so they do not feed the liveness deadline.
                Some(_) => {}
                None => break,
            },
            message = out_rx.recv() => match message {
                Some(message) => {
                    let Some(dst) = message.to.clone() else {
                        // The relay routes by destination; nothing sane to
                        // do with an unaddressed signal.
                        warn!("dropping unaddressed signal");
                        continue;
                    };
                    let frame = RelayFrame::Candidate {
                        src: Some(message.from.clone()),
                        dst,
                        payload: message,
                    };
                    match serde_json::to_string(&frame) {
                        Ok(encoded) => {
                            if ws_out.send(Message::Text(encoded)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "failed to encode signal"),
                    }
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > config.timeout {
                    warn!("relay liveness deadline expired");
                    conn.close();
                    break;
                }
                let _ = ws_out
                    .send(Message::Text(HEARTBEAT_FRAME.to_owned()))
                    .await;
            }
            _ = conn.closed() => break,
        }
    }
    conn.close();
}
