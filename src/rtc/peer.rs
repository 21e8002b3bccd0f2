//! A single peer-to-peer connection with perfect negotiation.
//!
//! Each peer runs one task that owns all negotiation state and consumes a
//! single ordered queue of inbound signals and engine events. Processing
//! one item to completion before the next preserves signal order per
//! pairing, which the negotiation algorithm depends on.
//!
//! Offers flow one way: the impolite side initiates (the first offer and
//! ICE restarts), the polite side only answers, so two peers built here
//! can never offer at each other simultaneously. The impolite side still
//! drops any colliding offer a remote implementation might send while
//! its own is in flight, and swallows the candidate failures that
//! follow, so negotiation converges without an arbiter either way.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::connection::{Connection, ConnectionState, Lifecycle};
use crate::error::{Error, Result};
use crate::rtc::endpoint::{EndpointEvent, RtcEndpoint, WebRtcEndpoint};
use crate::rtc::types::{RtcConfig, Signal};
use crate::stream::{network_stream, NetworkStream, StreamHalves};

const DATA_BUFFER: usize = 64;

enum PeerCommand {
    /// An inbound signal, optionally with a completion to report the
    /// processing outcome back to the caller.
    Signal(Signal, Option<oneshot::Sender<Result<()>>>),
    Event(EndpointEvent),
}

/// Handle to one negotiated peer connection. Cheap to clone.
///
/// Outgoing signals are emitted on the channel given at construction;
/// the caller is responsible for carrying them to the remote side and
/// feeding the remote side's signals back in.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    lifecycle: Lifecycle,
    commands: mpsc::UnboundedSender<PeerCommand>,
    data: Mutex<Option<StreamHalves<Bytes>>>,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        // Last handle gone: tear the connection down rather than leaking
        // the engine and its tasks.
        self.lifecycle.request_close();
    }
}

impl Peer {
    /// Build a peer over a real WebRTC engine.
    ///
    /// `polite` picks the glare role and must differ between the two sides
    /// of a pairing. Every outgoing signal appears on `signals`.
    pub async fn new(
        polite: bool,
        config: &RtcConfig,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Result<Peer> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(WebRtcEndpoint::new(config, event_tx).await?);
        Ok(Peer::spawn(endpoint, event_rx, polite, signals))
    }

    pub(crate) fn spawn(
        endpoint: Arc<dyn RtcEndpoint>,
        mut events: mpsc::UnboundedReceiver<EndpointEvent>,
        polite: bool,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Peer {
        let lifecycle = Lifecycle::new();
        lifecycle.set_state(ConnectionState::Connecting);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (data_in_tx, data_in_rx) = mpsc::channel(DATA_BUFFER);
        let (data_out_tx, mut data_out_rx) = mpsc::channel::<Bytes>(DATA_BUFFER);

        // Engine events join the same queue as inbound signals.
        let bridge_tx = cmd_tx.clone();
        let bridge_lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            if bridge_tx.send(PeerCommand::Event(event)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = bridge_lifecycle.wait_closed() => break,
                }
            }
        });

        let writer_endpoint = endpoint.clone();
        let writer_lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = data_out_rx.recv() => match chunk {
                        Some(chunk) => {
                            if let Err(error) = writer_endpoint.send_data(chunk).await {
                                debug!(%error, "data channel write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_lifecycle.wait_closed() => break,
                }
            }
        });

        // Close sequencing: a request (local close, remote shutdown signal
        // or dropped handle) shuts the engine down, then `closed` settles.
        let close_endpoint = endpoint.clone();
        let close_lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            close_lifecycle.close_requested().await;
            if let Err(error) = close_endpoint.close().await {
                debug!(%error, "error closing peer connection");
            }
            close_lifecycle.mark_closed();
        });

        tokio::spawn(run(
            endpoint,
            lifecycle.clone(),
            cmd_rx,
            polite,
            signals,
            data_in_tx,
        ));

        Peer {
            inner: Arc::new(PeerInner {
                lifecycle,
                commands: cmd_tx,
                data: Mutex::new(Some(StreamHalves {
                    inbound: data_in_rx,
                    outbound: data_out_tx,
                })),
            }),
        }
    }

    /// Feed one inbound signal and wait until it has been processed.
    ///
    /// Succeeds for signals the negotiation deliberately discards (ignored
    /// colliding offers, candidates made stale by them); fails only for
    /// genuine negotiation errors or when the peer is already closed.
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(PeerCommand::Signal(signal, Some(tx)))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Fire-and-forget variant of [`Peer::signal`] for routers that must
    /// not stall on one pairing. Errors are logged by the peer task.
    pub(crate) fn feed(&self, signal: Signal) {
        let _ = self.inner.commands.send(PeerCommand::Signal(signal, None));
    }

    /// Resolves when the connection is established, or fails with
    /// [`Error::Closed`] if it closes first.
    pub async fn connected(&self) -> Result<()> {
        self.inner.lifecycle.connected().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    /// The byte stream over the peer's data channel.
    ///
    /// Returns `None` after the first call; the stream can only be taken
    /// once.
    pub fn data_stream(&self) -> Option<NetworkStream<Bytes>> {
        let halves = self.inner.data.lock().ok()?.take()?;
        Some(network_stream(Arc::new(self.clone()), halves))
    }
}

#[async_trait]
impl Connection for Peer {
    async fn ready(&self) -> Result<()> {
        self.inner.lifecycle.connected().await
    }

    async fn closed(&self) {
        self.inner.lifecycle.wait_closed().await;
    }

    fn close(&self) {
        self.inner.lifecycle.request_close();
    }
}

async fn run(
    endpoint: Arc<dyn RtcEndpoint>,
    lifecycle: Lifecycle,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    polite: bool,
    signals: mpsc::UnboundedSender<Signal>,
    data_in: mpsc::Sender<Bytes>,
) {
    let mut making_offer = false;
    let mut ignore_offer = false;

    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = lifecycle.wait_closed() => break,
        };

        match command {
            PeerCommand::Event(EndpointEvent::NegotiationNeeded) => {
                // Only the impolite side initiates, and only for the very
                // first offer. A stale event draining from the queue after
                // negotiation has produced a description must be dropped:
                // re-offering then would restart ICE mid-gathering.
                if !polite
                    && endpoint.signaling_state() == RTCSignalingState::Stable
                    && endpoint.local_description().await.is_none()
                {
                    negotiate(endpoint.as_ref(), &signals, &mut making_offer, false).await;
                }
            }
            PeerCommand::Event(EndpointEvent::Candidate(candidate)) => {
                let _ = signals.send(Signal::candidate(candidate));
            }
            PeerCommand::Event(EndpointEvent::IceState(state)) => {
                if state == RTCIceConnectionState::Failed {
                    if polite {
                        // A restart offer from here could collide with the
                        // one the impolite side is about to make.
                        debug!("ice failed, waiting for the remote restart");
                    } else {
                        debug!("ice failed, restarting");
                        negotiate(endpoint.as_ref(), &signals, &mut making_offer, true).await;
                    }
                }
            }
            PeerCommand::Event(EndpointEvent::PeerState(state)) => match state {
                RTCPeerConnectionState::Connected => {
                    lifecycle.set_state(ConnectionState::Connected);
                }
                RTCPeerConnectionState::Closed => {
                    lifecycle.request_close();
                }
                _ => {
                    lifecycle.set_state(ConnectionState::Connecting);
                }
            },
            PeerCommand::Event(EndpointEvent::Data(chunk)) => {
                if data_in.send(chunk).await.is_err() {
                    debug!("data consumer gone, discarding inbound data");
                }
            }
            PeerCommand::Signal(signal, completion) => {
                let outcome = handle_signal(
                    endpoint.as_ref(),
                    &signals,
                    polite,
                    &mut making_offer,
                    &mut ignore_offer,
                    signal,
                )
                .await;
                match completion {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => {
                        if let Err(error) = outcome {
                            warn!(%error, "negotiation error");
                        }
                    }
                }
            }
        }
    }
}

/// Make an offer and emit it. Failures are logged, not fatal: a later
/// negotiation-needed event retries. The in-flight flag is cleared on
/// every exit path so one failed offer cannot wedge collision detection.
async fn negotiate(
    endpoint: &dyn RtcEndpoint,
    signals: &mpsc::UnboundedSender<Signal>,
    making_offer: &mut bool,
    ice_restart: bool,
) {
    *making_offer = true;
    let outcome: Result<()> = async {
        let offer = endpoint.create_offer(ice_restart).await?;
        endpoint.set_local_description(offer).await?;
        let description = endpoint
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("no local description after offer".into()))?;
        let _ = signals.send(Signal::description(description));
        Ok(())
    }
    .await;
    if let Err(error) = outcome {
        debug!(%error, "failed to make offer");
    }
    *making_offer = false;
}

async fn handle_signal(
    endpoint: &dyn RtcEndpoint,
    signals: &mpsc::UnboundedSender<Signal>,
    polite: bool,
    making_offer: &mut bool,
    ignore_offer: &mut bool,
    signal: Signal,
) -> Result<()> {
    if let Some(description) = signal.description {
        let is_offer = description.sdp_type == RTCSdpType::Offer;
        let offer_collision = is_offer
            && (*making_offer || endpoint.signaling_state() != RTCSignalingState::Stable);

        *ignore_offer = !polite && offer_collision;
        if *ignore_offer {
            debug!("dropping colliding offer");
            return Ok(());
        }

        // The polite side never holds a competing offer of its own (it
        // does not initiate), so remote descriptions always apply as-is.
        endpoint.set_remote_description(description).await?;
        if is_offer {
            let answer = endpoint.create_answer().await?;
            endpoint.set_local_description(answer).await?;
            if let Some(description) = endpoint.local_description().await {
                let _ = signals.send(Signal::description(description));
            }
        }
    } else if let Some(candidate) = signal.candidate {
        if let Err(error) = endpoint.add_ice_candidate(candidate).await {
            // Candidates for an offer we dropped are expected debris.
            if !*ignore_offer {
                return Err(error);
            }
            debug!(%error, "discarding candidate for ignored offer");
        }
    }
    // Shutdown and empty signals are handled by the routing layer; here
    // they are no-ops.
    Ok(())
}
