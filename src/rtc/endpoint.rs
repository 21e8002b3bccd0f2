//! The seam between negotiation logic and the WebRTC engine.
//!
//! [`RtcEndpoint`] exposes exactly the operations the negotiation state
//! machine needs, so the machine itself can be exercised against a
//! scripted endpoint in tests while production uses [`WebRtcEndpoint`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};
use crate::rtc::types::RtcConfig;

/// Pre-negotiated id shared by both sides of the data channel, so no
/// in-band channel announcement is needed.
const DATA_CHANNEL_ID: u16 = 0;
const DATA_CHANNEL_LABEL: &str = "data";

/// Everything the engine reports back, serialized into the peer's single
/// event queue.
#[derive(Debug)]
pub(crate) enum EndpointEvent {
    NegotiationNeeded,
    Candidate(RTCIceCandidateInit),
    IceState(RTCIceConnectionState),
    PeerState(RTCPeerConnectionState),
    Data(Bytes),
}

#[async_trait]
pub(crate) trait RtcEndpoint: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription>;
    async fn create_answer(&self) -> Result<RTCSessionDescription>;
    async fn set_local_description(&self, description: RTCSessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()>;
    async fn local_description(&self) -> Option<RTCSessionDescription>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
    fn signaling_state(&self) -> RTCSignalingState;
    async fn send_data(&self, data: Bytes) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Production endpoint over a real `RTCPeerConnection` with one
/// pre-negotiated data channel.
pub(crate) struct WebRtcEndpoint {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    dc_open: watch::Sender<bool>,
}

impl WebRtcEndpoint {
    pub(crate) async fn new(
        config: &RtcConfig,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(config.to_rtc_configuration())
                .await?,
        );

        let tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EndpointEvent::NegotiationNeeded);
            })
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(EndpointEvent::Candidate(init));
                        }
                        Err(error) => debug!(%error, "failed to encode ice candidate"),
                    }
                }
            })
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EndpointEvent::IceState(state));
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EndpointEvent::PeerState(state));
            })
        }));

        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    negotiated: Some(DATA_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await?;

        let dc_open = watch::channel(false).0;
        let open_tx = dc_open.clone();
        dc.on_open(Box::new(move || {
            let open_tx = open_tx.clone();
            Box::pin(async move {
                let _ = open_tx.send(true);
            })
        }));

        let tx = events;
        dc.on_message(Box::new(move |message| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EndpointEvent::Data(message.data));
            })
        }));

        Ok(WebRtcEndpoint { pc, dc, dc_open })
    }
}

#[async_trait]
impl RtcEndpoint for WebRtcEndpoint {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        Ok(self.pc.create_offer(options).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, description: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_local_description(description).await?)
    }

    async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(description).await?)
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.pc.local_description().await
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        // The channel opens shortly after the connection does; hold writes
        // until then rather than failing them.
        let mut open = self.dc_open.subscribe();
        open.wait_for(|open| *open)
            .await
            .map_err(|_| Error::Closed)?;
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.dc.close().await;
        Ok(self.pc.close().await?)
    }
}
