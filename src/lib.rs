//! Peer-to-peer transport for the tabletop client.
//!
//! Layers, bottom up:
//! - [`connection`]: the lifecycle contract every transport satisfies
//! - [`stream`]: duplex message streams gated on a connection
//! - [`ws`]: a reconnecting websocket client
//! - [`rtc`]: perfectly negotiated WebRTC peers and the client/server
//!   signaling protocol that pairs them, over a pluggable [`Signaler`]

pub mod connection;
pub mod error;
pub mod rtc;
pub mod stream;
pub mod ws;

pub use connection::{Connection, ConnectionState};
pub use error::{Error, Result};
pub use rtc::{
    client, server, AddressableSignal, Peer, PeerId, RelayConfig, RtcConfig, Signal, SignalBus,
    Signaler,
};
pub use stream::{bridge, network_stream, NetworkStream, StreamHalves};
pub use ws::WsClient;
