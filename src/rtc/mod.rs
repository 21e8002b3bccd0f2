//! WebRTC peer connections and the signaling that establishes them.

mod endpoint;
pub mod memory;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod signaler;
pub mod types;

pub use memory::SignalBus;
pub use peer::Peer;
pub use protocol::{client, server};
pub use relay::RelayConfig;
pub use signaler::Signaler;
pub use types::{AddressableSignal, IceServer, PeerId, RtcConfig, Signal};
