//! Transport-agnostic signaling channel.
//!
//! A [`Signaler`] is an identity plus a lifecycle-gated stream of
//! [`AddressableSignal`]s. The protocol layer never cares whether the
//! stream is backed by a websocket relay, an in-memory bus or anything
//! else.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::Result;
use crate::stream::NetworkStream;
use crate::rtc::types::{AddressableSignal, PeerId};

pub struct Signaler {
    id: PeerId,
    stream: NetworkStream<AddressableSignal>,
}

impl Signaler {
    pub fn new(id: PeerId, stream: NetworkStream<AddressableSignal>) -> Self {
        Signaler { id, stream }
    }

    /// Our own identity on this signaling channel.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The next inbound signal, or `None` once the channel has ended.
    pub async fn recv(&mut self) -> Option<AddressableSignal> {
        self.stream.recv().await
    }

    pub async fn send(&self, message: AddressableSignal) -> Result<()> {
        self.stream.send(message).await
    }

    /// A cloneable outbound handle, for tasks that emit signals without
    /// owning the signaler.
    pub fn sender(&self) -> mpsc::Sender<AddressableSignal> {
        self.stream.sender()
    }
}

#[async_trait]
impl Connection for Signaler {
    async fn ready(&self) -> Result<()> {
        self.stream.ready().await
    }

    async fn closed(&self) {
        self.stream.closed().await;
    }

    fn close(&self) {
        self.stream.close();
    }
}
