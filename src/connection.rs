//! Connection lifecycle contract shared by every transport.
//!
//! A [`Connection`] purposefully carries no information about *why* it
//! closed. Close-reason reporting (close codes, error text) is each
//! transport's own concern; consumers only ever observe the lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Connectivity of a transport that may not currently be usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Uniform interface for managing network connections.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Resolves when the connection successfully opens.
    /// Fails with [`Error::Closed`] if it closes first.
    async fn ready(&self) -> Result<()>;

    /// Resolves once the underlying transport has fully shut down,
    /// whether shutdown was local or remote. The event fires exactly once.
    async fn closed(&self);

    /// Initiates a close. Idempotent and callable any number of times,
    /// including before `ready` resolves.
    fn close(&self);
}

/// Watch-backed lifecycle bookkeeping shared by the transport
/// implementations in this crate.
///
/// Splits teardown in two: [`Lifecycle::request_close`] records the intent
/// (and wakes whoever drives the transport), [`Lifecycle::mark_closed`]
/// records the fact. Both are idempotent, so `close()` can be called any
/// number of times while `closed` still settles exactly once.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    state: watch::Sender<ConnectionState>,
    close_requested: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: watch::channel(ConnectionState::Disconnected).0,
                close_requested: watch::channel(false).0,
                closed: watch::channel(false).0,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Transition the connectivity state. Observers are only notified when
    /// the new state differs from the old.
    pub fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Returns immediately if already [`ConnectionState::Connected`],
    /// otherwise suspends until the next transition to it.
    pub async fn connected(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::Closed);
        }
        tokio::select! {
            res = state.wait_for(|s| *s == ConnectionState::Connected) => {
                res.map(|_| ()).map_err(|_| Error::Closed)
            }
            _ = closed.wait_for(|c| *c) => Err(Error::Closed),
        }
    }

    pub fn request_close(&self) {
        self.inner.close_requested.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        });
    }

    pub fn is_close_requested(&self) -> bool {
        *self.inner.close_requested.borrow()
    }

    pub async fn close_requested(&self) {
        let mut rx = self.inner.close_requested.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Record that the transport has fully shut down. Returns `true` only
    /// for the first caller; the state drops to `Disconnected` terminally.
    pub fn mark_closed(&self) -> bool {
        self.set_state(ConnectionState::Disconnected);
        self.inner.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
