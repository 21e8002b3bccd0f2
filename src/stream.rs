//! Message streams tied to a [`Connection`] lifecycle.
//!
//! [`network_stream`] wraps a raw duplex pair of channels so that nothing
//! flows in either direction until the connection reports ready, and so
//! that the connection is closed exactly once when both directions finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::{Error, Result};

const STREAM_BUFFER: usize = 64;

/// Raw transport side of a duplex message stream: what the transport
/// produces arrives on `inbound`, what it should emit goes to `outbound`.
pub struct StreamHalves<T> {
    pub inbound: mpsc::Receiver<T>,
    pub outbound: mpsc::Sender<T>,
}

/// Two stream ends wired back to back: whatever one side sends, the other
/// receives. Useful for loopback transports and tests.
pub fn bridge<T: Send + 'static>() -> (StreamHalves<T>, StreamHalves<T>) {
    let (a_tx, b_rx) = mpsc::channel(STREAM_BUFFER);
    let (b_tx, a_rx) = mpsc::channel(STREAM_BUFFER);
    (
        StreamHalves {
            inbound: a_rx,
            outbound: a_tx,
        },
        StreamHalves {
            inbound: b_rx,
            outbound: b_tx,
        },
    )
}

// Guards the underlying close so the completion watcher and explicit
// `close()` calls collapse into a single close of the connection.
struct CloseOnce {
    conn: Arc<dyn Connection>,
    done: AtomicBool,
}

impl CloseOnce {
    fn close(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.conn.close();
        }
    }
}

/// A duplex message stream gated on a [`Connection`].
///
/// Messages received before the connection is ready are held back;
/// messages sent before ready are buffered and flushed once it is.
pub struct NetworkStream<T> {
    conn: Arc<dyn Connection>,
    close: Arc<CloseOnce>,
    inbound: mpsc::Receiver<T>,
    outbound: mpsc::Sender<T>,
}

impl<T: Send + 'static> NetworkStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.inbound.recv().await
    }

    pub async fn send(&self, message: T) -> Result<()> {
        self.outbound.send(message).await.map_err(|_| Error::Closed)
    }

    /// A cloneable handle for the outbound direction.
    pub fn sender(&self) -> mpsc::Sender<T> {
        self.outbound.clone()
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }
}

#[async_trait]
impl<T: Send + 'static> Connection for NetworkStream<T> {
    async fn ready(&self) -> Result<()> {
        self.conn.ready().await
    }

    async fn closed(&self) {
        self.conn.closed().await;
    }

    fn close(&self) {
        self.close.close();
    }
}

/// Entwine a connection with its raw transport channels.
///
/// Both pump directions wait for `ready` before moving anything. Once both
/// have completed, normally or by error, the connection is closed through
/// a shared idempotency guard.
pub fn network_stream<T: Send + 'static>(
    conn: Arc<dyn Connection>,
    raw: StreamHalves<T>,
) -> NetworkStream<T> {
    let StreamHalves {
        inbound: mut raw_in,
        outbound: raw_out,
    } = raw;

    let (in_tx, in_rx) = mpsc::channel(STREAM_BUFFER);
    let (out_tx, mut out_rx) = mpsc::channel::<T>(STREAM_BUFFER);

    let read_conn = conn.clone();
    let read_half = tokio::spawn(async move {
        if read_conn.ready().await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                message = raw_in.recv() => match message {
                    Some(message) => {
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = read_conn.closed() => break,
            }
        }
    });

    let write_conn = conn.clone();
    let write_half = tokio::spawn(async move {
        if write_conn.ready().await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                message = out_rx.recv() => match message {
                    Some(message) => {
                        if raw_out.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = write_conn.closed() => break,
            }
        }
    });

    let close = Arc::new(CloseOnce {
        conn: conn.clone(),
        done: AtomicBool::new(false),
    });
    let closer = close.clone();
    tokio::spawn(async move {
        let _ = read_half.await;
        let _ = write_half.await;
        closer.close();
    });

    NetworkStream {
        conn,
        close,
        inbound: in_rx,
        outbound: out_tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, Lifecycle};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    struct TestConn {
        lifecycle: Lifecycle,
        closes: AtomicUsize,
    }

    impl TestConn {
        fn new(connected: bool) -> Arc<Self> {
            let lifecycle = Lifecycle::new();
            if connected {
                lifecycle.set_state(ConnectionState::Connected);
            }
            Arc::new(Self {
                lifecycle,
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Connection for TestConn {
        async fn ready(&self) -> Result<()> {
            self.lifecycle.connected().await
        }

        async fn closed(&self) {
            self.lifecycle.wait_closed().await;
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.lifecycle.mark_closed();
        }
    }

    #[tokio::test]
    async fn nothing_flows_before_ready() {
        let conn = TestConn::new(false);
        let (near, mut far) = bridge::<u32>();
        let mut stream = network_stream(conn.clone(), near);

        far.outbound.send(7).await.unwrap();
        stream.send(8).await.unwrap();

        assert!(timeout(Duration::from_millis(100), stream.recv())
            .await
            .is_err());
        assert!(timeout(Duration::from_millis(100), far.inbound.recv())
            .await
            .is_err());

        conn.lifecycle.set_state(ConnectionState::Connected);
        assert_eq!(
            timeout(Duration::from_secs(1), stream.recv()).await.unwrap(),
            Some(7)
        );
        assert_eq!(
            timeout(Duration::from_secs(1), far.inbound.recv())
                .await
                .unwrap(),
            Some(8)
        );
    }

    #[tokio::test]
    async fn completing_both_halves_closes_the_connection_once() {
        let conn = TestConn::new(true);
        let (near, far) = bridge::<u32>();
        let stream = network_stream(conn.clone(), near);

        // Ending the transport side completes the read half; dropping the
        // exposed stream completes the write half.
        drop(far);
        drop(stream);

        timeout(Duration::from_secs(1), conn.lifecycle.wait_closed())
            .await
            .unwrap();
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_during_send_closes_the_connection() {
        let conn = TestConn::new(true);
        let (near, far) = bridge::<u32>();
        let stream = network_stream(conn.clone(), near);

        // Both raw halves gone: reads end immediately, the next write errors.
        drop(far);
        let _ = stream.send(1).await;

        timeout(Duration::from_secs(1), conn.lifecycle.wait_closed())
            .await
            .unwrap();
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_close_is_idempotent() {
        let conn = TestConn::new(true);
        let (near, _far) = bridge::<u32>();
        let stream = network_stream(conn.clone(), near);

        stream.close();
        stream.close();
        stream.close();

        timeout(Duration::from_secs(1), conn.lifecycle.wait_closed())
            .await
            .unwrap();
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    }
}
