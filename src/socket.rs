//! The transport seam. The plugin never touches a real WebSocket directly: it
//! talks to anything that can move whole binary frames in both directions and
//! close. The client-side connector (with its reconnection policy) and the
//! listener live outside the core and hand sockets in through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use crate::errors::PluginError;

/// A byte-message duplex socket carrying one BTP packet per frame.
#[async_trait]
pub trait BtpSocket: Send + Sync + 'static {
    /// Sends one frame, awaiting backpressure. Frames from one caller are
    /// delivered in call order.
    async fn send(&self, frame: Bytes) -> Result<(), PluginError>;

    /// Receives the next frame, or `None` once the socket is closed.
    async fn recv(&self) -> Option<Bytes>;

    async fn close(&self);
}

/// Client-side connector collaborator: dials the peer and yields a socket.
#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BtpSocket>, PluginError>;
}

/// In-process duplex socket pair. Closing either end closes both.
pub fn memory_pair() -> (Arc<MemorySocket>, Arc<MemorySocket>) {
    let (a_tx, b_rx) = mpsc::channel(32);
    let (b_tx, a_rx) = mpsc::channel(32);
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);
    let left = Arc::new(MemorySocket {
        tx: a_tx,
        rx: Mutex::new(a_rx),
        closed_tx: closed_tx.clone(),
        closed_rx: closed_rx.clone(),
    });
    let right = Arc::new(MemorySocket {
        tx: b_tx,
        rx: Mutex::new(b_rx),
        closed_tx,
        closed_rx,
    });
    (left, right)
}

pub struct MemorySocket {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl BtpSocket for MemorySocket {
    async fn send(&self, frame: Bytes) -> Result<(), PluginError> {
        if *self.closed_rx.borrow() {
            return Err(PluginError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| PluginError::ConnectionClosed)
    }

    async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        let mut closed = self.closed_rx.clone();
        loop {
            if *closed.borrow() {
                // drain frames that were in flight before the close
                return rx.try_recv().ok();
            }
            tokio::select! {
                frame = rx.recv() => return frame,
                changed = closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pair_in_order() {
        let (left, right) = memory_pair();
        left.send(Bytes::from_static(b"one")).await.unwrap();
        left.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(right.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn close_is_seen_on_both_ends() {
        let (left, right) = memory_pair();
        right.close().await;
        assert!(left.send(Bytes::from_static(b"x")).await.is_err());
        assert!(right.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_unblocks_on_close() {
        let (left, right) = memory_pair();
        let reader = tokio::spawn(async move { right.recv().await });
        tokio::task::yield_now().await;
        left.close().await;
        assert!(reader.await.unwrap().is_none());
    }
}
