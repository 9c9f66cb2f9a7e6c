//! In-memory loopback transport
//!
//! A crossed channel pair standing in for a physical link; used by the
//! test suite and by in-process wiring.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{BusTransport, TransportError};

/// One end of an in-memory link.
pub struct LoopbackLink {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

/// Create a connected pair of loopback links.
///
/// Chunks written to one end arrive at the other, in order, with the
/// given channel capacity.
pub fn loopback_pair(capacity: usize) -> (LoopbackLink, LoopbackLink) {
    let (tx_a, rx_a) = mpsc::channel(capacity);
    let (tx_b, rx_b) = mpsc::channel(capacity);
    (
        LoopbackLink {
            tx: tx_a,
            rx: tokio::sync::Mutex::new(rx_b),
        },
        LoopbackLink {
            tx: tx_b,
            rx: tokio::sync::Mutex::new(rx_a),
        },
    )
}

#[async_trait]
impl BusTransport for LoopbackLink {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(Bytes::copy_from_slice(bytes))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_pair() {
        let (a, b) = loopback_pair(4);
        a.send(b"ping").await.unwrap();
        assert_eq!(&b.recv().await.unwrap()[..], b"ping");
        b.send(b"pong").await.unwrap();
        assert_eq!(&a.recv().await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn test_closed_peer() {
        let (a, b) = loopback_pair(4);
        drop(b);
        assert!(matches!(
            a.send(b"x").await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(a.recv().await, Err(TransportError::Closed)));
    }
}
