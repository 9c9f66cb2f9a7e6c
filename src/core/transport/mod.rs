//! Transport layer for the serial bus
//!
//! [`BusTransport`] is the raw chunk boundary: implementations move
//! opaque byte chunks and know nothing about framing. [`FramedLink`]
//! layers the [`Framer`](crate::core::framer::Framer) on top of any
//! chunk transport, serializing whole-frame writes so a multi-byte
//! frame is never interleaved with another frame on the same link.

mod loopback;
mod serial;

pub use loopback::{loopback_pair, LoopbackLink};
pub use serial::{SerialLink, SerialLinkConfig};

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::timeout;

use super::framer::{FrameCounters, FrameError, Framer};

/// Transport error types.
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O error from the underlying device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer or device is gone.
    #[error("transport closed")]
    Closed,

    /// The payload cannot be represented on the serial framing.
    #[error("unframeable payload: {0}")]
    Frame(#[from] FrameError),
}

/// Raw chunk transport; single reader per link.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Write one chunk of bytes.
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read the next available chunk; pends until data arrives.
    async fn recv(&self) -> Result<Bytes, TransportError>;
}

struct FramedState {
    framer: Framer,
    pending: VecDeque<u8>,
}

/// Whole-frame view of a chunk transport.
pub struct FramedLink {
    inner: Box<dyn BusTransport>,
    state: tokio::sync::Mutex<FramedState>,
    // serializes framed writes on this link
    tx_lock: tokio::sync::Mutex<()>,
    idle_timeout: Duration,
}

impl FramedLink {
    /// Wrap a chunk transport with the given idle-flush window.
    pub fn new(inner: Box<dyn BusTransport>, idle_timeout: Duration) -> Self {
        Self {
            inner,
            state: tokio::sync::Mutex::new(FramedState {
                framer: Framer::new(idle_timeout),
                pending: VecDeque::new(),
            }),
            tx_lock: tokio::sync::Mutex::new(()),
            idle_timeout,
        }
    }

    /// Frame and write one payload.
    pub async fn send_frame(&self, payload: &[u8], prio: u8) -> Result<(), TransportError> {
        let wire = Framer::encode(payload, prio)?;
        let _tx = self.tx_lock.lock().await;
        self.inner.send(&wire).await
    }

    /// Write a bare link ACK.
    pub async fn send_ack(&self) -> Result<(), TransportError> {
        let _tx = self.tx_lock.lock().await;
        self.inner.send(&Framer::encode_ack()).await
    }

    /// Read the next complete frame, flushing partial frames when the
    /// line goes idle.
    pub async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        let mut st = self.state.lock().await;
        loop {
            while let Some(b) = st.pending.pop_front() {
                if let Some(frame) = st.framer.feed(b) {
                    return Ok(frame);
                }
            }
            match timeout(self.idle_timeout, self.inner.recv()).await {
                Ok(Ok(chunk)) => st.pending.extend(chunk),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    if let Some(frame) = st.framer.read() {
                        return Ok(frame);
                    }
                }
            }
        }
    }

    /// Receive-side health counters.
    pub async fn counters(&self) -> FrameCounters {
        self.state.lock().await.framer.counters()
    }

    /// Reset the health counters, returning the previous values.
    pub async fn reset_counters(&self) -> FrameCounters {
        self.state.lock().await.framer.reset_counters()
    }
}
