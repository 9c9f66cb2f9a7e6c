//! Serial ⇄ message-bus gateway
//!
//! Relays every message between the serial bus and a message-bus
//! transport, in both directions, without re-broadcast loops: the
//! gateway's own bus-side identity must carry a configured prefix,
//! and inbound bus messages whose *origin* identity carries that
//! prefix are presumed to be our own (or a peer bridge's) echo and
//! are dropped.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::message::BusMessage;
use super::transport::{FramedLink, TransportError};

/// Gateway construction and relay errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The bus-side identity does not carry the configured prefix; a
    /// bridge that is not distinguishable by prefix cannot avoid
    /// echoing its own traffic.
    #[error("bus identity {id:?} does not start with prefix {prefix:?}")]
    PrefixMismatch {
        /// The offending identity.
        id: String,
        /// The configured prefix.
        prefix: String,
    },

    /// A transport failed fatally (closed, I/O error).
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Relay counters for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Messages relayed serial → bus.
    pub serial_to_bus: u64,
    /// Messages relayed bus → serial.
    pub bus_to_serial: u64,
    /// Bus messages dropped as our own echo.
    pub dropped_echo: u64,
    /// Per-message serial write failures (loop continued).
    pub write_errors: u64,
}

/// The message-bus side of a gateway.
///
/// Connection setup is the embedder's concern; the gateway only needs
/// an identity, a publish path, and a receive path that reports each
/// message's origin identity.
#[async_trait]
pub trait BusPort: Send + Sync {
    /// This port's own identity on the message bus.
    fn origin_id(&self) -> &str;

    /// Publish one message under our identity.
    async fn publish(&self, msg: &BusMessage) -> Result<(), TransportError>;

    /// Receive the next message and the identity it originated from.
    async fn recv(&self) -> Result<(String, BusMessage), TransportError>;
}

/// Loop-safe bidirectional bridge between a framed serial link and a
/// message bus.
pub struct Gateway {
    serial: FramedLink,
    port: Box<dyn BusPort>,
    prefix: String,
    stats: Mutex<GatewayStats>,
}

impl Gateway {
    /// Create a gateway.
    ///
    /// Fails unless the bus port's own identity starts with `prefix`.
    pub fn new(
        serial: FramedLink,
        port: Box<dyn BusPort>,
        prefix: &str,
    ) -> Result<Self, GatewayError> {
        if !port.origin_id().starts_with(prefix) {
            return Err(GatewayError::PrefixMismatch {
                id: port.origin_id().to_string(),
                prefix: prefix.to_string(),
            });
        }
        Ok(Self {
            serial,
            port,
            prefix: prefix.to_string(),
            stats: Mutex::new(GatewayStats::default()),
        })
    }

    /// Read the relay counters.
    pub fn stats(&self) -> GatewayStats {
        *self.stats.lock()
    }

    /// Reset the relay counters, returning the previous values.
    pub fn reset_stats(&self) -> GatewayStats {
        std::mem::take(&mut *self.stats.lock())
    }

    /// Run both relay directions until the token is cancelled or a
    /// transport fails fatally.
    ///
    /// Cancellation unwinds both loops before returning; a failure in
    /// one direction tears down the other.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            r = async {
                tokio::try_join!(self.serial_to_bus(), self.bus_to_serial()).map(|_| ())
            } => r,
        }
    }

    /// serial → bus: unconditional forward.
    async fn serial_to_bus(&self) -> Result<(), GatewayError> {
        loop {
            let frame = self.serial.recv_frame().await?;
            match BusMessage::decode(&frame) {
                Ok(msg) => {
                    self.port.publish(&msg).await?;
                    self.stats.lock().serial_to_bus += 1;
                }
                Err(e) => {
                    tracing::warn!("undecodable serial frame ({e}): {}", hex::encode(&frame));
                }
            }
        }
    }

    /// bus → serial: drop our own echoes, survive bad messages.
    async fn bus_to_serial(&self) -> Result<(), GatewayError> {
        loop {
            let (origin, msg) = self.port.recv().await?;
            if origin.starts_with(&self.prefix) {
                tracing::debug!(%origin, "dropping echoed bus message");
                self.stats.lock().dropped_echo += 1;
                continue;
            }
            match self.serial.send_frame(&msg.encode(), 0).await {
                Ok(()) => self.stats.lock().bus_to_serial += 1,
                Err(e @ TransportError::Frame(_)) => {
                    // one bad message must not kill the bridge
                    tracing::warn!("serial write failed ({e}) for message: {msg}");
                    self.stats.lock().write_errors += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("prefix", &self.prefix)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// In-memory [`BusPort`] pair, standing in for a shared broker topic.
///
/// Messages published on one end arrive on the other tagged with the
/// publisher's identity; [`publish_as`](MemBusPort::publish_as) lets
/// tests and in-process peers emulate additional bus clients.
pub struct MemBusPort {
    origin: String,
    tx: mpsc::Sender<(String, BusMessage)>,
    rx: tokio::sync::Mutex<mpsc::Receiver<(String, BusMessage)>>,
}

/// Create a connected pair of in-memory bus ports.
pub fn mem_bus_pair(origin_a: &str, origin_b: &str, capacity: usize) -> (MemBusPort, MemBusPort) {
    let (tx_a, rx_a) = mpsc::channel(capacity);
    let (tx_b, rx_b) = mpsc::channel(capacity);
    (
        MemBusPort {
            origin: origin_a.to_string(),
            tx: tx_a,
            rx: tokio::sync::Mutex::new(rx_b),
        },
        MemBusPort {
            origin: origin_b.to_string(),
            tx: tx_b,
            rx: tokio::sync::Mutex::new(rx_a),
        },
    )
}

impl MemBusPort {
    /// Publish under an arbitrary origin identity.
    pub async fn publish_as(&self, origin: &str, msg: &BusMessage) -> Result<(), TransportError> {
        self.tx
            .send((origin.to_string(), msg.clone()))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl BusPort for MemBusPort {
    fn origin_id(&self) -> &str {
        &self.origin
    }

    async fn publish(&self, msg: &BusMessage) -> Result<(), TransportError> {
        let origin = self.origin.clone();
        self.tx
            .send((origin, msg.clone()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<(String, BusMessage), TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}
