//! Opcode classification and handler routing
//!
//! Control-style payloads reserve the top 3 bits of their first byte
//! as an opcode selecting a sub-handler; the remaining 5 bits and any
//! following bytes belong to that handler. Classification is a pure
//! function; the routing table is owned by whichever layer configures
//! it (the server's control plane, the command multiplexer, or a
//! nested handler).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::message::BusMessage;

/// Number of distinct opcodes (3 bits).
pub const OPCODE_SLOTS: usize = 8;

/// Extract the opcode from a payload: top 3 bits of the first byte.
///
/// Pure and total; an empty payload has no opcode and is not routed.
pub fn opcode(data: &[u8]) -> Option<u8> {
    data.first().map(|b| b >> 5)
}

/// Failure reported by a handler, relayed to the caller where the
/// context supports replies (the command multiplexer does).
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A handler bound to one opcode slot.
///
/// Returns an optional reply payload; contexts without a reply path
/// ignore it.
#[async_trait]
pub trait OpcodeHandler: Send + Sync {
    /// Process one routed message.
    async fn handle(&self, msg: BusMessage) -> Result<Option<Bytes>, HandlerError>;
}

/// Fixed opcode-to-handler table, built once by its owner.
#[derive(Default)]
pub struct Dispatcher {
    slots: [Option<Arc<dyn OpcodeHandler>>; OPCODE_SLOTS],
}

impl Dispatcher {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to an opcode. The opcode is masked to 3 bits.
    pub fn set(&mut self, op: u8, handler: Arc<dyn OpcodeHandler>) {
        self.slots[(op & 0x07) as usize] = Some(handler);
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, op: u8, handler: Arc<dyn OpcodeHandler>) -> Self {
        self.set(op, handler);
        self
    }

    /// Route a message to the handler its opcode selects.
    ///
    /// Messages with no opcode or an unbound opcode are dropped with a
    /// log entry; that is not an error for the sender.
    pub async fn dispatch(&self, msg: BusMessage) -> Result<Option<Bytes>, HandlerError> {
        let Some(op) = opcode(&msg.data) else {
            tracing::warn!("dropping message without opcode: {msg}");
            return Ok(None);
        };
        match &self.slots[op as usize] {
            Some(handler) => handler.handle(msg).await,
            None => {
                tracing::warn!(opcode = op, "dropping message with unbound opcode: {msg}");
                Ok(None)
            }
        }
    }
}

/// Adapter that carries an independent command protocol inside one
/// opcode slot: strips the leading byte and re-dispatches the rest
/// through an inner table. Nests to arbitrary depth.
pub struct Nested(pub Dispatcher);

#[async_trait]
impl OpcodeHandler for Nested {
    async fn handle(&self, msg: BusMessage) -> Result<Option<Bytes>, HandlerError> {
        let inner = BusMessage {
            data: msg.data.slice(1..),
            ..msg
        };
        self.0.dispatch(inner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder(AtomicU32);

    #[async_trait]
    impl OpcodeHandler for Recorder {
        async fn handle(&self, _msg: BusMessage) -> Result<Option<Bytes>, HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[test]
    fn test_opcode_extraction() {
        assert_eq!(opcode(&[]), None);
        assert_eq!(opcode(&[0x00]), Some(0));
        assert_eq!(opcode(&[0x3F]), Some(1));
        assert_eq!(opcode(&[0xE0]), Some(7));
    }

    #[tokio::test]
    async fn test_routing() {
        let rec = Arc::new(Recorder(AtomicU32::new(0)));
        let table = Dispatcher::new().with(2, rec.clone());

        // opcode 2 -> handled
        let msg = BusMessage::new(1, 0, 0, vec![2 << 5]);
        table.dispatch(msg).await.unwrap();
        assert_eq!(rec.0.load(Ordering::SeqCst), 1);

        // unbound opcode -> dropped, not an error
        let msg = BusMessage::new(1, 0, 0, vec![5 << 5]);
        assert!(table.dispatch(msg).await.unwrap().is_none());
        assert_eq!(rec.0.load(Ordering::SeqCst), 1);

        // empty payload -> no code, dropped
        let msg = BusMessage::new(1, 0, 0, Bytes::new());
        assert!(table.dispatch(msg).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nested_routing() {
        let rec = Arc::new(Recorder(AtomicU32::new(0)));
        let inner = Dispatcher::new().with(3, rec.clone());
        let table = Dispatcher::new().with(1, Arc::new(Nested(inner)));

        // outer opcode 1, inner opcode 3
        let msg = BusMessage::new(1, 0, 0, vec![1 << 5, 3 << 5, 0xAA]);
        table.dispatch(msg).await.unwrap();
        assert_eq!(rec.0.load(Ordering::SeqCst), 1);
    }
}
