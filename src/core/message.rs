//! Bus message envelope
//!
//! A [`BusMessage`] is the transport-independent unit of exchange: the
//! same structure crosses the serial bus and the message-bus side of a
//! gateway. Inside a serial frame it is carried as
//! `dst | src | code | data…`.

use bytes::Bytes;
use thiserror::Error;

/// Reserved destination address meaning "all participants".
pub const BROADCAST: u8 = 0xFF;

/// Errors decoding a frame payload into a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload is shorter than the three-byte envelope header.
    #[error("payload too short for a bus message: {0} bytes")]
    TooShort(usize),
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Sender participant id.
    pub src: u8,
    /// Destination participant id, or [`BROADCAST`].
    pub dst: u8,
    /// Operation selector.
    pub code: u8,
    /// Payload bytes; handler-defined layout.
    pub data: Bytes,
}

impl BusMessage {
    /// Create a new message.
    pub fn new(src: u8, dst: u8, code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            src,
            dst,
            code,
            data: data.into(),
        }
    }

    /// Whether this message is addressed to all participants.
    pub fn is_broadcast(&self) -> bool {
        self.dst == BROADCAST
    }

    /// Opcode from the top 3 bits of the first data byte, if any.
    pub fn opcode(&self) -> Option<u8> {
        super::dispatch::opcode(&self.data)
    }

    /// Serialize into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.data.len());
        out.push(self.dst);
        out.push(self.src);
        out.push(self.code);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < 3 {
            return Err(DecodeError::TooShort(payload.len()));
        }
        Ok(Self {
            dst: payload[0],
            src: payload[1],
            code: payload[2],
            data: Bytes::copy_from_slice(&payload[3..]),
        })
    }
}

impl std::fmt::Display for BusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{} code={} [{}]",
            self.src,
            self.dst,
            self.code,
            hex::encode(&self.data)
        )
    }
}
