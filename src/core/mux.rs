//! Command multiplexer
//!
//! Lets either side of a shared frame link issue a call and receive
//! exactly one correlated reply, while unsolicited inbound calls are
//! routed through a [`Dispatcher`]. Correlation is by channel id, and
//! each channel is single-flight: a second call while one is pending
//! is a programming error and fails immediately rather than queuing.
//!
//! Mux frames ride inside the ordinary serial framing:
//!
//! ```text
//! kind (1) | channel (2, big-endian) | data…
//! ```
//!
//! Call data carries its opcode in the top 3 bits of the first byte,
//! the same layout control messages use, so a handler can itself host
//! a nested [`Dispatcher`] over its payload at any depth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::dispatch::Dispatcher;
use super::message::BusMessage;
use super::transport::{FramedLink, TransportError};

/// Default bound on a correlated call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures of a correlated call.
#[derive(Error, Debug)]
pub enum CallError {
    /// A call is already pending on this channel; concurrent calls
    /// must use distinct channels.
    #[error("call already pending on channel {0}")]
    Busy(u16),

    /// No reply arrived within the call bound.
    #[error("call timed out")]
    Timeout,

    /// The remote handler reported a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// The multiplexer shut down while the call was pending.
    #[error("multiplexer closed")]
    Closed,

    /// The link rejected the outbound call.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

mod kind {
    pub const CALL: u8 = 1;
    pub const REPLY: u8 = 2;
    pub const ERROR: u8 = 3;
}

struct MuxFrame {
    kind: u8,
    channel: u16,
    data: Bytes,
}

impl MuxFrame {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.data.len());
        out.push(self.kind);
        out.extend_from_slice(&self.channel.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 3 {
            return None;
        }
        Some(Self {
            kind: payload[0],
            channel: u16::from_be_bytes([payload[1], payload[2]]),
            data: Bytes::copy_from_slice(&payload[3..]),
        })
    }
}

type ReplySlot = oneshot::Sender<Result<Bytes, CallError>>;

struct Shared {
    link: FramedLink,
    pending: Mutex<HashMap<u16, ReplySlot>>,
    dispatcher: Dispatcher,
    call_timeout: Duration,
}

/// Correlated call/reply multiplexer over one frame link.
#[derive(Clone)]
pub struct CommandMux {
    shared: Arc<Shared>,
}

impl CommandMux {
    /// Create a multiplexer with the default call bound.
    pub fn new(link: FramedLink, dispatcher: Dispatcher) -> Self {
        Self::with_timeout(link, dispatcher, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a multiplexer with an explicit call bound.
    pub fn with_timeout(link: FramedLink, dispatcher: Dispatcher, call_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                link,
                pending: Mutex::new(HashMap::new()),
                dispatcher,
                call_timeout,
            }),
        }
    }

    /// Issue a call and suspend until its reply or the call bound.
    ///
    /// The opcode lands in the top 3 bits of the first data byte;
    /// `args` follow. Fails immediately with [`CallError::Busy`] if a
    /// call is already pending on `channel`.
    pub async fn call(&self, channel: u16, opcode: u8, args: &[u8]) -> Result<Bytes, CallError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.contains_key(&channel) {
                return Err(CallError::Busy(channel));
            }
            pending.insert(channel, tx);
        }

        let mut data = Vec::with_capacity(1 + args.len());
        data.push((opcode & 0x07) << 5);
        data.extend_from_slice(args);
        let frame = MuxFrame {
            kind: kind::CALL,
            channel,
            data: data.into(),
        };

        if let Err(e) = self.shared.link.send_frame(&frame.encode(), 0).await {
            self.shared.pending.lock().remove(&channel);
            return Err(e.into());
        }

        match timeout(self.shared.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&channel);
                Err(CallError::Timeout)
            }
        }
    }

    /// Drive the inbound side: decode frames, settle replies, and
    /// dispatch unsolicited calls until cancelled or the link fails.
    ///
    /// On exit every pending call fails with [`CallError::Closed`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TransportError> {
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                frame = self.shared.link.recv_frame() => {
                    match frame {
                        Ok(payload) => self.shared.clone().handle_inbound(&payload),
                        Err(e) => break Err(e),
                    }
                }
            }
        };
        self.shared.fail_all_pending();
        result
    }
}

impl Shared {
    fn handle_inbound(self: Arc<Self>, payload: &[u8]) {
        let Some(frame) = MuxFrame::decode(payload) else {
            tracing::warn!("undecodable mux frame: {}", hex::encode(payload));
            return;
        };
        match frame.kind {
            kind::CALL => {
                // replies must not block the reader
                tokio::spawn(self.serve_call(frame.channel, frame.data));
            }
            kind::REPLY => self.settle(frame.channel, Ok(frame.data)),
            kind::ERROR => {
                let text = String::from_utf8_lossy(&frame.data).into_owned();
                self.settle(frame.channel, Err(CallError::Remote(text)));
            }
            other => {
                tracing::warn!(kind = other, "mux frame with unknown kind dropped");
            }
        }
    }

    async fn serve_call(self: Arc<Self>, channel: u16, data: Bytes) {
        let msg = BusMessage::new(0, 0, 0, data);
        let reply = match self.dispatcher.dispatch(msg).await {
            Ok(data) => MuxFrame {
                kind: kind::REPLY,
                channel,
                data: data.unwrap_or_default(),
            },
            Err(e) => MuxFrame {
                kind: kind::ERROR,
                channel,
                data: Bytes::from(e.0.into_bytes()),
            },
        };
        if let Err(e) = self.link.send_frame(&reply.encode(), 0).await {
            tracing::warn!(channel, "failed to send mux reply: {e}");
        }
    }

    fn settle(&self, channel: u16, result: Result<Bytes, CallError>) {
        match self.pending.lock().remove(&channel) {
            // a send failure means the caller already timed out
            Some(tx) => drop(tx.send(result)),
            None => tracing::warn!(channel, "reply for idle channel dropped"),
        }
    }

    fn fail_all_pending(&self) {
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(CallError::Closed));
        }
    }
}
