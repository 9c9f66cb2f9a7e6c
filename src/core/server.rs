//! Bus coordinator
//!
//! The [`Server`] owns the participant registry, allocates client
//! addresses, frames and sends outbound messages, and routes inbound
//! frames to control handlers or device handlers. All registry
//! mutation goes through the coordinator's interface; other tasks
//! never touch the maps directly.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::dispatch::{Dispatcher, HandlerError, OpcodeHandler};
use super::framer::FrameCounters;
use super::message::{BusMessage, BROADCAST};
use super::participant::{Participant, SerialId};
use super::transport::{BusTransport, FramedLink, TransportError};

/// `code` value reserved for control traffic.
pub const CODE_CONTROL: u8 = 0;

/// Lowest assignable client address.
pub const MIN_CLIENT_ID: u8 = 1;

/// Highest assignable client address.
pub const MAX_CLIENT_ID: u8 = 126;

/// Control opcodes (top 3 bits of the first control payload byte).
pub mod op {
    /// Address assignment: request, accept, reject.
    pub const ADDR: u8 = 0;
    /// Poll window announcement.
    pub const POLL: u8 = 1;
}

// Address-request flags byte.
const FLAG_POLLED: u8 = 0x20;
// Reject reason: address space exhausted.
const AA_REJECT_NO_FREE: u8 = 0x10;

/// Coordinator errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// All client addresses are in use.
    #[error("no free client address")]
    NoFreeId,

    /// The transport rejected a write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How broadcast messages reach participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastPolicy {
    /// Deliver to every attached participant.
    #[default]
    All,
    /// Deliver only to participants whose poll bit was observed.
    PolledOnly,
    /// Do not deliver broadcasts locally.
    Ignore,
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The coordinator's own bus address.
    pub server_id: u8,
    /// Broadcast delivery policy.
    pub broadcast: BroadcastPolicy,
    /// Idle window for partial-frame flushing, in milliseconds.
    pub idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            broadcast: BroadcastPolicy::All,
            idle_timeout_ms: 100,
        }
    }
}

struct Registry {
    by_serial: HashMap<SerialId, Arc<Participant>>,
    by_id: HashMap<u8, Arc<Participant>>,
    next_id: u8,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            by_serial: HashMap::new(),
            by_id: HashMap::new(),
            next_id: MIN_CLIENT_ID,
        }
    }
}

impl Registry {
    fn free_id(&mut self) -> Result<u8, ServerError> {
        let start = self.next_id;
        loop {
            let cid = self.next_id;
            self.next_id = if self.next_id >= MAX_CLIENT_ID {
                MIN_CLIENT_ID
            } else {
                self.next_id + 1
            };
            if !self.by_id.contains_key(&cid) {
                return Ok(cid);
            }
            if self.next_id == start {
                return Err(ServerError::NoFreeId);
            }
        }
    }
}

pub(crate) struct ServerInner {
    id: u8,
    broadcast: BroadcastPolicy,
    link: FramedLink,
    registry: Mutex<Registry>,
    control: Dispatcher,
    self_weak: Weak<ServerInner>,
}

/// The bus coordinator.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a coordinator over a chunk transport.
    pub fn new(transport: Box<dyn BusTransport>, config: &ServerConfig) -> Self {
        let idle = Duration::from_millis(config.idle_timeout_ms);
        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let control = Dispatcher::new()
                .with(op::ADDR, Arc::new(AddrHandler(weak.clone())))
                .with(op::POLL, Arc::new(PollHandler(weak.clone())));
            ServerInner {
                id: config.server_id,
                broadcast: config.broadcast,
                link: FramedLink::new(transport, idle),
                registry: Mutex::new(Registry::default()),
                control,
                self_weak: weak.clone(),
            }
        });
        Self { inner }
    }

    /// The coordinator's bus address.
    pub fn id(&self) -> u8 {
        self.inner.id
    }

    /// Register a participant by serial id.
    ///
    /// Any previous coordinator is detached first; a participant has
    /// at most one active attachment.
    pub fn attach(&self, participant: &Arc<Participant>) {
        self.inner.attach_inner(participant);
    }

    /// Detach a participant. Idempotent.
    pub fn detach(&self, participant: &Arc<Participant>) {
        participant.detach();
    }

    /// Allocate and store the next free client address, firing the
    /// participant's readiness signal.
    ///
    /// Assigning an already-addressed participant is an idempotent
    /// no-op returning the existing address. Attaches the participant
    /// first if needed. Does not communicate with the device; the
    /// `on_address_assigned` hook runs on a separate task.
    pub fn assign_address(&self, participant: &Arc<Participant>) -> Result<u8, ServerError> {
        self.inner.assign(participant)
    }

    /// Look up the participant for a serial id, creating and
    /// attaching one if the device is unknown.
    pub fn with_serial(&self, serial: &SerialId) -> Arc<Participant> {
        self.inner.with_serial(serial)
    }

    /// Look up a participant by serial id.
    pub fn participant(&self, serial: &SerialId) -> Option<Arc<Participant>> {
        self.inner.registry.lock().by_serial.get(serial).cloned()
    }

    /// Look up a participant by client address.
    pub fn participant_by_id(&self, client_id: u8) -> Option<Arc<Participant>> {
        self.inner.participant_by_id(client_id)
    }

    /// Serialize, frame, and write one message.
    pub async fn send(
        &self,
        src: u8,
        dst: u8,
        code: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.inner
            .send_msg(&BusMessage::new(src, dst, code, Bytes::copy_from_slice(data)))
            .await
    }

    /// Decode a frame payload and route it.
    pub async fn dispatch(&self, payload: &[u8]) {
        self.inner.dispatch(payload).await;
    }

    /// Replace a participant's activity deadline with `now + window`.
    ///
    /// The new deadline replaces the old one outright; windows never
    /// stack.
    pub fn poll_start(&self, participant: &Arc<Participant>, window: Duration) {
        self.inner.poll_start(participant, window);
    }

    /// Receive-side framing health counters.
    pub async fn counters(&self) -> FrameCounters {
        self.inner.link.counters().await
    }

    /// Reset the framing health counters, returning the old values.
    pub async fn reset_counters(&self) -> FrameCounters {
        self.inner.link.reset_counters().await
    }

    /// Drive the inbound side: read frames and route them until the
    /// token is cancelled or the transport fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = self.inner.link.recv_frame() => {
                    match frame {
                        Ok(payload) => self.inner.dispatch(&payload).await,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

impl ServerInner {
    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    pub(crate) async fn send_msg(&self, msg: &BusMessage) -> Result<(), TransportError> {
        self.link.send_frame(&msg.encode(), 0).await
    }

    fn attach_inner(&self, p: &Arc<Participant>) {
        p.detach();
        p.bind(self.self_weak.clone());
        self.registry
            .lock()
            .by_serial
            .insert(p.serial().clone(), p.clone());
        tracing::debug!(serial = %p.serial(), "participant attached");
    }

    fn with_serial(&self, serial: &SerialId) -> Arc<Participant> {
        if let Some(p) = self.registry.lock().by_serial.get(serial) {
            return p.clone();
        }
        let p = Participant::new(serial.clone());
        self.attach_inner(&p);
        p
    }

    fn participant_by_id(&self, client_id: u8) -> Option<Arc<Participant>> {
        self.registry.lock().by_id.get(&client_id).cloned()
    }

    fn assign(&self, p: &Arc<Participant>) -> Result<u8, ServerError> {
        if !p.is_bound_to(&self.self_weak) {
            self.attach_inner(p);
        }
        if let Some(id) = p.client_id() {
            return Ok(id);
        }
        let id = {
            let mut reg = self.registry.lock();
            let id = reg.free_id()?;
            reg.by_id.insert(id, p.clone());
            id
        };
        p.set_client_id(id);
        p.mark_ready();
        let handler = p.handler();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move { handler.on_address_assigned().await });
        }
        tracing::info!(serial = %p.serial(), client_id = id, "address assigned");
        Ok(id)
    }

    pub(crate) fn deregister(&self, p: &Arc<Participant>) {
        {
            let mut reg = self.registry.lock();
            reg.by_serial.remove(p.serial());
            if let Some(id) = p.client_id() {
                if reg.by_id.get(&id).is_some_and(|q| Arc::ptr_eq(q, p)) {
                    reg.by_id.remove(&id);
                }
            }
        }
        p.clear_attachment();
        tracing::debug!(serial = %p.serial(), "participant detached");
    }

    fn poll_start(&self, p: &Arc<Participant>, window: Duration) {
        p.set_working_until(Some(Instant::now() + window));
        let handler = p.handler();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move { handler.on_poll(window).await });
        }
    }

    pub(crate) async fn dispatch(&self, payload: &[u8]) {
        let msg = match BusMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("undecodable frame ({e}): {}", hex::encode(payload));
                return;
            }
        };

        if msg.code == CODE_CONTROL {
            if let Err(e) = self.control.dispatch(msg).await {
                tracing::warn!("control handler failed: {e}");
            }
            return;
        }

        if msg.is_broadcast() {
            self.deliver_broadcast(&msg).await;
        } else if msg.dst == self.id {
            tracing::debug!("non-control message for coordinator dropped: {msg}");
        } else if let Some(p) = self.participant_by_id(msg.dst) {
            p.handler().on_message(msg.code, false, msg.data.clone()).await;
        } else {
            tracing::warn!(dst = msg.dst, "dropping message for unknown destination: {msg}");
        }
    }

    async fn deliver_broadcast(&self, msg: &BusMessage) {
        if self.broadcast == BroadcastPolicy::Ignore {
            return;
        }
        let targets: Vec<Arc<Participant>> =
            self.registry.lock().by_serial.values().cloned().collect();
        for p in targets {
            if p.client_id() == Some(msg.src) {
                continue; // don't echo a broadcast back to its sender
            }
            if self.broadcast == BroadcastPolicy::PolledOnly && !p.polled() {
                continue;
            }
            p.handler().on_message(msg.code, true, msg.data.clone()).await;
        }
    }
}

/// Address-assignment control handler.
///
/// Request payload: `(ADDR<<5) | serial_len-1`, serial bytes, flags
/// byte (`0x20` = device wants polling). Accept replies carry the
/// serial back to the new address; rejects go to broadcast with a
/// reason byte.
struct AddrHandler(Weak<ServerInner>);

#[async_trait]
impl OpcodeHandler for AddrHandler {
    async fn handle(&self, msg: BusMessage) -> Result<Option<Bytes>, HandlerError> {
        let Some(server) = self.0.upgrade() else {
            return Ok(None);
        };
        let d = &msg.data;
        let ls = ((d[0] & 0x0F) as usize) + 1;
        if d.len() < ls + 2 {
            tracing::warn!("short address request: {msg}");
            return Ok(None);
        }
        let serial = SerialId::from(&d[1..1 + ls]);
        let flags = d[1 + ls];

        let p = server.with_serial(&serial);
        p.set_polled(flags & FLAG_POLLED != 0);
        let known = p.client_id().is_some();

        let mut reply = Vec::with_capacity(2 + ls);
        reply.push((op::ADDR << 5) | (ls - 1) as u8);
        reply.extend_from_slice(serial.as_bytes());

        match server.assign(&p) {
            Ok(cid) => {
                if known {
                    tracing::info!(serial = %serial, client_id = cid, "device re-announced");
                }
                server
                    .send_msg(&BusMessage::new(server.id(), cid, CODE_CONTROL, reply))
                    .await
                    .map_err(|e| HandlerError(e.to_string()))?;
            }
            Err(ServerError::NoFreeId) => {
                tracing::warn!(serial = %serial, "address space exhausted, rejecting");
                reply.push(AA_REJECT_NO_FREE);
                server
                    .send_msg(&BusMessage::new(server.id(), BROADCAST, CODE_CONTROL, reply))
                    .await
                    .map_err(|e| HandlerError(e.to_string()))?;
            }
            Err(e) => return Err(HandlerError(e.to_string())),
        }
        Ok(None)
    }
}

/// Poll control handler.
///
/// Payload: `(POLL<<5) | tl` where `tl` is a signed 4-bit exponent;
/// the device stays awake for `2^tl` seconds. A new poll replaces the
/// previous window.
struct PollHandler(Weak<ServerInner>);

#[async_trait]
impl OpcodeHandler for PollHandler {
    async fn handle(&self, msg: BusMessage) -> Result<Option<Bytes>, HandlerError> {
        let Some(server) = self.0.upgrade() else {
            return Ok(None);
        };
        let Some(p) = server.participant_by_id(msg.src) else {
            tracing::warn!(src = msg.src, "poll from unknown participant");
            return Ok(None);
        };
        if !p.polled() {
            tracing::warn!(src = msg.src, "poll from participant without poll flag");
            p.set_polled(true);
        }
        let tl = {
            let raw = (msg.data[0] & 0x0F) as i32;
            if raw & 0x8 != 0 {
                raw | !0xF
            } else {
                raw
            }
        };
        let window = Duration::from_secs_f64(2f64.powi(tl));
        server.poll_start(&p, window);
        Ok(None)
    }
}
