//! Bus participants
//!
//! A [`Participant`] tracks one device on the bus: its fixed serial
//! identity, the client address the coordinator assigned (if any), its
//! activity window, and a single-shot readiness signal that fires when
//! an address arrives. Device-specific behavior plugs in through
//! [`DeviceHandler`].
//!
//! Participants hold only a weak reference to their coordinator; a
//! coordinator that has been dropped turns every send into a checked
//! [`SendError::NoServer`] rather than a dangling access.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use super::message::BusMessage;
use super::server::ServerInner;
use super::transport::TransportError;

/// Fixed-length device identity.
///
/// Converted from an integer when needed: big-endian, minimum-length
/// encoding (zero becomes a single zero byte).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SerialId(Bytes);

impl SerialId {
    /// Minimum-length big-endian encoding of an integer serial.
    pub fn from_u64(n: u64) -> Self {
        let len = ((64 - n.leading_zeros() as usize) + 7) / 8;
        let len = len.max(1);
        Self(Bytes::copy_from_slice(&n.to_be_bytes()[8 - len..]))
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the identity in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the identity is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<u64> for SerialId {
    fn from(n: u64) -> Self {
        Self::from_u64(n)
    }
}

impl From<&[u8]> for SerialId {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl From<Vec<u8>> for SerialId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl std::fmt::Debug for SerialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialId({})", hex::encode(&self.0))
    }
}

impl std::fmt::Display for SerialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Failures sending through a participant.
///
/// These are local contract violations, not transport faults; they
/// are never retried automatically.
#[derive(Error, Debug)]
pub enum SendError {
    /// The participant has no assigned client address yet.
    #[error("participant has no client address")]
    NoClient,

    /// The participant is not attached to a live coordinator.
    #[error("participant has no coordinator")]
    NoServer,

    /// The transport rejected the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Hooks device-specific code implements against the coordinator.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// A message addressed to this device (or broadcast) arrived.
    async fn on_message(&self, code: u8, broadcast: bool, data: Bytes);

    /// The coordinator assigned an address. Called off the assignment
    /// path; any device communication happens here, not during
    /// assignment.
    async fn on_address_assigned(&self) {}

    /// A poll message arrived; the device stays awake for `window`.
    async fn on_poll(&self, window: Duration) {
        let _ = window;
    }
}

/// Default handler that ignores all traffic.
pub struct NullDevice;

#[async_trait]
impl DeviceHandler for NullDevice {
    async fn on_message(&self, _code: u8, _broadcast: bool, _data: Bytes) {}
}

struct ParticipantState {
    server: Weak<ServerInner>,
    client_id: Option<u8>,
    working_until: Option<Instant>,
    polled: bool,
}

/// One device on the bus.
pub struct Participant {
    serial: SerialId,
    handler: Arc<dyn DeviceHandler>,
    state: Mutex<ParticipantState>,
    ready_tx: watch::Sender<bool>,
}

impl Participant {
    /// Create a detached participant with no device behavior.
    pub fn new(serial: impl Into<SerialId>) -> Arc<Self> {
        Self::with_handler(serial, Arc::new(NullDevice))
    }

    /// Create a detached participant with the given device hooks.
    pub fn with_handler(serial: impl Into<SerialId>, handler: Arc<dyn DeviceHandler>) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            serial: serial.into(),
            handler,
            state: Mutex::new(ParticipantState {
                server: Weak::new(),
                client_id: None,
                working_until: None,
                polled: false,
            }),
            ready_tx,
        })
    }

    /// The device's serial identity.
    pub fn serial(&self) -> &SerialId {
        &self.serial
    }

    /// The assigned client address, if any.
    pub fn client_id(&self) -> Option<u8> {
        self.state.lock().client_id
    }

    /// Whether the poll-request bit was observed for this device.
    pub fn polled(&self) -> bool {
        self.state.lock().polled
    }

    /// The current activity deadline, if one is set.
    pub fn working_until(&self) -> Option<Instant> {
        self.state.lock().working_until
    }

    /// Whether the device is inside its activity window.
    ///
    /// No deadline means always active; deadlines are checked against
    /// the monotonic clock.
    pub fn is_active(&self) -> bool {
        match self.state.lock().working_until {
            None => true,
            Some(deadline) => Instant::now() < deadline,
        }
    }

    /// Whether the readiness signal has fired for this attachment.
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Suspend until the coordinator assigns an address.
    ///
    /// Returns immediately if the signal already fired.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Send a message to the device.
    ///
    /// `src` defaults to the coordinator's id, `dst` to this device's
    /// client address. Fails fast if the participant has no live
    /// coordinator or no address.
    pub async fn send(
        &self,
        code: u8,
        data: &[u8],
        src: Option<u8>,
        dst: Option<u8>,
    ) -> Result<(), SendError> {
        let (server, client_id) = {
            let st = self.state.lock();
            (st.server.clone(), st.client_id)
        };
        let server = server.upgrade().ok_or(SendError::NoServer)?;
        let client_id = client_id.ok_or(SendError::NoClient)?;

        let msg = BusMessage::new(
            src.unwrap_or_else(|| server.id()),
            dst.unwrap_or(client_id),
            code,
            Bytes::copy_from_slice(data),
        );
        server.send_msg(&msg).await?;
        Ok(())
    }

    /// Detach from the coordinator.
    ///
    /// Idempotent: detaching an already-detached participant, or one
    /// whose coordinator is gone, is a no-op.
    pub fn detach(self: &Arc<Self>) {
        let server = {
            let mut st = self.state.lock();
            std::mem::replace(&mut st.server, Weak::new())
        };
        match server.upgrade() {
            Some(server) => server.deregister(self),
            None => self.clear_attachment(),
        }
    }

    pub(crate) fn handler(&self) -> Arc<dyn DeviceHandler> {
        self.handler.clone()
    }

    pub(crate) fn bind(&self, server: Weak<ServerInner>) {
        self.state.lock().server = server;
    }

    pub(crate) fn is_bound_to(&self, server: &Weak<ServerInner>) -> bool {
        Weak::ptr_eq(&self.state.lock().server, server)
    }

    pub(crate) fn set_client_id(&self, id: u8) {
        self.state.lock().client_id = Some(id);
    }

    pub(crate) fn set_polled(&self, polled: bool) {
        self.state.lock().polled = polled;
    }

    pub(crate) fn set_working_until(&self, deadline: Option<Instant>) {
        // a new deadline replaces the old one outright
        self.state.lock().working_until = deadline;
    }

    /// Fire the readiness signal. Idempotent.
    pub(crate) fn mark_ready(&self) {
        self.ready_tx.send_replace(true);
    }

    pub(crate) fn clear_attachment(&self) {
        {
            let mut st = self.state.lock();
            st.server = Weak::new();
            st.client_id = None;
            st.working_until = None;
            st.polled = false;
        }
        self.ready_tx.send_replace(false);
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Participant")
            .field("serial", &self.serial)
            .field("client_id", &st.client_id)
            .field("polled", &st.polled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_id_minimal_encoding() {
        assert_eq!(SerialId::from_u64(0).as_bytes(), &[0x00]);
        assert_eq!(SerialId::from_u64(0x7F).as_bytes(), &[0x7F]);
        assert_eq!(SerialId::from_u64(0x0100).as_bytes(), &[0x01, 0x00]);
        assert_eq!(
            SerialId::from_u64(0xDEAD_BEEF).as_bytes(),
            &[0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_detached_state() {
        let p = Participant::new(42u64);
        assert_eq!(p.client_id(), None);
        assert!(!p.polled());
        assert!(p.is_active());
        assert!(!p.is_ready());
    }

    #[tokio::test]
    async fn test_send_without_server() {
        let p = Participant::new(42u64);
        let err = p.send(3, b"", None, None).await.unwrap_err();
        assert!(matches!(err, SendError::NoServer));
    }

    #[test]
    fn test_detach_unattached_is_noop() {
        let p = Participant::new(42u64);
        p.detach();
        p.detach();
        assert_eq!(p.client_id(), None);
    }

    #[test]
    fn test_working_window_replacement() {
        let p = Participant::new(1u64);
        let far = Instant::now() + Duration::from_secs(3600);
        let near = Instant::now() + Duration::from_millis(1);
        p.set_working_until(Some(far));
        p.set_working_until(Some(near));
        // replacement, not maximum
        assert_eq!(p.working_until(), Some(near));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!p.is_active());
    }
}
