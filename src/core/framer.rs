//! Serial framing layer
//!
//! Turns a raw byte stream into discrete validated frames and back.
//! Frame layout on the wire:
//!
//! ```text
//! marker | length (1-2 bytes) | payload | CRC-16 (big-endian)
//! ```
//!
//! The marker is a priority byte `0x01..=0x04`; `0x06` is a bare link
//! ACK. Lengths up to 127 use one byte; longer payloads set the `0x80`
//! continuation flag and carry 15 bits over two bytes.
//!
//! The receive side never fails: CRC mismatches and framing
//! violations are counted, the malformed frame is discarded, and the
//! scanner resyncs to the next marker. Counters are readable and
//! resettable for periodic health reporting.

use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use super::checksum::{crc16_xmodem, Crc16};

/// Link-level acknowledgement byte.
pub const ACK: u8 = 0x06;

/// Highest encodable payload length (15-bit length field).
pub const MAX_PAYLOAD: usize = 0x7FFF;

/// Default idle window after which a partial frame is flushed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Frame encoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload exceeds the 15-bit length field.
    #[error("payload of {0} bytes exceeds the frame length field")]
    TooLong(usize),
}

/// Receive-side health counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    /// Frames discarded for CRC mismatch.
    pub err_crc: u64,
    /// Framing violations (bad marker, bad length, lost tail).
    pub err_frame: u64,
    /// Link ACK bytes received.
    pub acks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Len,
    Len2,
    Data,
    Crc1,
    Crc2,
}

/// Stream-to-frame converter with idle-timeout completion.
pub struct Framer {
    state: RxState,
    buf: Vec<u8>,
    want: usize,
    crc: Crc16,
    crc_hi: u8,
    idle_timeout: Duration,
    last_byte_at: Option<Instant>,
    counters: FrameCounters,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl Framer {
    /// Create a framer with the given idle-flush window.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            state: RxState::Idle,
            buf: Vec::new(),
            want: 0,
            crc: Crc16::new(),
            crc_hi: 0,
            idle_timeout,
            last_byte_at: None,
            counters: FrameCounters::default(),
        }
    }

    /// Advance the receive state machine by one byte.
    ///
    /// Returns the completed payload when this byte finishes a frame
    /// whose declared length is satisfied and whose CRC validates.
    pub fn feed(&mut self, byte: u8) -> Option<Bytes> {
        self.last_byte_at = Some(Instant::now());

        match self.state {
            RxState::Idle => {
                match byte {
                    ACK => self.counters.acks += 1,
                    0x01..=0x04 => self.state = RxState::Len,
                    _ => {
                        // spurious byte between frames
                        self.counters.err_frame += 1;
                    }
                }
                None
            }
            RxState::Len => {
                if byte & 0x80 != 0 {
                    self.want = ((byte & 0x7F) as usize) << 8;
                    self.state = RxState::Len2;
                } else {
                    self.want = byte as usize;
                    self.state = if self.want == 0 {
                        RxState::Crc1
                    } else {
                        RxState::Data
                    };
                }
                None
            }
            RxState::Len2 => {
                self.want |= byte as usize;
                self.state = if self.want == 0 {
                    RxState::Crc1
                } else {
                    RxState::Data
                };
                None
            }
            RxState::Data => {
                self.buf.push(byte);
                self.crc.update(byte);
                if self.buf.len() == self.want {
                    self.state = RxState::Crc1;
                }
                None
            }
            RxState::Crc1 => {
                self.crc_hi = byte;
                self.state = RxState::Crc2;
                None
            }
            RxState::Crc2 => {
                let received = u16::from_be_bytes([self.crc_hi, byte]);
                if received == self.crc.finish() {
                    let payload = Bytes::from(std::mem::take(&mut self.buf));
                    self.resync();
                    Some(payload)
                } else {
                    self.counters.err_crc += 1;
                    self.resync();
                    None
                }
            }
        }
    }

    /// Flush on idle.
    ///
    /// If a frame is mid-reception and no byte has arrived for the
    /// idle window, the buffered bytes are delivered as a frame iff
    /// they end in a valid CRC trailer (the transport may deliver a
    /// final short frame with no terminator). Otherwise the partial
    /// frame counts as a framing error and the scanner resyncs.
    pub fn read(&mut self) -> Option<Bytes> {
        if self.state == RxState::Idle {
            return None;
        }
        let idle = self
            .last_byte_at
            .is_some_and(|t| t.elapsed() >= self.idle_timeout);
        if !idle {
            return None;
        }

        // Everything received so far, including bytes already parsed
        // as a partial CRC trailer.
        let mut pending = std::mem::take(&mut self.buf);
        if self.state == RxState::Crc2 {
            pending.push(self.crc_hi);
        }

        let result = if pending.len() >= 2 {
            let split = pending.len() - 2;
            let trailer = u16::from_be_bytes([pending[split], pending[split + 1]]);
            if crc16_xmodem(&pending[..split]) == trailer {
                pending.truncate(split);
                Some(Bytes::from(pending))
            } else {
                None
            }
        } else {
            None
        };

        if result.is_none() {
            self.counters.err_frame += 1;
        }
        self.resync();
        result
    }

    /// Wrap a payload: returns the frame header and the CRC trailer.
    ///
    /// Pure; the caller writes `header | payload | trailer`.
    pub fn frame(payload: &[u8], prio: u8) -> Result<(Vec<u8>, [u8; 2]), FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::TooLong(payload.len()));
        }
        let mut header = Vec::with_capacity(3);
        header.push(0x01 + prio.min(3));
        if payload.len() >= 0x80 {
            header.push(0x80 | (payload.len() >> 8) as u8);
            header.push((payload.len() & 0xFF) as u8);
        } else {
            header.push(payload.len() as u8);
        }
        Ok((header, crc16_xmodem(payload).to_be_bytes()))
    }

    /// Encode a complete frame for one payload.
    pub fn encode(payload: &[u8], prio: u8) -> Result<Vec<u8>, FrameError> {
        let (header, trailer) = Self::frame(payload, prio)?;
        let mut out = Vec::with_capacity(header.len() + payload.len() + 2);
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        out.extend_from_slice(&trailer);
        Ok(out)
    }

    /// Encode a bare link ACK.
    pub fn encode_ack() -> [u8; 1] {
        [ACK]
    }

    /// Read the health counters.
    pub fn counters(&self) -> FrameCounters {
        self.counters
    }

    /// Reset the health counters, returning the previous values.
    pub fn reset_counters(&mut self) -> FrameCounters {
        std::mem::take(&mut self.counters)
    }

    fn resync(&mut self) {
        self.state = RxState::Idle;
        self.buf.clear();
        self.want = 0;
        self.crc.reset();
        self.crc_hi = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(framer: &mut Framer, bytes: &[u8]) -> Option<Bytes> {
        let mut out = None;
        for &b in bytes {
            if let Some(p) = framer.feed(b) {
                assert!(out.is_none(), "frame delivered twice");
                out = Some(p);
            }
        }
        out
    }

    #[test]
    fn test_round_trip() {
        let payload = b"\x11\x01\x02hello bus";
        let wire = Framer::encode(payload, 0).unwrap();
        let mut framer = Framer::default();
        let got = feed_all(&mut framer, &wire).expect("frame");
        assert_eq!(&got[..], payload);
        assert_eq!(framer.counters(), FrameCounters::default());
    }

    #[test]
    fn test_two_byte_length() {
        let payload = vec![0xAB; 300];
        let wire = Framer::encode(&payload, 2).unwrap();
        assert_eq!(wire[0], 0x03);
        assert_eq!(wire[1], 0x80 | (300u16 >> 8) as u8);
        let mut framer = Framer::default();
        let got = feed_all(&mut framer, &wire).expect("frame");
        assert_eq!(got.len(), 300);
    }

    #[test]
    fn test_crc_mismatch_counts_and_resyncs() {
        let wire = Framer::encode(b"abc", 0).unwrap();
        let mut bad = wire.clone();
        let n = bad.len();
        bad[n - 1] ^= 0x01;

        let mut framer = Framer::default();
        assert!(feed_all(&mut framer, &bad).is_none());
        assert_eq!(framer.counters().err_crc, 1);

        // next good frame still decodes
        let got = feed_all(&mut framer, &wire).expect("frame");
        assert_eq!(&got[..], b"abc");
    }

    #[test]
    fn test_spurious_byte() {
        let mut framer = Framer::default();
        assert!(framer.feed(0x55).is_none());
        assert_eq!(framer.counters().err_frame, 1);
    }

    #[test]
    fn test_ack_counted() {
        let mut framer = Framer::default();
        framer.feed(ACK);
        framer.feed(ACK);
        assert_eq!(framer.counters().acks, 2);
        assert_eq!(framer.reset_counters().acks, 2);
        assert_eq!(framer.counters().acks, 0);
    }

    #[test]
    fn test_idle_flush_short_frame() {
        // Declared length overstates the payload; the sender stops
        // after payload + CRC with no terminator.
        let payload = b"short";
        let crc = crc16_xmodem(payload).to_be_bytes();
        let mut framer = Framer::new(Duration::from_millis(1));
        framer.feed(0x01);
        framer.feed(20); // declared, never satisfied
        for &b in payload.iter().chain(crc.iter()) {
            assert!(framer.feed(b).is_none());
        }
        std::thread::sleep(Duration::from_millis(5));
        let got = framer.read().expect("idle flush");
        assert_eq!(&got[..], payload);
        // flushed exactly once
        assert!(framer.read().is_none());
    }

    #[test]
    fn test_idle_flush_invalid_tail() {
        let mut framer = Framer::new(Duration::from_millis(1));
        framer.feed(0x01);
        framer.feed(10);
        framer.feed(0xAA);
        framer.feed(0xBB);
        std::thread::sleep(Duration::from_millis(5));
        assert!(framer.read().is_none());
        assert_eq!(framer.counters().err_frame, 1);
    }

    #[test]
    fn test_complete_frame_not_redelivered_on_idle() {
        let wire = Framer::encode(b"once", 0).unwrap();
        let mut framer = Framer::new(Duration::from_millis(1));
        assert!(feed_all(&mut framer, &wire).is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert!(framer.read().is_none());
        assert_eq!(framer.counters(), FrameCounters::default());
    }

    #[test]
    fn test_empty_payload() {
        let wire = Framer::encode(&[], 0).unwrap();
        let mut framer = Framer::default();
        let got = feed_all(&mut framer, &wire).expect("frame");
        assert!(got.is_empty());
    }

    #[test]
    fn test_too_long() {
        let payload = vec![0; MAX_PAYLOAD + 1];
        assert_eq!(
            Framer::encode(&payload, 0),
            Err(FrameError::TooLong(MAX_PAYLOAD + 1))
        );
    }
}
