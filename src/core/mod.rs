//! Core module containing the main functionality of buslink
//!
//! This module provides:
//! - Message envelope shared by both transports
//! - Serial framing with CRC validation and idle-flush
//! - Checksum primitives for the frame trailer
//! - Opcode classification and handler routing
//! - Participant identity, addressing, and lifecycle
//! - Bus coordination (registry, address assignment, dispatch)
//! - Loop-safe serial ⇄ message-bus gateway
//! - Command multiplexing (correlated call/reply)
//! - Transport layer (serial, in-memory loopback)

pub mod checksum;
pub mod dispatch;
pub mod framer;
pub mod gateway;
pub mod message;
pub mod mux;
pub mod participant;
pub mod server;
pub mod transport;
