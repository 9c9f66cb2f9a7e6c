//! # Buslink Core Library
//!
//! A multi-drop serial bus coordinator library with support for:
//! - Participant addressing and lifecycle tracking
//! - Byte-stream framing with CRC validation and idle-flush
//! - Opcode-based dispatch of control traffic
//! - Loop-safe bridging to a message-bus transport
//! - Correlated call/reply multiplexing over a shared link
//!
//! ## Features
//!
//! - Coordinator-owned registry, no global state
//! - Weak participant→coordinator links; a dropped coordinator is a
//!   checked error, never a dangling reference
//! - Transport noise (CRC, framing) counted, never raised
//! - Structured task lifecycles via cancellation tokens
//!
//! ## Example
//!
//! ```rust,no_run
//! use buslink::{Participant, Server, ServerConfig, SerialLink, SerialLinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let link = SerialLink::open(&SerialLinkConfig::new("/dev/ttyUSB0", 57600))?;
//!     let server = Server::new(Box::new(link), &ServerConfig::default());
//!
//!     let sensor = Participant::new(0x00C0_FFEEu64);
//!     server.attach(&sensor);
//!     server.assign_address(&sensor)?;
//!     sensor.wait_ready().await;
//!     sensor.send(8, b"\x01", None, None).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::config::{AppConfig, GatewaySettings, MuxSettings};
pub use crate::core::dispatch::{opcode, Dispatcher, HandlerError, Nested, OpcodeHandler};
pub use crate::core::framer::{FrameCounters, FrameError, Framer};
pub use crate::core::gateway::{
    mem_bus_pair, BusPort, Gateway, GatewayError, GatewayStats, MemBusPort,
};
pub use crate::core::message::{BusMessage, DecodeError, BROADCAST};
pub use crate::core::mux::{CallError, CommandMux};
pub use crate::core::participant::{
    DeviceHandler, NullDevice, Participant, SendError, SerialId,
};
pub use crate::core::server::{
    BroadcastPolicy, Server, ServerConfig, ServerError, CODE_CONTROL,
};
pub use crate::core::transport::{
    loopback_pair, BusTransport, FramedLink, LoopbackLink, SerialLink, SerialLinkConfig,
    TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
