//! Serial port transport implementation

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{BusTransport, TransportError};

/// Serial port configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialLinkConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read buffer size
    pub buffer_size: usize,
}

impl SerialLinkConfig {
    /// Create a configuration with default buffering.
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            buffer_size: 256,
        }
    }

    /// Set the read buffer size.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 57600)
    }
}

/// Serial bus link over a tokio serial stream.
pub struct SerialLink {
    reader: tokio::sync::Mutex<ReadHalf<SerialStream>>,
    writer: tokio::sync::Mutex<WriteHalf<SerialStream>>,
    buffer_size: usize,
}

impl SerialLink {
    /// Open the configured port.
    pub fn open(config: &SerialLinkConfig) -> Result<Self, TransportError> {
        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            buffer_size: config.buffer_size,
        })
    }
}

#[async_trait]
impl BusTransport for SerialLink {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut buf = vec![0u8; self.buffer_size];
        let n = self.reader.lock().await.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}
