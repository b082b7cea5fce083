pub mod interface;
pub mod protocol;
pub mod simulator;

pub use interface::{SerialConnector, SerialInterface};
pub use protocol::{Command, CompletionReport, StatusReport};
pub use serialport::ClearBuffer;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Handshake failed after {0} attempts")]
    HandshakeFailed(u32),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Byte-level access to one rotator line.
///
/// Implemented by [`SerialInterface`] for real hardware and by
/// [`simulator::SimulatedRotator`] for tests.
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    /// Whether the line is currently open.
    fn is_open(&self) -> bool;

    /// Write all of `data` and wait until it has left the output queue.
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Read one byte at a time until `stop` is seen (kept in the returned
    /// frame) or `timeout_ms` has elapsed. Returns at most `max_len - 1`
    /// bytes; an empty frame means nothing arrived before the deadline.
    async fn read_until(&mut self, max_len: usize, stop: u8, timeout_ms: u64) -> Result<Vec<u8>>;

    /// Discard pending input and/or output.
    fn clear(&mut self, buffer: ClearBuffer) -> Result<()>;

    /// Close the line. Safe to call more than once.
    fn close(&mut self);
}

/// Source of candidate ports and of open lines for them.
pub trait PortConnector: Send + Sync {
    /// Port paths that may host a rotator.
    fn candidate_ports(&self) -> Result<Vec<String>>;

    /// Open and configure the line at `port_name`.
    fn connect(&self, port_name: &str) -> Result<Box<dyn SerialPortIO>>;
}
