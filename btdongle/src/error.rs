//! Error types for btdongle.

use std::io;
use thiserror::Error;

/// Result type for btdongle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for btdongle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Transport write or poll failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No matching event within the command deadline, retries exhausted.
    #[error("Protocol timeout: {0}")]
    ProtocolTimeout(String),

    /// Local patch checksum disagrees with the device-reported one.
    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Locally computed checksum.
        expected: u16,
        /// Checksum reported by the device.
        actual: u16,
    },

    /// A patch chunk was not acknowledged in time.
    #[error("Firmware load timeout: {0}")]
    LoadTimeout(String),

    /// Standby enter/leave sequence failed; caller must escalate.
    #[error("WoBLE failure: {0}")]
    WobleFailure(String),

    /// Reassembly counters lost sync. Recovered locally, surfaced only
    /// when a caller asks for strict accounting.
    #[error("Reassembly desynchronization: {0}")]
    Desynchronization(String),

    /// Invalid patch image format.
    #[error("Invalid patch image: {0}")]
    InvalidPatch(String),

    /// The session is suspended or resuming; retry later.
    #[error("Device not ready, retry later")]
    NotReady,

    /// A sticky hardware error was delivered; close and reopen the stream.
    #[error("Stream must be reopened after hardware error")]
    NeedReopen,

    /// The stream is not open.
    #[error("Stream not open")]
    NotOpen,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Sticky single-slot latch recording the most recent forced-reset cause.
///
/// Once latched, the code is delivered exactly once to the consumer as the
/// synthetic event `04 10 01 <code>`, then cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HardwareErrorCode {
    /// Chip reset forced by the supervisor.
    ChipReset = 0xF0,
    /// Transport disconnected under the consumer.
    TransportDisconnect = 0xF1,
    /// Firmware core dump observed on the data path.
    CoreDump = 0xF2,
    /// Controller power-on sequence failed.
    PowerOnFailure = 0xF3,
    /// Controller power-off sequence failed.
    PowerOffFailure = 0xF4,
    /// WoBLE enter/leave sequence failed.
    WobleFailure = 0xF5,
    /// TCI sleep command rejected.
    SleepCommandFailure = 0xF6,
    /// Legacy WoBLE path entered; stack must restart on resume.
    LegacyWoble = 0xF7,
}

impl HardwareErrorCode {
    /// Synthetic HCI hardware-error event carrying this code.
    pub fn to_event(self) -> [u8; 4] {
        [0x04, 0x10, 0x01, self as u8]
    }
}
