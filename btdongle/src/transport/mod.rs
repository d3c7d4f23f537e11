//! Transport abstraction for the controller's command/data pipes.
//!
//! The engine talks to the controller through three logical pipes: a
//! control pipe for commands, an interrupt-style event pipe, and a bulk
//! data pipe. Endpoint enumeration and raw asynchronous submission are
//! owned by the adapter behind this trait, not by the engine.
//!
//! ```text
//! +--------------------+     +--------------------+
//! |  Protocol / Loader |     |   Traffic Pump     |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+--------------------------+----------+
//! |                Transport trait                |
//! +---------+--------------------------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |   SerialTransport  |     |  test doubles etc. |
//! |    (serialport)    |     |                    |
//! +--------------------+     +--------------------+
//! ```

#[cfg(feature = "native")]
pub mod serial;

use std::time::Duration;

use crate::error::Result;

/// Serial transport configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout for a single transfer.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the per-transfer timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Unified transport trait over the controller's pipes.
///
/// All operations are bounded: polls and bulk writes take an explicit
/// timeout, and `Ok(None)` from a poll means "nothing arrived in time",
/// which is not an error.
pub trait Transport: Send + Sync {
    /// Write a command frame on the control pipe.
    fn send_control(&self, cmd: &[u8]) -> Result<()>;

    /// Write a data frame on the bulk-out pipe, blocking until the
    /// transfer is acknowledged or `timeout` elapses.
    fn send_bulk(&self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Poll the event (interrupt) pipe for one frame.
    fn poll_event(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Poll the bulk-in pipe for one frame.
    fn poll_bulk(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Read a reply from the vendor control-in pipe.
    ///
    /// Used by the WMT command path and the legacy checksum readback,
    /// where the reply comes back on the control pipe instead of the
    /// event pipe.
    fn control_read(&self, timeout: Duration) -> Result<Vec<u8>>;
}

// Re-export the serial implementation when built for native targets.
#[cfg(feature = "native")]
pub use serial::SerialTransport;
