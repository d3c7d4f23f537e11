//! # btdongle
//!
//! Control and data plane engine for a Bluetooth radio dongle driven
//! over a serial command/data transport.
//!
//! This crate provides the host-side machinery for bringing a dongle
//! up and keeping it alive:
//!
//! - WMT vendor protocol and synchronous command/event engine
//! - Firmware patch loading with phase-tagged chunk streaming
//! - Wake-over-BLE standby entry/exit with APCF filter programming
//! - Device/session lifecycle state machine
//! - Ring-buffered consumer stream with packet reassembly
//! - Fault supervision with injected board reset and wake-lock hooks
//!
//! ## Features
//!
//! - `native` (default): serial transport backend via the `serialport`
//!   crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use btdongle::{
//!     ChipFamily, FsFirmwareProvider, PatchLoader, ProtocolEngine, SerialConfig,
//!     SerialTransport, Session, TrafficGate,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(SerialTransport::open(&SerialConfig::new(
//!         "/dev/ttyUSB0",
//!         921_600,
//!     ))?);
//!     let session = Arc::new(Session::default());
//!     let gate = Arc::new(TrafficGate::new());
//!     let engine = Arc::new(ProtocolEngine::new(transport, session, gate));
//!
//!     let loader = PatchLoader::new(
//!         Arc::clone(&engine),
//!         FsFirmwareProvider::new("/lib/firmware"),
//!     );
//!     loader.load(ChipFamily::Unify7668)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chip;
pub mod error;
pub mod firmware;
pub mod fwlog;
pub mod protocol;
pub mod pump;
pub mod ringbuf;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod transport;
pub mod woble;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use transport::SerialTransport;
pub use {
    chip::ChipFamily,
    error::{Error, HardwareErrorCode, Result},
    firmware::{checksum16, FirmwareProvider, FsFirmwareProvider, PatchImage, PatchLoader},
    protocol::{
        wmt::{PatchPhase, WmtFrame, WmtOp},
        CommandDescriptor, ProtocolEngine,
    },
    pump::{TrafficGate, TrafficPump},
    ringbuf::RingBuffer,
    session::{LinkState, PowerState, Session, StreamState},
    stream::HostStream,
    supervisor::{FaultSupervisor, ResetLine, WakeLock},
    transport::{SerialConfig, Transport},
    woble::{WobleManager, WobleMode, WobleSettings},
};
