//! Device/session lifecycle state.
//!
//! One [`Session`] object owns every piece of mutable per-device state
//! and is shared by reference between the protocol engine, the loader,
//! the WoBLE manager, the traffic pump and the consumer stream. It is
//! created at probe and dropped at disconnect, persisting across
//! suspend/resume.
//!
//! Locking: caller-context fields live behind one mutex; the ring
//! buffer and the diagnostic queue carry their own completion-safe
//! locks and are never touched under the session lock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::chip::ChipFamily;
use crate::error::{Error, HardwareErrorCode, Result};
use crate::fwlog::DiagQueue;
use crate::ringbuf::RingBuffer;

/// Overall controller/link state, including the cross-products that
/// record a disconnect or dump racing with suspend/resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not yet probed.
    Unknown,
    /// Probe accepted, setup running.
    Init,
    /// Transport lost.
    Disconnected,
    /// Device being probed.
    Probe,
    /// Fully operational.
    Working,
    /// System suspend in progress.
    Suspend,
    /// System resume in progress.
    Resume,
    /// Unsolicited firmware dump streaming on the data path.
    FwDump,
    /// Disconnect observed while suspended.
    SuspendDisconnect,
    /// Disconnect observed while resuming.
    ResumeDisconnect,
    /// Dump began while suspended.
    SuspendFwDump,
    /// Dump began while resuming.
    ResumeFwDump,
}

impl LinkState {
    /// Asynchronous data polling runs only in these states.
    pub fn polling_allowed(self) -> bool {
        matches!(self, Self::Working | Self::Probe | Self::FwDump)
    }

    /// Whether a firmware dump is in progress.
    pub fn dumping(self) -> bool {
        matches!(self, Self::FwDump | Self::SuspendFwDump | Self::ResumeFwDump)
    }
}

/// Session-open sub-state of the consumer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Stream never opened.
    #[default]
    Unknown,
    /// Device ready, stream not yet opened.
    Init,
    /// Stream open.
    Opened,
    /// Close in progress.
    Closing,
    /// Stream closed.
    Closed,
}

/// Dongle power sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    /// Power state not yet known (families without power control stay
    /// here).
    #[default]
    Unknown,
    /// Power-on sequence running.
    PoweringOn,
    /// Radio powered on.
    PowerOn,
    /// In WoBLE standby.
    Woble,
    /// Power-off sequence running.
    PoweringOff,
    /// Radio powered off.
    PowerOff,
    /// Power sequencing failed; reset pending.
    Error,
}

struct SessionInner {
    link: LinkState,
    stream: StreamState,
    power: PowerState,
    chip: Option<ChipFamily>,
    bdaddr: Option<[u8; 6]>,
    hw_error: Option<HardwareErrorCode>,
    need_reopen: bool,
    suspend_depth: u32,
}

/// Shared per-device state hub.
pub struct Session {
    state: Mutex<SessionInner>,
    buffer: RingBuffer,
    fwlog: DiagQueue,
}

impl Session {
    /// Create a fresh session with the given consumer buffer capacity.
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            state: Mutex::new(SessionInner {
                link: LinkState::Unknown,
                stream: StreamState::Unknown,
                power: PowerState::Unknown,
                chip: None,
                bdaddr: None,
                hw_error: None,
                need_reopen: false,
                suspend_depth: 0,
            }),
            buffer: RingBuffer::new(buffer_capacity),
            fwlog: DiagQueue::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The consumer-facing ring buffer.
    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    /// The parallel diagnostic queue.
    pub fn fwlog(&self) -> &DiagQueue {
        &self.fwlog
    }

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        self.lock().link
    }

    /// Force the link state (probe/setup paths).
    pub fn set_link_state(&self, new: LinkState) {
        let mut inner = self.lock();
        if inner.link != new {
            info!("link state {:?} -> {:?}", inner.link, new);
            inner.link = new;
        }
    }

    /// Whether the data-plane pump may poll right now.
    pub fn polling_allowed(&self) -> bool {
        self.lock().link.polling_allowed()
    }

    /// Record a transport loss, folding in a racing suspend/resume so
    /// the successor state survives until the race settles.
    pub fn on_transport_loss(&self) {
        let mut inner = self.lock();
        let new = match inner.link {
            LinkState::Suspend | LinkState::SuspendFwDump => LinkState::SuspendDisconnect,
            LinkState::Resume | LinkState::ResumeFwDump => LinkState::ResumeDisconnect,
            _ => LinkState::Disconnected,
        };
        info!("transport loss: {:?} -> {:?}", inner.link, new);
        inner.link = new;
        if inner.hw_error.is_none() {
            inner.hw_error = Some(HardwareErrorCode::TransportDisconnect);
        }
        drop(inner);
        self.buffer.wake_readers();
    }

    /// Record the first frame of an unsolicited firmware dump. Returns
    /// `true` if this call started the dump.
    pub fn on_dump_start(&self) -> bool {
        let mut inner = self.lock();
        if inner.link.dumping() {
            return false;
        }
        let new = match inner.link {
            LinkState::Suspend => LinkState::SuspendFwDump,
            LinkState::Resume => LinkState::ResumeFwDump,
            _ => LinkState::FwDump,
        };
        info!("firmware dump begin: {:?} -> {:?}", inner.link, new);
        inner.link = new;
        if inner.hw_error.is_none() {
            inner.hw_error = Some(HardwareErrorCode::CoreDump);
        }
        true
    }

    /// System suspend notification. Returns `true` on the outermost
    /// suspend (nested suspends are counted and ignored).
    pub fn on_suspend(&self) -> bool {
        let mut inner = self.lock();
        inner.link = LinkState::Suspend;
        inner.suspend_depth += 1;
        if inner.suspend_depth > 1 {
            warn!("already suspended, depth {}", inner.suspend_depth);
            return false;
        }
        true
    }

    /// System resume notification. Returns `true` on the outermost
    /// resume.
    pub fn on_resume(&self) -> bool {
        let mut inner = self.lock();
        inner.suspend_depth = inner.suspend_depth.saturating_sub(1);
        if inner.suspend_depth > 0 {
            warn!("still suspended, depth {}", inner.suspend_depth);
            return false;
        }
        inner.link = LinkState::Resume;
        true
    }

    /// Data-plane traffic restarted after resume; Resume folds back to
    /// Working. A pending disconnect or dump recorded during the race
    /// wins instead.
    pub fn on_traffic_restart(&self) {
        let mut inner = self.lock();
        let new = match inner.link {
            LinkState::Resume => LinkState::Working,
            LinkState::SuspendDisconnect | LinkState::ResumeDisconnect => LinkState::Disconnected,
            LinkState::SuspendFwDump | LinkState::ResumeFwDump => LinkState::FwDump,
            other => other,
        };
        if new != inner.link {
            info!("traffic restart: {:?} -> {:?}", inner.link, new);
            inner.link = new;
        }
    }

    /// Stream sub-state.
    pub fn stream_state(&self) -> StreamState {
        self.lock().stream
    }

    /// Set the stream sub-state.
    pub fn set_stream_state(&self, new: StreamState) {
        let mut inner = self.lock();
        if inner.stream != new {
            info!("stream state {:?} -> {:?}", inner.stream, new);
            inner.stream = new;
        }
    }

    /// Dongle power sub-state.
    pub fn power_state(&self) -> PowerState {
        self.lock().power
    }

    /// Set the power sub-state.
    pub fn set_power_state(&self, new: PowerState) {
        let mut inner = self.lock();
        if inner.power != new {
            info!("power state {:?} -> {:?}", inner.power, new);
            inner.power = new;
        }
    }

    /// Synchronous HCI commands are accepted only while powered on, in
    /// WoBLE standby, or on families without power control.
    pub fn power_allows_commands(&self) -> bool {
        matches!(
            self.lock().power,
            PowerState::Unknown | PowerState::PowerOn | PowerState::Woble
        )
    }

    /// Wait for an in-flight power transition to settle.
    pub fn wait_power_settled(&self, timeout: Duration) -> Result<PowerState> {
        let deadline = Instant::now() + timeout;
        loop {
            let power = self.power_state();
            if !matches!(power, PowerState::PoweringOn | PowerState::PoweringOff) {
                return Ok(power);
            }
            if Instant::now() >= deadline {
                return Err(Error::NotReady);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    /// Map a reported chip id to its family and record it. Unknown ids
    /// fail the probe.
    pub fn probe_chip(&self, chip_id: u32) -> Result<ChipFamily> {
        let chip = ChipFamily::from_chip_id(chip_id)
            .ok_or_else(|| Error::Config(format!("unsupported chip id {chip_id:#06x}")))?;
        info!("probed chip family {chip}");
        self.set_chip(chip);
        Ok(chip)
    }

    /// Chip identity, once probed.
    pub fn chip(&self) -> Option<ChipFamily> {
        self.lock().chip
    }

    /// Record the probed chip identity.
    pub fn set_chip(&self, chip: ChipFamily) {
        self.lock().chip = Some(chip);
    }

    /// Controller public address, once read.
    pub fn bdaddr(&self) -> Option<[u8; 6]> {
        self.lock().bdaddr
    }

    /// Record the controller address.
    pub fn set_bdaddr(&self, addr: [u8; 6]) {
        self.lock().bdaddr = Some(addr);
    }

    /// Latch a sticky hardware error code unless one is already
    /// pending. The first cause wins.
    pub fn latch_error(&self, code: HardwareErrorCode) {
        let mut inner = self.lock();
        if inner.hw_error.is_none() {
            warn!("latching hardware error {code:?}");
            inner.hw_error = Some(code);
        }
        drop(inner);
        self.buffer.wake_readers();
    }

    /// Take the pending sticky code, clearing the latch. Delivered
    /// exactly once.
    pub fn take_error(&self) -> Option<HardwareErrorCode> {
        let mut inner = self.lock();
        let code = inner.hw_error.take();
        if code.is_some() {
            inner.need_reopen = true;
        }
        code
    }

    /// Whether a sticky code is waiting for delivery.
    pub fn has_pending_error(&self) -> bool {
        self.lock().hw_error.is_some()
    }

    /// Whether the consumer must close and reopen the stream.
    pub fn needs_reopen(&self) -> bool {
        self.lock().need_reopen
    }

    /// Clear the reopen flag (on open).
    pub fn clear_reopen(&self) {
        self.lock().need_reopen = false;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(crate::ringbuf::DEFAULT_CAPACITY)
    }
}
