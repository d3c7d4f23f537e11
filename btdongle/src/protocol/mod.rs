//! Command/event protocol engine.
//!
//! Sends a command frame and collects a matching reply within a bound,
//! with retry. While a synchronous reply is awaited the data-plane pump
//! is paused through the traffic gate, so the same event can never be
//! delivered both to the waiter and to the passive path.

pub mod wmt;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::fwlog;
use crate::pump::TrafficGate;
use crate::session::Session;
use crate::transport::Transport;
use wmt::WmtFrame;

/// Granularity of the event poll inside a synchronous wait.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default bound for one synchronous reply wait.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_millis(2000);

/// Fixed settle delay between a WMT control write and its readback.
const WMT_SETTLE_DELAY: Duration = Duration::from_millis(20);

/// One command send: opcode+payload bytes, the reply prefix to wait for
/// (absent for fire-and-forget commands), a per-attempt timeout and a
/// retry count. Created per call, discarded after completion.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    /// Raw command bytes, opcode first.
    pub payload: Vec<u8>,
    /// Reply prefix that completes the wait, if any.
    pub expected_prefix: Option<Vec<u8>>,
    /// Bound for a single reply wait.
    pub timeout: Duration,
    /// Additional attempts after the first timeout.
    pub retries: u32,
}

impl CommandDescriptor {
    /// Command with a synchronous reply.
    pub fn new(payload: impl Into<Vec<u8>>, expected_prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            expected_prefix: Some(expected_prefix.into()),
            timeout: DEFAULT_CMD_TIMEOUT,
            retries: 0,
        }
    }

    /// Fire-and-forget command; returns as soon as the write succeeds.
    pub fn without_reply(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            expected_prefix: None,
            timeout: DEFAULT_CMD_TIMEOUT,
            retries: 0,
        }
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// The command path. Shared between the firmware loader, the WoBLE
/// manager and the consumer stream.
pub struct ProtocolEngine<T: Transport> {
    transport: Arc<T>,
    session: Arc<Session>,
    gate: Arc<TrafficGate>,
}

impl<T: Transport> ProtocolEngine<T> {
    /// Create an engine over the given transport and session.
    pub fn new(transport: Arc<T>, session: Arc<Session>, gate: Arc<TrafficGate>) -> Self {
        Self {
            transport,
            session,
            gate,
        }
    }

    /// The transport this engine writes to.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The session this engine updates.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The traffic gate shared with the data-plane pump.
    pub fn gate(&self) -> &Arc<TrafficGate> {
        &self.gate
    }

    /// Send a command and, if a reply prefix is expected, wait for the
    /// matching event.
    ///
    /// Never blocks longer than `timeout × (retries + 1)` before
    /// returning the reply or [`Error::ProtocolTimeout`]. Non-matching
    /// events observed during the wait are forwarded to passive
    /// dispatch, never dropped.
    pub fn send_command(&self, cmd: &CommandDescriptor) -> Result<Vec<u8>> {
        if !self.session.power_allows_commands() {
            warn!(
                "chip power is not on, dropping command {:02x?}",
                &cmd.payload[..cmd.payload.len().min(3)]
            );
            return Err(Error::NotReady);
        }

        // Reply comes in on the event pipe; pause the pump so the wait
        // below is the only reader.
        let _paused = self.gate.pause();

        self.transport.send_control(&cmd.payload)?;

        let Some(prefix) = &cmd.expected_prefix else {
            return Ok(Vec::new());
        };

        for attempt in 0..=cmd.retries {
            if attempt > 0 {
                warn!("no matching reply, retrying ({attempt}/{})", cmd.retries);
            }
            let deadline = Instant::now() + cmd.timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let slice = POLL_INTERVAL.min(deadline - now);
                let Some(event) = self.transport.poll_event(slice)? else {
                    continue;
                };

                if malformed(&event) {
                    warn!(
                        "ignoring incorrect format packet: {:02X} {:02X}",
                        event[0], event[1]
                    );
                    continue;
                }

                if event.starts_with(prefix) {
                    trace!("matched reply ({} bytes)", event.len());
                    return Ok(event);
                }

                self.dispatch_passive(&event);
            }
        }

        Err(Error::ProtocolTimeout(format!(
            "no reply matching {:02x?} after {} attempt(s)",
            prefix,
            cmd.retries + 1
        )))
    }

    /// Send a WMT lifecycle frame on the control pipe and read its
    /// reply back from the same pipe, with a fixed settle delay.
    pub fn send_wmt(&self, frame: &WmtFrame, retries: u32) -> Result<Vec<u8>> {
        let cmd = frame.build();
        let expected = frame.expected_reply();

        self.transport.send_control(&cmd)?;

        let mut attempts_left = retries;
        loop {
            thread::sleep(WMT_SETTLE_DELAY);
            let reply = self.transport.control_read(DEFAULT_CMD_TIMEOUT)?;
            if reply.starts_with(&expected) {
                return Ok(reply);
            }
            if attempts_left == 0 {
                debug!("unknown WMT reply: {:02x?}", &reply[..reply.len().min(16)]);
                return Err(Error::ProtocolTimeout(format!(
                    "WMT op {:?} got no matching reply",
                    frame.op()
                )));
            }
            attempts_left -= 1;
            trace!("WMT reply mismatch, reading again ({attempts_left} left)");
        }
    }

    /// Passive bounded wait for an event matching `prefix`.
    ///
    /// Used for WoBLE completion events that arrive after the status
    /// reply. Every non-matching event is dispatched.
    pub fn wait_for_event(&self, prefix: &[u8], total_timeout: Duration) -> Result<Vec<u8>> {
        let _paused = self.gate.pause();
        let deadline = Instant::now() + total_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = POLL_INTERVAL.min(deadline - now);
            let Some(event) = self.transport.poll_event(slice)? else {
                continue;
            };
            if malformed(&event) {
                warn!(
                    "ignoring incorrect format packet: {:02X} {:02X}",
                    event[0], event[1]
                );
                continue;
            }
            if event.starts_with(prefix) {
                return Ok(event);
            }
            self.dispatch_passive(&event);
        }

        Err(Error::ProtocolTimeout(format!(
            "event {:02x?} did not arrive",
            prefix
        )))
    }

    /// Route an event that was not the awaited reply: diagnostic and
    /// vendor-log frames to the parallel queue, everything else to the
    /// consumer ring buffer.
    fn dispatch_passive(&self, event: &[u8]) {
        if fwlog::is_diagnostic(event) {
            self.session.fwlog().push_event(event);
        } else {
            self.session.buffer().push(crate::ringbuf::PKT_EVENT, event);
        }
    }
}

/// Declared-length check for an event frame: byte 1 holds the parameter
/// length, total length must be parameters + 2.
fn malformed(event: &[u8]) -> bool {
    event.len() >= 2 && event[1] as usize + 2 != event.len()
}
