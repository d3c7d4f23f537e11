//! Out-of-band diagnostic/log channel.
//!
//! Vendor log and firmware-dump frames are queued here, decoupled from
//! the primary data path, so a dump cannot starve the consumer stream.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;

/// Queue bound; the oldest entry is dropped when exceeded.
const MAX_QUEUED: usize = 1000;

/// Vendor log frame marker on the data pipe (`FF 05 len_lo len_hi`).
pub const VENDOR_LOG_PREFIX: [u8; 2] = [0xFF, 0x05];

/// Firmware dump frames reuse the WMT vendor opcode on the data pipe.
pub const DUMP_PREFIX: [u8; 2] = [0x6F, 0xFC];

/// Whether an event-pipe frame belongs on the diagnostic channel
/// rather than the consumer stream.
pub fn is_diagnostic(frame: &[u8]) -> bool {
    frame.first() == Some(&0xFF) || frame.starts_with(&DUMP_PREFIX)
}

/// Header used when a diagnostic frame is mirrored into the consumer
/// stream: `FF <len> FE <type>` followed by the frame.
pub fn mirror_frame(frame: &[u8], pkt_type: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 4);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&[0xFF, (frame.len() + 2) as u8, 0xFE, pkt_type]);
    out.extend_from_slice(frame);
    out
}

/// Parallel bounded queue for diagnostic frames.
#[derive(Default)]
pub struct DiagQueue {
    queue: Mutex<VecDeque<Vec<u8>>>,
    readable: Condvar,
}

impl DiagQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one diagnostic frame, dropping the oldest entry when full.
    pub fn push_event(&self, frame: &[u8]) {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= MAX_QUEUED {
            warn!("diagnostic queue full, dropping oldest frame");
            queue.pop_front();
        }
        queue.push_back(frame.to_vec());
        drop(queue);
        self.readable.notify_all();
    }

    /// Pop the next frame, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(frame) = queue.pop_front() {
            return Some(frame);
        }
        let (mut queue, _result) = match self.readable.wait_timeout(queue, timeout) {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        let queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
