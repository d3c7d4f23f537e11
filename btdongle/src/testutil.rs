//! In-memory transport double shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::protocol::ProtocolEngine;
use crate::pump::TrafficGate;
use crate::session::Session;
use crate::transport::Transport;

#[derive(Default)]
struct Queues {
    events: VecDeque<Vec<u8>>,
    bulks: VecDeque<Vec<u8>>,
    control_writes: Vec<Vec<u8>>,
    bulk_writes: Vec<Vec<u8>>,
}

/// Scripted transport: tests queue inbound frames and inspect what was
/// written.
#[derive(Default)]
pub struct MockTransport {
    queues: Mutex<Queues>,
    arrived: Condvar,
}

impl MockTransport {
    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a frame for the event pipe.
    pub fn queue_event(&self, frame: &[u8]) {
        self.lock().events.push_back(frame.to_vec());
        self.arrived.notify_all();
    }

    /// Queue a frame for the data pipe.
    pub fn queue_bulk(&self, frame: &[u8]) {
        self.lock().bulks.push_back(frame.to_vec());
        self.arrived.notify_all();
    }

    /// Every command written so far, in order.
    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.lock().control_writes.clone()
    }

    /// Every data frame written so far, in order.
    pub fn bulk_writes(&self) -> Vec<Vec<u8>> {
        self.lock().bulk_writes.clone()
    }
}

impl Transport for MockTransport {
    fn send_control(&self, cmd: &[u8]) -> Result<()> {
        self.lock().control_writes.push(cmd.to_vec());
        Ok(())
    }

    fn send_bulk(&self, data: &[u8], _timeout: Duration) -> Result<()> {
        self.lock().bulk_writes.push(data.to_vec());
        Ok(())
    }

    fn poll_event(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut queues = self.lock();
        if let Some(frame) = queues.events.pop_front() {
            return Ok(Some(frame));
        }
        let (mut queues, _result) = match self.arrived.wait_timeout(queues, timeout) {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(queues.events.pop_front())
    }

    fn poll_bulk(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut queues = self.lock();
        if let Some(frame) = queues.bulks.pop_front() {
            return Ok(Some(frame));
        }
        let (mut queues, _result) = match self.arrived.wait_timeout(queues, timeout) {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(queues.bulks.pop_front())
    }

    fn control_read(&self, _timeout: Duration) -> Result<Vec<u8>> {
        // Scripted replies are queued up front; an empty read models the
        // device having nothing to say.
        Ok(self.lock().events.pop_front().unwrap_or_default())
    }
}

/// A protocol engine wired to a fresh session and a mock transport.
pub fn engine_fixture() -> (ProtocolEngine<MockTransport>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::default());
    let session = Arc::new(Session::new(4096));
    session.set_link_state(crate::session::LinkState::Working);
    let gate = Arc::new(TrafficGate::new());
    let engine = ProtocolEngine::new(Arc::clone(&transport), session, gate);
    (engine, transport)
}
