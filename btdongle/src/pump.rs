//! Asynchronous data-plane pump.
//!
//! A background thread polls the event and data pipes whenever the link
//! state permits, routing frames to the consumer ring buffer or to the
//! diagnostic queue. The [`TrafficGate`] lets the synchronous command
//! path pause the pump so a reply wait is the only event reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::fwlog;
use crate::ringbuf::{PKT_DATA, PKT_EVENT};
use crate::session::Session;
use crate::transport::Transport;

/// Pipe poll granularity for the pump loop.
const PUMP_POLL: Duration = Duration::from_millis(10);

/// Backoff while paused or while the link state forbids polling.
const PUMP_IDLE: Duration = Duration::from_millis(20);

/// Marker closing a firmware dump; the chip sends it as the final
/// fragment of the last dump frame.
const DUMP_END_MARKER: &[u8] = b" end";

/// Pause gate between the command path and the pump.
///
/// Pausing is counted, so nested synchronous waits stack; the pump
/// resumes when the last guard drops.
#[derive(Default)]
pub struct TrafficGate {
    pauses: Mutex<u32>,
    resumed: Condvar,
}

impl TrafficGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause the pump until the returned guard is dropped.
    pub fn pause(self: &Arc<Self>) -> PauseGuard {
        let mut pauses = match self.pauses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *pauses += 1;
        drop(pauses);
        PauseGuard {
            gate: Arc::clone(self),
        }
    }

    /// Whether any pause guard is live.
    pub fn is_paused(&self) -> bool {
        let pauses = match self.pauses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *pauses > 0
    }

    /// Block until the gate is open or `timeout` elapses. Returns
    /// whether the gate is open.
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let mut pauses = match self.pauses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *pauses == 0 {
            return true;
        }
        let (pauses, _result) = match self.resumed.wait_timeout(pauses, timeout) {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        let open = *pauses == 0;
        drop(pauses);
        open
    }

    fn release(&self) {
        let mut pauses = match self.pauses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *pauses = pauses.saturating_sub(1);
        let open = *pauses == 0;
        drop(pauses);
        if open {
            self.resumed.notify_all();
        }
    }
}

/// RAII handle for one pause of the pump.
pub struct PauseGuard {
    gate: Arc<TrafficGate>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Background poller for the event and data pipes.
pub struct TrafficPump<T: Transport> {
    transport: Arc<T>,
    session: Arc<Session>,
    gate: Arc<TrafficGate>,
    stop: Arc<AtomicBool>,
    /// Mirror diagnostic frames into the consumer stream as well.
    mirror_diagnostics: bool,
}

impl<T: Transport + 'static> TrafficPump<T> {
    /// Create a pump over the shared transport and session.
    pub fn new(transport: Arc<T>, session: Arc<Session>, gate: Arc<TrafficGate>) -> Self {
        Self {
            transport,
            session,
            gate,
            stop: Arc::new(AtomicBool::new(false)),
            mirror_diagnostics: false,
        }
    }

    /// Also copy vendor-log and dump frames into the consumer stream,
    /// wrapped in the mirror header.
    #[must_use]
    pub fn mirror_diagnostics(mut self, enable: bool) -> Self {
        self.mirror_diagnostics = enable;
        self
    }

    /// Start the pump thread.
    pub fn spawn(self) -> PumpHandle {
        let stop = Arc::clone(&self.stop);
        let spawned = thread::Builder::new()
            .name("btdongle-pump".into())
            .spawn(move || self.run());
        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!("failed to spawn pump thread: {err}");
                None
            },
        };
        PumpHandle { stop, thread }
    }

    fn run(self) {
        info!("traffic pump started");
        while !self.stop.load(Ordering::Acquire) {
            if !self.session.polling_allowed() {
                thread::sleep(PUMP_IDLE);
                continue;
            }
            if self.gate.is_paused() && !self.gate.wait_open(PUMP_IDLE) {
                continue;
            }

            match self.transport.poll_event(PUMP_POLL) {
                Ok(Some(event)) => self.route_event(&event),
                Ok(None) => {},
                Err(err) => {
                    warn!("event pipe failed: {err}");
                    self.session.on_transport_loss();
                    continue;
                },
            }

            match self.transport.poll_bulk(PUMP_POLL) {
                Ok(Some(data)) => self.route_data(&data),
                Ok(None) => {},
                Err(err) => {
                    warn!("data pipe failed: {err}");
                    self.session.on_transport_loss();
                },
            }
        }
        info!("traffic pump stopped");
    }

    /// Event pipe: diagnostics to the parallel queue, the rest tagged
    /// into the consumer buffer.
    fn route_event(&self, event: &[u8]) {
        if fwlog::is_diagnostic(event) {
            self.divert_diagnostic(event, PKT_EVENT);
        } else {
            self.session.buffer().push(PKT_EVENT, event);
        }
    }

    /// Data pipe: unsolicited dump frames reuse the vendor opcode and
    /// are diverted, as are vendor log frames; ordinary ACL traffic
    /// goes to the consumer.
    fn route_data(&self, data: &[u8]) {
        if data.starts_with(&fwlog::DUMP_PREFIX) {
            if self.session.on_dump_start() {
                warn!("firmware dump started");
            }
            self.divert_diagnostic(data, PKT_DATA);
            if contains_dump_end(data) {
                info!("firmware dump complete");
            }
        } else if fwlog::is_diagnostic(data) {
            self.divert_diagnostic(data, PKT_DATA);
        } else {
            self.session.buffer().push(PKT_DATA, data);
        }
    }

    fn divert_diagnostic(&self, frame: &[u8], pkt_type: u8) {
        self.session.fwlog().push_event(frame);
        if self.mirror_diagnostics {
            self.session
                .buffer()
                .push_raw(&fwlog::mirror_frame(frame, pkt_type));
        }
        debug!("diverted {} diagnostic bytes", frame.len());
    }
}

/// Running pump; stops and joins on drop.
pub struct PumpHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PumpHandle {
    /// Signal the pump to stop and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn contains_dump_end(frame: &[u8]) -> bool {
    frame
        .windows(DUMP_END_MARKER.len())
        .any(|window| window == DUMP_END_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LinkState;
    use crate::testutil::MockTransport;

    fn pump_fixture() -> (Arc<MockTransport>, Arc<Session>, Arc<TrafficGate>) {
        let transport = Arc::new(MockTransport::default());
        let session = Arc::new(Session::new(4096));
        session.set_link_state(LinkState::Working);
        (transport, session, Arc::new(TrafficGate::new()))
    }

    #[test]
    fn test_gate_counts_nested_pauses() {
        let gate = Arc::new(TrafficGate::new());
        let outer = gate.pause();
        let inner = gate.pause();
        assert!(gate.is_paused());
        drop(inner);
        assert!(gate.is_paused());
        drop(outer);
        assert!(!gate.is_paused());
        assert!(gate.wait_open(Duration::from_millis(1)));
    }

    #[test]
    fn test_pump_routes_event_and_data() {
        let (transport, session, gate) = pump_fixture();
        transport.queue_event(&[0x3E, 0x02, 0x01, 0x00]);
        transport.queue_bulk(&[0x40, 0x00, 0x02, 0x00, 0xAA, 0xBB]);

        let pump = TrafficPump::new(
            Arc::clone(&transport),
            Arc::clone(&session),
            Arc::clone(&gate),
        );
        let handle = pump.spawn();
        // Give the pump a couple of poll cycles.
        thread::sleep(Duration::from_millis(100));
        handle.stop();

        let mut out = [0u8; 32];
        let n = session.buffer().read(&mut out, true).unwrap();
        assert_eq!(
            &out[..n],
            &[
                PKT_EVENT, 0x3E, 0x02, 0x01, 0x00, // tagged event
                PKT_DATA, 0x40, 0x00, 0x02, 0x00, 0xAA, 0xBB, // tagged data
            ]
        );
    }

    #[test]
    fn test_dump_frames_divert_and_latch() {
        let (transport, session, gate) = pump_fixture();
        let mut dump = vec![0x6F, 0xFC, 0x08, 0x00];
        dump.extend_from_slice(b"coredump");
        transport.queue_bulk(&dump);
        let mut tail = vec![0x6F, 0xFC, 0x04, 0x00];
        tail.extend_from_slice(b" end");
        transport.queue_bulk(&tail);

        let handle = TrafficPump::new(
            Arc::clone(&transport),
            Arc::clone(&session),
            Arc::clone(&gate),
        )
        .spawn();
        thread::sleep(Duration::from_millis(100));
        handle.stop();

        assert_eq!(session.link_state(), LinkState::FwDump);
        assert!(session.has_pending_error());
        assert_eq!(session.fwlog().len(), 2);
        // Nothing leaked into the consumer stream.
        assert!(session.buffer().is_empty());
    }

    #[test]
    fn test_vendor_log_on_data_pipe_diverted() {
        let (transport, session, gate) = pump_fixture();
        transport.queue_bulk(&[0xFF, 0x05, 0x02, 0x00, 0xAA, 0xBB]);

        let handle = TrafficPump::new(
            Arc::clone(&transport),
            Arc::clone(&session),
            Arc::clone(&gate),
        )
        .spawn();
        thread::sleep(Duration::from_millis(100));
        handle.stop();

        assert_eq!(session.fwlog().len(), 1);
        assert!(session.buffer().is_empty());
        // A vendor log is not a dump: no state change, no sticky code.
        assert_eq!(session.link_state(), LinkState::Working);
        assert!(!session.has_pending_error());
    }

    #[test]
    fn test_mirrored_diagnostics_reach_consumer() {
        let (transport, session, gate) = pump_fixture();
        transport.queue_event(&[0xFF, 0x05, 0x02, 0x00, 0x01, 0x02, 0x03]);

        let handle = TrafficPump::new(
            Arc::clone(&transport),
            Arc::clone(&session),
            Arc::clone(&gate),
        )
        .mirror_diagnostics(true)
        .spawn();
        thread::sleep(Duration::from_millis(100));
        handle.stop();

        assert_eq!(session.fwlog().len(), 1);
        let mut out = [0u8; 32];
        let n = session.buffer().read(&mut out, true).unwrap();
        assert_eq!(&out[..4], &[0xFF, 9, 0xFE, PKT_EVENT]);
        assert_eq!(n, 11);
    }

    #[test]
    fn test_pump_idles_outside_polling_states() {
        let (transport, session, gate) = pump_fixture();
        session.set_link_state(LinkState::Suspend);
        transport.queue_event(&[0x3E, 0x02, 0x01, 0x00]);

        let handle = TrafficPump::new(
            Arc::clone(&transport),
            Arc::clone(&session),
            Arc::clone(&gate),
        )
        .spawn();
        thread::sleep(Duration::from_millis(100));
        handle.stop();

        // The queued event was never polled.
        assert!(session.buffer().is_empty());
        assert_eq!(
            transport.poll_event(Duration::from_millis(1)).unwrap(),
            Some(vec![0x3E, 0x02, 0x01, 0x00])
        );
    }
}
