//! Consumer byte stream over a session.
//!
//! The host stack talks to the dongle through one stream: writes carry
//! a leading packet-type tag and are routed to the command or data
//! path, reads drain the tagged inbound stream from the ring buffer.
//! A sticky hardware error preempts reads exactly once as a synthetic
//! hardware-error event, after which the stream must be reopened.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{CommandDescriptor, ProtocolEngine};
use crate::ringbuf::PKT_DATA;
use crate::session::{LinkState, StreamState};
use crate::transport::Transport;

/// Packet type tag for command writes.
const PKT_COMMAND: u8 = 0x01;

/// Bound for one outbound data write.
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Re-check interval for a blocking read, so sticky errors and state
/// changes are noticed while the buffer stays empty.
const READ_POLL: Duration = Duration::from_millis(50);

/// The host-facing stream endpoint.
pub struct HostStream<T: Transport> {
    engine: Arc<ProtocolEngine<T>>,
    pending_tag: Mutex<Option<u8>>,
}

impl<T: Transport> HostStream<T> {
    /// Create a stream over the shared engine.
    pub fn new(engine: Arc<ProtocolEngine<T>>) -> Self {
        Self {
            engine,
            pending_tag: Mutex::new(None),
        }
    }

    fn pending_tag(&self) -> std::sync::MutexGuard<'_, Option<u8>> {
        match self.pending_tag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open the stream. The device must be fully operational.
    pub fn open(&self) -> Result<()> {
        let session = self.engine.session();
        if session.link_state() != LinkState::Working {
            warn!("open rejected, link is {:?}", session.link_state());
            return Err(Error::NotReady);
        }
        session.clear_reopen();
        session.set_stream_state(StreamState::Opened);
        *self.pending_tag() = None;
        info!("stream opened");
        Ok(())
    }

    /// Close the stream. Always succeeds locally.
    pub fn close(&self) {
        let session = self.engine.session();
        session.set_stream_state(StreamState::Closing);
        *self.pending_tag() = None;
        session.buffer().wake_readers();
        session.set_stream_state(StreamState::Closed);
        info!("stream closed");
    }

    /// Write one outbound packet. The first byte is the packet-type
    /// tag; a single-byte write buffers the tag and merges it with the
    /// next write.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let session = self.engine.session();
        if session.stream_state() != StreamState::Opened {
            return Err(Error::NotOpen);
        }
        if session.needs_reopen() {
            return Err(Error::NeedReopen);
        }
        if session.link_state() != LinkState::Working {
            return Err(Error::NotReady);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut pending = self.pending_tag();
        let (tag, payload) = match pending.take() {
            Some(tag) => (tag, buf),
            None if buf.len() == 1 => {
                // Tag split off from its packet; wait for the rest.
                debug!("buffering split type tag {:#04x}", buf[0]);
                *pending = Some(buf[0]);
                return Ok(1);
            },
            None => (buf[0], &buf[1..]),
        };
        drop(pending);

        match tag {
            PKT_COMMAND => {
                self.engine
                    .send_command(&CommandDescriptor::without_reply(payload.to_vec()))?;
            },
            PKT_DATA => {
                self.engine.transport().send_bulk(payload, WRITE_TIMEOUT)?;
            },
            other => {
                warn!("dropping write with unknown type tag {other:#04x}");
                return Err(Error::Transport(format!("unknown packet type {other:#04x}")));
            },
        }
        Ok(buf.len())
    }

    /// Read inbound bytes. A pending sticky hardware error is delivered
    /// first, exactly once, as the synthetic event `04 10 01 <code>`;
    /// afterwards the stream must be reopened.
    pub fn read(&self, buf: &mut [u8], non_blocking: bool) -> Result<usize> {
        let session = self.engine.session();
        loop {
            if let Some(code) = session.take_error() {
                let event = code.to_event();
                let n = event.len().min(buf.len());
                buf[..n].copy_from_slice(&event[..n]);
                warn!("delivering hardware error {code:?} to consumer");
                return Ok(n);
            }
            if session.needs_reopen() {
                return Err(Error::NeedReopen);
            }
            if session.stream_state() != StreamState::Opened {
                return Err(Error::NotOpen);
            }
            if session.link_state() != LinkState::Working {
                return Err(Error::NotReady);
            }

            if non_blocking {
                return session.buffer().read(buf, true);
            }
            let n = session.buffer().read_timeout(buf, READ_POLL)?;
            if n > 0 {
                return Ok(n);
            }
        }
    }

    /// Whether a read would return data without blocking.
    pub fn poll(&self) -> bool {
        let session = self.engine.session();
        session.has_pending_error() || session.buffer().has_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HardwareErrorCode;
    use crate::ringbuf::PKT_EVENT;
    use crate::testutil::{engine_fixture, MockTransport};

    fn open_stream() -> (HostStream<MockTransport>, Arc<MockTransport>) {
        let (engine, transport) = engine_fixture();
        let stream = HostStream::new(Arc::new(engine));
        stream.open().unwrap();
        (stream, transport)
    }

    #[test]
    fn test_open_rejected_when_not_working() {
        let (engine, _transport) = engine_fixture();
        let stream = HostStream::new(Arc::new(engine));
        stream
            .engine
            .session()
            .set_link_state(LinkState::Suspend);
        assert!(matches!(stream.open(), Err(Error::NotReady)));
    }

    #[test]
    fn test_write_routes_by_type_tag() {
        let (stream, transport) = open_stream();

        stream.write(&[0x01, 0x03, 0x0C, 0x00]).unwrap();
        stream.write(&[0x02, 0x40, 0x00, 0x01, 0x00, 0xAA]).unwrap();

        assert_eq!(transport.control_writes(), vec![vec![0x03, 0x0C, 0x00]]);
        assert_eq!(
            transport.bulk_writes(),
            vec![vec![0x40, 0x00, 0x01, 0x00, 0xAA]]
        );
    }

    #[test]
    fn test_split_tag_merged_with_next_write() {
        let (stream, transport) = open_stream();

        assert_eq!(stream.write(&[0x02]).unwrap(), 1);
        stream.write(&[0x40, 0x00, 0x01, 0x00, 0xBB]).unwrap();

        assert_eq!(
            transport.bulk_writes(),
            vec![vec![0x40, 0x00, 0x01, 0x00, 0xBB]]
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let (stream, _transport) = open_stream();
        assert!(stream.write(&[0x09, 0x00]).is_err());
    }

    #[test]
    fn test_sticky_error_read_once_then_reopen_required() {
        let (stream, _transport) = open_stream();
        let session = Arc::clone(stream.engine.session());
        session.latch_error(HardwareErrorCode::CoreDump);

        assert!(stream.poll());
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf, true).unwrap();
        assert_eq!(&buf[..n], &[0x04, 0x10, 0x01, 0xF2]);

        // Delivered once; further traffic needs a reopen.
        assert!(matches!(stream.write(&[0x02, 0x00]), Err(Error::NeedReopen)));
        stream.close();
        stream.open().unwrap();
        stream.write(&[0x02, 0x00, 0x00, 0x00, 0x00]).unwrap();
    }

    #[test]
    fn test_read_blocked_until_reopen_after_delivery() {
        let (stream, _transport) = open_stream();
        let session = Arc::clone(stream.engine.session());
        session.buffer().push(PKT_EVENT, &[0x3E, 0x02, 0x01, 0x00]);
        session.latch_error(HardwareErrorCode::ChipReset);

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf, true).unwrap();
        assert_eq!(&buf[..n], &[0x04, 0x10, 0x01, 0xF0]);

        // Queued bytes stay unreadable until the stream is reopened.
        assert!(matches!(
            stream.read(&mut buf, true),
            Err(Error::NeedReopen)
        ));
        stream.close();
        stream.open().unwrap();
        assert!(stream.read(&mut buf, true).unwrap() > 0);
    }

    #[test]
    fn test_read_drains_buffer() {
        let (stream, _transport) = open_stream();
        stream
            .engine
            .session()
            .buffer()
            .push(PKT_EVENT, &[0x3E, 0x02, 0x01, 0x00]);

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf, false).unwrap();
        assert_eq!(&buf[..n], &[PKT_EVENT, 0x3E, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_read_retry_later_while_suspended() {
        let (stream, _transport) = open_stream();
        stream
            .engine
            .session()
            .set_link_state(LinkState::Suspend);

        let mut buf = [0u8; 8];
        assert!(matches!(
            stream.read(&mut buf, true),
            Err(Error::NotReady)
        ));
    }

    #[test]
    fn test_write_rejected_when_closed() {
        let (stream, _transport) = open_stream();
        stream.close();
        assert!(matches!(stream.write(&[0x02, 0x00]), Err(Error::NotOpen)));
    }
}
