//! Serial transport implementation using the `serialport` crate.
//!
//! Serial-attached controllers multiplex all three pipes onto one wire
//! with a one-byte packet indicator (command 0x01, data 0x02, event
//! 0x04). The implementation demultiplexes inbound frames into per-pipe
//! queues so `poll_event` and `poll_bulk` keep their pipe semantics.

use {
    crate::{
        error::{Error, Result},
        transport::{SerialConfig, Transport},
    },
    log::trace,
    std::{
        collections::VecDeque,
        io::{Read, Write},
        sync::Mutex,
        time::{Duration, Instant},
    },
};

const IND_COMMAND: u8 = 0x01;
const IND_DATA: u8 = 0x02;
const IND_EVENT: u8 = 0x04;

struct Inner {
    port: Box<dyn serialport::SerialPort>,
    events: VecDeque<Vec<u8>>,
    bulks: VecDeque<Vec<u8>>,
    pending: Vec<u8>,
}

/// Serial-port-backed transport.
pub struct SerialTransport {
    inner: Mutex<Inner>,
    name: String,
}

impl SerialTransport {
    /// Open a serial transport with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .open()?;

        Ok(Self {
            inner: Mutex::new(Inner {
                port,
                events: VecDeque::new(),
                bulks: VecDeque::new(),
                pending: Vec::new(),
            }),
            name: config.port_name.clone(),
        })
    }

    /// Get the port name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Inner {
    /// Pull whatever is available off the wire and split complete frames
    /// into the per-pipe queues.
    fn fill(&mut self) {
        let mut buf = [0u8; 512];
        match self.port.read(&mut buf) {
            Ok(n) if n > 0 => self.pending.extend_from_slice(&buf[..n]),
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
            Err(e) => trace!("serial read error (ignoring): {e}"),
        }

        loop {
            let Some(total) = frame_len(&self.pending) else {
                break;
            };
            if self.pending.len() < total {
                break;
            }
            let rest = self.pending.split_off(total);
            let frame = std::mem::replace(&mut self.pending, rest);
            match frame[0] {
                IND_EVENT => self.events.push_back(frame[1..].to_vec()),
                IND_DATA => self.bulks.push_back(frame[1..].to_vec()),
                ind => {
                    trace!("dropping frame with unknown indicator {ind:#04x}");
                },
            }
        }
    }
}

/// Total on-wire length (indicator included) of the frame starting at the
/// head of `buf`, or `None` if the header is not complete yet.
fn frame_len(buf: &[u8]) -> Option<usize> {
    match buf.first()? {
        &IND_EVENT => {
            // indicator + event code + len byte + parameters
            let len = *buf.get(2)? as usize;
            Some(3 + len)
        },
        &IND_DATA => {
            // indicator + 4-byte data header with LE length at [3..5]
            let lo = *buf.get(3)? as usize;
            let hi = *buf.get(4)? as usize;
            Some(5 + (hi << 8 | lo))
        },
        _ => Some(1),
    }
}

impl Transport for SerialTransport {
    fn send_control(&self, cmd: &[u8]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Transport("serial lock poisoned".into()))?;
        inner.port.write_all(&[IND_COMMAND])?;
        inner.port.write_all(cmd)?;
        inner.port.flush()?;
        Ok(())
    }

    fn send_bulk(&self, data: &[u8], timeout: Duration) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Transport("serial lock poisoned".into()))?;
        inner.port.set_timeout(timeout)?;
        inner.port.write_all(&[IND_DATA])?;
        inner.port.write_all(data)?;
        inner.port.flush()?;
        Ok(())
    }

    fn poll_event(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| Error::Transport("serial lock poisoned".into()))?;
            if let Some(ev) = inner.events.pop_front() {
                return Ok(Some(ev));
            }
            inner.fill();
            if let Some(ev) = inner.events.pop_front() {
                return Ok(Some(ev));
            }
            drop(inner);
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn poll_bulk(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| Error::Transport("serial lock poisoned".into()))?;
            if let Some(frame) = inner.bulks.pop_front() {
                return Ok(Some(frame));
            }
            inner.fill();
            if let Some(frame) = inner.bulks.pop_front() {
                return Ok(Some(frame));
            }
            drop(inner);
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn control_read(&self, timeout: Duration) -> Result<Vec<u8>> {
        // WMT replies come back as events on a serial-attached part.
        match self.poll_event(timeout)? {
            Some(ev) => Ok(ev),
            None => Err(Error::Transport("no control reply".into())),
        }
    }
}
