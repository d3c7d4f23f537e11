//! Single-producer/single-consumer ring buffer with packet reassembly.
//!
//! Inbound frames are framed for the consumer with a one-byte packet
//! type tag. The wire protocol has no flow control, so overflow is
//! detected and counted rather than prevented; the oldest bytes are
//! dropped so the most recent `capacity` bytes survive. Only cursor
//! arithmetic is done under the lock; the reader sleeps on a condvar
//! tied to the cursors.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;

/// Packet type tag for data frames.
pub const PKT_DATA: u8 = 0x02;
/// Packet type tag for event frames.
pub const PKT_EVENT: u8 = 0x04;

/// Default buffer capacity.
pub const DEFAULT_CAPACITY: usize = 512 * 1024;

struct Inner {
    storage: Box<[u8]>,
    read_p: usize,
    write_p: usize,
    /// Bytes of an oversized data packet still expected; while non-zero
    /// no type tag is prepended.
    remainder: usize,
    overflow_count: u64,
    desync_count: u64,
}

/// Fixed-capacity circular transfer buffer between completion context
/// and the blocking consumer.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    readable: Condvar,
    capacity: usize,
}

impl RingBuffer {
    /// Create a buffer holding up to `capacity` bytes. One extra slot
    /// is allocated internally to tell full from empty.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                storage: vec![0u8; capacity + 1].into_boxed_slice(),
                read_p: 0,
                write_p: 0,
                remainder: 0,
                overflow_count: 0,
                desync_count: 0,
            }),
            readable: Condvar::new(),
            capacity,
        }
    }

    /// Usable buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one inbound frame, prefixing the packet type tag unless a
    /// prior oversized packet left a remainder to deliver.
    pub fn push(&self, tag: u8, payload: &[u8]) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let with_tag = if inner.remainder == 0 {
            // Framed size from the embedded little-endian length field.
            let total = framed_size(tag, payload);
            if total > payload.len() {
                inner.remainder = total - payload.len();
            }
            true
        } else {
            if payload.len() > inner.remainder {
                // Reassembly desync: recoverable, reset and log.
                inner.desync_count += 1;
                warn!(
                    "reassembly remainder underflow ({} < {}), resetting",
                    inner.remainder,
                    payload.len()
                );
                inner.remainder = 0;
            } else {
                inner.remainder -= payload.len();
            }
            false
        };

        if with_tag {
            inner.append(&[tag]);
        }
        inner.append(payload);
        drop(inner);
        self.readable.notify_all();
    }

    /// Append raw bytes with no tagging or length accounting. Used for
    /// synthetic events injected at the tail.
    pub fn push_raw(&self, bytes: &[u8]) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.append(bytes);
        drop(inner);
        self.readable.notify_all();
    }

    /// Copy up to `buf.len()` queued bytes, blocking until the cursors
    /// differ unless `non_blocking` is set (then an empty buffer reads
    /// zero bytes).
    pub fn read(&self, buf: &mut [u8], non_blocking: bool) -> crate::error::Result<usize> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        while inner.read_p == inner.write_p {
            if non_blocking {
                return Ok(0);
            }
            inner = match self.readable.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        Ok(inner.drain(buf))
    }

    /// Like [`read`](Self::read) but gives up after `timeout`.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> crate::error::Result<usize> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        while inner.read_p == inner.write_p {
            let (guard, result) = match self.readable.wait_timeout(inner, timeout) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner = guard;
            if result.timed_out() && inner.read_p == inner.write_p {
                return Ok(0);
            }
        }

        Ok(inner.drain(buf))
    }

    /// Whether any bytes are queued.
    pub fn has_data(&self) -> bool {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.read_p != inner.write_p
    }

    /// Number of queued bytes.
    pub fn len(&self) -> usize {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.used()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        !self.has_data()
    }

    /// Times the producer outran the consumer.
    pub fn overflow_count(&self) -> u64 {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.overflow_count
    }

    /// Times the reassembly remainder had to be reset.
    pub fn desync_count(&self) -> u64 {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.desync_count
    }

    /// Wake a reader blocked on an empty buffer without queuing data.
    pub fn wake_readers(&self) {
        self.readable.notify_all();
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Inner {
    /// Storage slots; one more than the usable capacity.
    fn slots(&self) -> usize {
        self.storage.len()
    }

    fn used(&self) -> usize {
        if self.read_p <= self.write_p {
            self.write_p - self.read_p
        } else {
            self.slots() - self.read_p + self.write_p
        }
    }

    /// Append bytes, wrapping as needed and dropping the oldest queued
    /// bytes on overflow.
    fn append(&mut self, mut bytes: &[u8]) {
        let slots = self.slots();
        let capacity = slots - 1;

        // A write longer than the buffer keeps only its tail.
        if bytes.len() > capacity {
            self.overflow_count += 1;
            warn!("write of {} bytes exceeds capacity {}", bytes.len(), capacity);
            bytes = &bytes[bytes.len() - capacity..];
        }

        let free = capacity - self.used();
        if bytes.len() > free {
            self.overflow_count += 1;
            warn!("queue is full, dropping {} oldest bytes", bytes.len() - free);
            let drop = bytes.len() - free;
            self.read_p = (self.read_p + drop) % slots;
        }

        let tail = slots - self.write_p;
        if bytes.len() <= tail {
            self.storage[self.write_p..self.write_p + bytes.len()].copy_from_slice(bytes);
        } else {
            self.storage[self.write_p..].copy_from_slice(&bytes[..tail]);
            self.storage[..bytes.len() - tail].copy_from_slice(&bytes[tail..]);
        }
        self.write_p = (self.write_p + bytes.len()) % slots;
    }

    /// Copy the available run into `buf`, advancing the read cursor.
    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let slots = self.slots();
        let avail = self.used();
        let want = buf.len().min(avail);

        let tail = slots - self.read_p;
        if want <= tail {
            buf[..want].copy_from_slice(&self.storage[self.read_p..self.read_p + want]);
        } else {
            buf[..tail].copy_from_slice(&self.storage[self.read_p..]);
            buf[tail..want].copy_from_slice(&self.storage[..want - tail]);
        }
        self.read_p = (self.read_p + want) % slots;
        want
    }
}

/// Total framed size of a packet given its type tag and the first frame
/// of its payload: events carry a one-byte parameter length, data frames
/// a 16-bit little-endian length after a four-byte header.
fn framed_size(tag: u8, payload: &[u8]) -> usize {
    match tag {
        PKT_DATA if payload.len() >= 4 => {
            4 + usize::from(u16::from_le_bytes([payload[2], payload[3]]))
        },
        PKT_EVENT if payload.len() >= 2 => 2 + payload[1] as usize,
        _ => payload.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn data_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x02, 0x00];
        frame.extend_from_slice(&u16::to_le_bytes(body.len() as u16));
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_fifo_order_preserved() {
        let ring = RingBuffer::new(256);
        let a = data_frame(&[0x11; 8]);
        let b = data_frame(&[0x22; 8]);
        ring.push(PKT_DATA, &a);
        ring.push(PKT_DATA, &b);

        let mut out = [0u8; 64];
        let n = ring.read(&mut out, true).unwrap();

        let mut expected = vec![PKT_DATA];
        expected.extend_from_slice(&a);
        expected.push(PKT_DATA);
        expected.extend_from_slice(&b);
        assert_eq!(&out[..n], &expected[..]);
    }

    #[test]
    fn test_wrap_at_last_byte_matches_straight_write() {
        // Fill so the next frame lands exactly on the wrap point.
        let cap = 64;
        let frame = data_frame(&[0xAB; 10]);

        let wrap = RingBuffer::new(cap);
        // Advance cursors to cap - 1 without leaving data behind.
        let pad = vec![0u8; cap - 1];
        wrap.push_raw(&pad);
        let mut sink = vec![0u8; cap];
        wrap.read(&mut sink, true).unwrap();

        wrap.push(PKT_DATA, &frame);
        let straight = RingBuffer::new(cap);
        straight.push(PKT_DATA, &frame);

        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        let na = wrap.read(&mut a, true).unwrap();
        let nb = straight.read(&mut b, true).unwrap();
        assert_eq!(&a[..na], &b[..nb]);
    }

    #[test]
    fn test_overflow_burst_keeps_most_recent() {
        let ring = RingBuffer::new(4096);
        let mut logical = Vec::new();
        // 5000-byte burst with no intervening read.
        for i in 0..5u8 {
            let body = vec![i; 996];
            let frame = data_frame(&body);
            logical.push(PKT_DATA);
            logical.extend_from_slice(&frame);
            ring.push(PKT_DATA, &frame);
        }
        assert!(logical.len() >= 5000);
        assert!(ring.overflow_count() >= 1);

        let mut out = vec![0u8; 8192];
        let n = ring.read(&mut out, true).unwrap();
        // The most recent `capacity` bytes survive the burst.
        assert_eq!(n, 4096);
        assert_eq!(&out[..n], &logical[logical.len() - 4096..]);
    }

    #[test]
    fn test_oversized_packet_remainder_suppresses_tag() {
        let ring = RingBuffer::new(256);
        // Frame declares 40 body bytes but only 16 arrive now.
        let mut first = vec![0x02, 0x00];
        first.extend_from_slice(&40u16.to_le_bytes());
        first.extend_from_slice(&[0xCC; 16]);
        ring.push(PKT_DATA, &first);
        // Continuation: no tag must be prepended.
        ring.push(PKT_DATA, &[0xDD; 24]);

        let mut out = [0u8; 128];
        let n = ring.read(&mut out, true).unwrap();
        // tag + 20 first-frame bytes + 24 continuation bytes
        assert_eq!(n, 1 + 20 + 24);
        assert_eq!(out[0], PKT_DATA);
        assert_eq!(out[21], 0xDD);
    }

    #[test]
    fn test_negative_remainder_recovers() {
        let ring = RingBuffer::new(256);
        let mut first = vec![0x02, 0x00];
        first.extend_from_slice(&10u16.to_le_bytes());
        first.extend_from_slice(&[0xEE; 4]);
        ring.push(PKT_DATA, &first);
        // More continuation bytes than the declared remainder.
        ring.push(PKT_DATA, &[0xFF; 32]);
        assert_eq!(ring.desync_count(), 1);

        // The buffer keeps working afterwards.
        let frame = data_frame(&[0x77; 4]);
        ring.push(PKT_DATA, &frame);
        assert!(ring.has_data());
    }

    #[test]
    fn test_blocking_read_wakes_on_push() {
        let ring = Arc::new(RingBuffer::new(128));
        let writer = Arc::clone(&ring);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.push(PKT_DATA, &data_frame(&[0x42; 4]));
        });

        let mut out = [0u8; 32];
        let n = ring.read(&mut out, false).unwrap();
        assert!(n > 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_non_blocking_empty_reads_zero() {
        let ring = RingBuffer::new(128);
        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out, true).unwrap(), 0);
    }
}
